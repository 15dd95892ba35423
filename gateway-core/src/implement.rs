//! Implement profile: static configuration describing the attached
//! planter/implement, loaded from a caller-supplied path with a
//! bundled-default fallback.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::GatewayError;

const DEFAULT_PROFILE_JSON: &str = include_str!("../data/implement_default.json");

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SectionProfile {
    pub kind: String,
    pub count: u32,
    #[serde(default)]
    pub supports_variable_rate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width_m: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImplementProfile {
    pub role: String,
    pub name: String,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub row_count: u32,
    pub row_spacing_m: f64,
    pub hitch_to_tool_m: f64,
    #[serde(default)]
    pub articulated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub antenna_to_articulation_m: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub articulation_to_tool_m: Option<f64>,
    #[serde(default)]
    pub sections: Vec<SectionProfile>,
}

impl ImplementProfile {
    /// Invariant: the implement's working width is `row_count * row_spacing_m`.
    pub fn working_width_m(&self) -> f64 {
        self.row_count as f64 * self.row_spacing_m
    }

    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("ImplementProfile always serializes")
    }
}

/// Load the implement profile, trying `explicit_path` first, then falling
/// back to the bundled default resource when no candidate path exists or
/// fails to parse.
pub fn load_implement_profile(explicit_path: Option<&Path>) -> ImplementProfile {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(path) = explicit_path {
        candidates.push(path.to_path_buf());
    }

    for candidate in &candidates {
        if !candidate.exists() {
            continue;
        }
        match std::fs::read_to_string(candidate).map_err(GatewayError::from).and_then(|s| {
            serde_json::from_str::<ImplementProfile>(&s)
                .map_err(|e| GatewayError::InvalidImplementProfile(e.to_string()))
        }) {
            Ok(profile) => {
                info!(path = %candidate.display(), "using implement configuration");
                return profile;
            }
            Err(e) => warn!(path = %candidate.display(), error = %e, "failed to load implement configuration"),
        }
    }

    warn!("implement configuration not found; falling back to bundled default");
    serde_json::from_str(DEFAULT_PROFILE_JSON).expect("bundled implement profile is valid JSON")
}
