//! Gateway configuration (C8 support): one `GatewayConfig` value loaded
//! from a TOML file with field-level defaults, overridable by environment
//! variables the way `gatewayd` wires up at startup.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

fn default_tcp_host() -> String {
    "0.0.0.0".into()
}
fn default_tcp_port() -> u16 {
    7777
}
fn default_true() -> bool {
    true
}
fn default_bt_channel() -> u8 {
    1
}
fn default_service_name() -> String {
    "MAGateway".into()
}
fn default_systemd_unit() -> String {
    "magateway".into()
}
fn default_field_length_m() -> f64 {
    300.0
}
fn default_headland_length_m() -> f64 {
    20.0
}
fn default_speed_mps() -> f64 {
    2.5
}
fn default_sample_rate_hz() -> f64 {
    2.0
}
fn default_passes_per_cycle() -> u32 {
    8
}
fn default_base_lat() -> f64 {
    -22.0
}
fn default_base_lon() -> f64 {
    -47.0
}
fn default_altitude_m() -> f64 {
    550.0
}

/// Top-level gateway configuration, deserialized from TOML. Every field
/// carries a default so a minimal or empty file is always valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    #[serde(default = "default_tcp_host")]
    pub tcp_host: String,
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,

    #[serde(default = "default_true")]
    pub enable_bluetooth: bool,
    #[serde(default = "default_bt_channel")]
    pub bluetooth_channel: u8,
    #[serde(default = "default_service_name")]
    pub bluetooth_service_name: String,
    #[serde(default = "default_systemd_unit")]
    pub systemd_unit_name: String,

    pub implement_profile_path: Option<PathBuf>,

    #[serde(default = "default_true")]
    pub enable_planter_simulator: bool,
    #[serde(default = "default_field_length_m")]
    pub simulator_field_length_m: f64,
    #[serde(default = "default_headland_length_m")]
    pub simulator_headland_length_m: f64,
    #[serde(default = "default_speed_mps")]
    pub simulator_speed_mps: f64,
    #[serde(default = "default_sample_rate_hz")]
    pub simulator_sample_rate_hz: f64,
    #[serde(default = "default_passes_per_cycle")]
    pub simulator_passes_per_cycle: u32,
    #[serde(default = "default_base_lat")]
    pub simulator_base_lat: f64,
    #[serde(default = "default_base_lon")]
    pub simulator_base_lon: f64,
    #[serde(default = "default_altitude_m")]
    pub simulator_altitude_m: f64,

    pub route_file_path: Option<PathBuf>,
    pub route_file_format: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            tcp_host: default_tcp_host(),
            tcp_port: default_tcp_port(),
            enable_bluetooth: true,
            bluetooth_channel: default_bt_channel(),
            bluetooth_service_name: default_service_name(),
            systemd_unit_name: default_systemd_unit(),
            implement_profile_path: None,
            enable_planter_simulator: true,
            simulator_field_length_m: default_field_length_m(),
            simulator_headland_length_m: default_headland_length_m(),
            simulator_speed_mps: default_speed_mps(),
            simulator_sample_rate_hz: default_sample_rate_hz(),
            simulator_passes_per_cycle: default_passes_per_cycle(),
            simulator_base_lat: default_base_lat(),
            simulator_base_lon: default_base_lon(),
            simulator_altitude_m: default_altitude_m(),
            route_file_path: None,
            route_file_format: None,
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a TOML file at `path`, falling back to
    /// defaults entirely if the file does not exist.
    pub fn load(path: &std::path::Path) -> Result<Self, crate::error::GatewayError> {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| crate::error::GatewayError::InvalidConfig(e.to_string()))
    }

    pub fn planter_config(&self) -> crate::planter::PlanterConfig {
        crate::planter::PlanterConfig {
            field_length_m: self.simulator_field_length_m,
            headland_length_m: self.simulator_headland_length_m,
            speed_mps: self.simulator_speed_mps,
            sample_rate_hz: self.simulator_sample_rate_hz,
            passes_per_cycle: self.simulator_passes_per_cycle,
            base_lat: self.simulator_base_lat,
            base_lon: self.simulator_base_lon,
            altitude_m: self.simulator_altitude_m,
            ..crate::planter::PlanterConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_documented_values() {
        let config = GatewayConfig::default();
        assert_eq!(config.tcp_port, 7777);
        assert_eq!(config.bluetooth_channel, 1);
        assert_eq!(config.simulator_passes_per_cycle, 8);
        assert!(config.enable_planter_simulator);
    }

    #[test]
    fn partial_toml_fills_remaining_defaults() {
        let parsed: GatewayConfig = toml::from_str("tcp_port = 9000\n").unwrap();
        assert_eq!(parsed.tcp_port, 9000);
        assert_eq!(parsed.tcp_host, "0.0.0.0");
        assert_eq!(parsed.simulator_base_lat, -22.0);
    }

    #[test]
    fn load_missing_file_returns_default() {
        let config = GatewayConfig::load(std::path::Path::new("/no/such/gateway.toml")).unwrap();
        assert_eq!(config.tcp_port, 7777);
    }
}
