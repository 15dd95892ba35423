//! Route generation (C2): a deterministic serpentine field pattern, or an
//! externally supplied route from an inline list or a GeoJSON/plain-JSON
//! file.

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::GatewayError;
use crate::geo::GeoAnchor;

/// One point of a generated or loaded route: local ENU position plus
/// whether the implement should be treated as actively planting there.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoutePoint {
    pub east_m: f64,
    pub north_m: f64,
    pub active: bool,
}

impl RoutePoint {
    pub fn new(east_m: f64, north_m: f64, active: bool) -> Self {
        Self {
            east_m,
            north_m,
            active,
        }
    }
}

/// Generate one serpentine cycle: `passes_per_cycle` lanes, each a full
/// traversal of the field with the implement active, separated by a
/// headland turn with the implement inactive.
pub fn generate_serpentine(
    field_length_m: f64,
    headland_length_m: f64,
    implement_width_m: f64,
    passes_per_cycle: u32,
    step: f64,
) -> Vec<RoutePoint> {
    let target_passes = passes_per_cycle.max(2);
    let mut points: Vec<RoutePoint> = Vec::new();
    let mut lane_index: u32 = 0;
    let mut direction: i32 = 1;
    let mut last_point: Option<(f64, f64)> = None;
    let mut passes_completed = 0u32;

    while passes_completed < target_passes {
        let x = lane_index as f64 * implement_width_m;
        let start_y = if direction > 0 { 0.0 } else { field_length_m };
        let end_y = if direction > 0 { field_length_m } else { 0.0 };

        for pt in interpolate((x, start_y), (x, end_y), step, last_point) {
            points.push(RoutePoint::new(pt.0, pt.1, true));
            last_point = Some(pt);
        }

        let headland_y = end_y + (direction as f64) * headland_length_m;
        if headland_length_m > 0.0 {
            for pt in interpolate((x, end_y), (x, headland_y), step, last_point) {
                if Some(pt) == last_point {
                    continue;
                }
                points.push(RoutePoint::new(pt.0, pt.1, false));
                last_point = Some(pt);
            }
        }

        let next_lane = (lane_index + 1) % passes_per_cycle.max(1);
        let next_x = next_lane as f64 * implement_width_m;
        for pt in interpolate((x, headland_y), (next_x, headland_y), step, last_point) {
            if Some(pt) == last_point {
                continue;
            }
            points.push(RoutePoint::new(pt.0, pt.1, false));
            last_point = Some(pt);
        }

        let next_direction = -direction;
        let start_next_y = if next_direction > 0 {
            0.0
        } else {
            field_length_m
        };
        for pt in interpolate((next_x, headland_y), (next_x, start_next_y), step, last_point) {
            if Some(pt) == last_point {
                continue;
            }
            points.push(RoutePoint::new(pt.0, pt.1, false));
            last_point = Some(pt);
        }

        lane_index = next_lane;
        direction = next_direction;
        passes_completed += 1;
    }

    points
}

/// Interpolate evenly spaced points between `start` and `end` at `step`
/// spacing, suppressing a point that duplicates `last_point`. A
/// zero-length segment yields its single point once, unless it already
/// equals `last_point`.
fn interpolate(
    start: (f64, f64),
    end: (f64, f64),
    step: f64,
    last_point: Option<(f64, f64)>,
) -> Vec<(f64, f64)> {
    let (x0, y0) = start;
    let (x1, y1) = end;
    let distance = ((x1 - x0).powi(2) + (y1 - y0).powi(2)).sqrt();

    if distance == 0.0 {
        return if last_point == Some((x0, y0)) {
            Vec::new()
        } else {
            vec![(x0, y0)]
        };
    }

    let steps = ((distance / step).ceil() as i64).max(1);
    let mut out = Vec::with_capacity(steps as usize + 1);
    for index in 0..=steps {
        let t = (index as f64 / steps as f64).min(1.0);
        let point = (x0 + (x1 - x0) * t, y0 + (y1 - y0) * t);
        if last_point == Some(point) {
            continue;
        }
        out.push(point);
    }
    out
}

// ── External route ingestion ───────────────────────────────────────────────

/// Normalize one inline route point given either east/north meters or
/// lat/lon degrees (projected via `anchor`), plus an optional `active` flag
/// defaulting to `true`.
pub fn normalize_inline_point(value: &Value, anchor: &GeoAnchor) -> Result<RoutePoint, GatewayError> {
    let active = value
        .get("active")
        .and_then(Value::as_bool)
        .unwrap_or(true);

    if let (Some(east), Some(north)) = (
        value.get("east_m").and_then(Value::as_f64),
        value.get("north_m").and_then(Value::as_f64),
    ) {
        return Ok(RoutePoint::new(east, north, active));
    }
    if let (Some(lat), Some(lon)) = (
        value.get("lat").or(value.get("latitude")).and_then(Value::as_f64),
        value.get("lon").or(value.get("longitude")).and_then(Value::as_f64),
    ) {
        let enu = anchor.to_enu(lat, lon);
        return Ok(RoutePoint::new(enu.x, enu.y, active));
    }
    if let Some(arr) = value.as_array() {
        if arr.len() >= 2 {
            let east = arr[0].as_f64().ok_or_else(|| {
                GatewayError::InvalidRoute("tuple route point missing east coordinate".into())
            })?;
            let north = arr[1].as_f64().ok_or_else(|| {
                GatewayError::InvalidRoute("tuple route point missing north coordinate".into())
            })?;
            let active = arr.get(2).and_then(Value::as_bool).unwrap_or(true);
            return Ok(RoutePoint::new(east, north, active));
        }
    }
    Err(GatewayError::InvalidRoute(
        "route point is neither east/north, lat/lon, nor a coordinate tuple".into(),
    ))
}

pub fn load_inline_route(points: &[Value], anchor: &GeoAnchor) -> Result<Vec<RoutePoint>, GatewayError> {
    points
        .iter()
        .map(|p| normalize_inline_point(p, anchor))
        .collect()
}

/// Resolve `file_name` against an ordered list of candidate directories
/// (caller-supplied: cwd, agent root, agent-root config dir, bundled
/// routes), returning the first existing match.
pub fn resolve_route_path(file_name: &Path, search_roots: &[PathBuf]) -> Option<PathBuf> {
    if file_name.is_absolute() && file_name.exists() {
        return Some(file_name.to_path_buf());
    }
    search_roots
        .iter()
        .map(|root| root.join(file_name))
        .find(|candidate| candidate.exists())
}

/// Load a route from a file, dispatching on contents: plain JSON
/// (`{"points": [...]}` or a bare list) or GeoJSON
/// (`FeatureCollection`/`Feature`/raw geometry, `LineString`/`MultiLineString`).
pub fn load_route_from_json(contents: &str, anchor: &GeoAnchor) -> Result<Vec<RoutePoint>, GatewayError> {
    let value: Value = serde_json::from_str(contents)
        .map_err(|e| GatewayError::InvalidRoute(format!("invalid JSON: {e}")))?;

    if is_geojson(&value) {
        return load_geojson(&value, anchor);
    }

    let points = if let Some(points) = value.get("points").and_then(Value::as_array) {
        points.clone()
    } else if let Some(arr) = value.as_array() {
        arr.clone()
    } else {
        return Err(GatewayError::InvalidRoute(
            "route file is neither {points: [...]} nor a bare list".into(),
        ));
    };

    if points.is_empty() {
        return Err(GatewayError::InvalidRoute("route file has no points".into()));
    }
    load_inline_route(&points, anchor)
}

fn is_geojson(value: &Value) -> bool {
    matches!(
        value.get("type").and_then(Value::as_str),
        Some("FeatureCollection") | Some("Feature") | Some("LineString") | Some("MultiLineString")
    )
}

fn load_geojson(value: &Value, anchor: &GeoAnchor) -> Result<Vec<RoutePoint>, GatewayError> {
    let mut out = Vec::new();
    match value.get("type").and_then(Value::as_str) {
        Some("FeatureCollection") => {
            for feature in value
                .get("features")
                .and_then(Value::as_array)
                .unwrap_or(&Vec::new())
            {
                out.extend(load_geojson_feature(feature, anchor)?);
            }
        }
        Some("Feature") => out.extend(load_geojson_feature(value, anchor)?),
        Some("LineString") | Some("MultiLineString") => {
            out.extend(load_geojson_geometry(value, true, anchor)?)
        }
        _ => {
            return Err(GatewayError::InvalidRoute(
                "unsupported GeoJSON type".into(),
            ))
        }
    }
    if out.is_empty() {
        return Err(GatewayError::InvalidRoute(
            "GeoJSON route contains no points".into(),
        ));
    }
    Ok(out)
}

fn load_geojson_feature(feature: &Value, anchor: &GeoAnchor) -> Result<Vec<RoutePoint>, GatewayError> {
    let active = feature
        .get("properties")
        .and_then(|p| p.get("active"))
        .and_then(Value::as_bool)
        .unwrap_or(true);
    let geometry = feature.get("geometry").ok_or_else(|| {
        GatewayError::InvalidRoute("GeoJSON feature missing geometry".into())
    })?;
    load_geojson_geometry(geometry, active, anchor)
}

fn load_geojson_geometry(
    geometry: &Value,
    active: bool,
    anchor: &GeoAnchor,
) -> Result<Vec<RoutePoint>, GatewayError> {
    match geometry.get("type").and_then(Value::as_str) {
        Some("LineString") => {
            let coords = geometry
                .get("coordinates")
                .and_then(Value::as_array)
                .ok_or_else(|| GatewayError::InvalidRoute("LineString missing coordinates".into()))?;
            Ok(coords
                .iter()
                .filter_map(|c| lon_lat_to_point(c, active, anchor))
                .collect())
        }
        Some("MultiLineString") => {
            let lines = geometry
                .get("coordinates")
                .and_then(Value::as_array)
                .ok_or_else(|| {
                    GatewayError::InvalidRoute("MultiLineString missing coordinates".into())
                })?;
            let mut out = Vec::new();
            for line in lines {
                if let Some(coords) = line.as_array() {
                    out.extend(coords.iter().filter_map(|c| lon_lat_to_point(c, active, anchor)));
                }
            }
            Ok(out)
        }
        other => Err(GatewayError::InvalidRoute(format!(
            "unsupported geometry type: {other:?}"
        ))),
    }
}

fn lon_lat_to_point(coord: &Value, active: bool, anchor: &GeoAnchor) -> Option<RoutePoint> {
    let arr = coord.as_array()?;
    let lon = arr.first()?.as_f64()?;
    let lat = arr.get(1)?.as_f64()?;
    let enu = anchor.to_enu(lat, lon);
    Some(RoutePoint::new(enu.x, enu.y, active))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serpentine_has_expected_number_of_active_runs() {
        let points = generate_serpentine(20.0, 3.0, 2.0, 2, 1.0);
        let mut runs = 0;
        let mut in_run = false;
        let mut last_x: Option<f64> = None;
        for p in &points {
            if p.active && !in_run {
                runs += 1;
                in_run = true;
                last_x = Some(p.east_m);
            } else if p.active {
                assert_eq!(Some(p.east_m), last_x, "active run must hold constant x");
            } else {
                in_run = false;
            }
        }
        assert_eq!(runs, 2);
    }

    #[test]
    fn consecutive_points_bounded_by_step() {
        let step = 1.0;
        let points = generate_serpentine(20.0, 3.0, 2.0, 2, step);
        for w in points.windows(2) {
            let dx = w[1].east_m - w[0].east_m;
            let dy = w[1].north_m - w[0].north_m;
            let dist = (dx * dx + dy * dy).sqrt();
            assert!(dist <= step + 1e-6, "gap {dist} exceeds step {step}");
        }
    }

    #[test]
    fn normalize_inline_point_prefers_east_north() {
        let anchor = GeoAnchor::new(-22.0, -47.0);
        let v: Value = serde_json::json!({"east_m": 1.0, "north_m": 2.0, "active": false});
        let pt = normalize_inline_point(&v, &anchor).unwrap();
        assert_eq!(pt, RoutePoint::new(1.0, 2.0, false));
    }

    #[test]
    fn loads_plain_points_list() {
        let anchor = GeoAnchor::new(-22.0, -47.0);
        let json = r#"{"points": [{"east_m": 0.0, "north_m": 0.0}, {"east_m": 1.0, "north_m": 0.0, "active": false}]}"#;
        let points = load_route_from_json(json, &anchor).unwrap();
        assert_eq!(points.len(), 2);
        assert!(points[0].active);
        assert!(!points[1].active);
    }

    #[test]
    fn loads_geojson_linestring() {
        let anchor = GeoAnchor::new(-22.0, -47.0);
        let json = r#"{"type":"LineString","coordinates":[[-47.0,-22.0],[-47.0001,-22.0001]]}"#;
        let points = load_route_from_json(json, &anchor).unwrap();
        assert_eq!(points.len(), 2);
    }
}
