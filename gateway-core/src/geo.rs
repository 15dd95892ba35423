//! ENU ↔ geodetic projection (C4): equirectangular approximation anchored
//! at a configured base point. Valid within a few kilometres of the
//! anchor; longer baselines are out of scope.

use crate::coordinate::Coordinate;

const EARTH_RADIUS_M: f64 = 6_378_137.0;

#[derive(Debug, Clone, Copy)]
pub struct GeoAnchor {
    pub base_lat: f64,
    pub base_lon: f64,
}

impl GeoAnchor {
    pub fn new(base_lat: f64, base_lon: f64) -> Self {
        Self { base_lat, base_lon }
    }

    /// Project a local ENU point to `(lat, lon)` degrees.
    pub fn to_geodetic(&self, point: Coordinate) -> (f64, f64) {
        let base_lat_rad = self.base_lat.to_radians();
        let lat = self.base_lat + (point.y / EARTH_RADIUS_M).to_degrees();
        let lon =
            self.base_lon + (point.x / (EARTH_RADIUS_M * base_lat_rad.cos())).to_degrees();
        (lat, lon)
    }

    /// Project `(lat, lon)` degrees to a local ENU point.
    pub fn to_enu(&self, lat: f64, lon: f64) -> Coordinate {
        let base_lat_rad = self.base_lat.to_radians();
        let east = (lon - self.base_lon).to_radians() * EARTH_RADIUS_M * base_lat_rad.cos();
        let north = (lat - self.base_lat).to_radians() * EARTH_RADIUS_M;
        Coordinate::new(east, north)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_within_tolerance() {
        let anchor = GeoAnchor::new(-22.0, -47.0);
        let point = Coordinate::new(123.4, -456.7);
        let (lat, lon) = anchor.to_geodetic(point);
        let back = anchor.to_enu(lat, lon);
        assert!((back.x - point.x).abs() < 1e-6);
        assert!((back.y - point.y).abs() < 1e-6);
    }

    #[test]
    fn base_anchor_maps_to_origin() {
        let anchor = GeoAnchor::new(-22.0, -47.0);
        let (lat, lon) = anchor.to_geodetic(Coordinate::ORIGIN);
        assert!((lat - anchor.base_lat).abs() < 1e-12);
        assert!((lon - anchor.base_lon).abs() < 1e-12);
    }
}
