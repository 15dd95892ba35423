//! Sample builder (C3): derives per-sample heading, speed, and inter-sample
//! delay from a route point sequence, with bounded variation and a minimum
//! speed floor.

use crate::route::RoutePoint;

const MIN_SPEED_MPS: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub point: RoutePoint,
    pub heading_deg: f64,
    pub speed_mps: f64,
    pub time_delta_s: f64,
}

/// Deterministic speed variation: a small sinusoidal oscillation plus a
/// headland slowdown, clamped to a bounded range so the profile stays
/// realistic while remaining perfectly repeatable across runs.
fn speed_variation(index: usize, is_active: bool) -> f64 {
    let oscillation = (index as f64 * 0.11).sin() * 0.04;
    let headland_adjustment = if is_active { 0.0 } else { -0.06 };
    (oscillation + headland_adjustment).clamp(-0.15, 0.08)
}

/// Build samples for an entire route sequence at the given sample rate.
pub fn build_samples(points: &[RoutePoint], sample_rate_hz: f64) -> Vec<Sample> {
    let mut samples = Vec::with_capacity(points.len());
    let mut last_heading = 0.0_f64;

    for (index, point) in points.iter().enumerate() {
        let (delta_east, delta_north) = if index == 0 && points.len() > 1 {
            let reference = points[1];
            (reference.east_m - point.east_m, reference.north_m - point.north_m)
        } else if index > 0 {
            let previous = points[index - 1];
            (point.east_m - previous.east_m, point.north_m - previous.north_m)
        } else {
            (0.0, 0.0)
        };

        let distance = (delta_east * delta_east + delta_north * delta_north).sqrt();

        let (heading_deg, speed_mps, time_delta_s) = if distance > 0.0 {
            let heading = (delta_east.atan2(delta_north).to_degrees() + 360.0) % 360.0;
            let base_speed = distance * sample_rate_hz;
            let variation = speed_variation(index, point.active);
            let speed = (base_speed * (1.0 + variation)).max(MIN_SPEED_MPS);
            last_heading = heading;
            (heading, speed, distance / speed)
        } else {
            (last_heading, 0.0, 1.0 / sample_rate_hz)
        };

        samples.push(Sample {
            point: *point,
            heading_deg,
            speed_mps,
            time_delta_s,
        });
    }

    samples
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_never_drops_below_floor() {
        let points = vec![
            RoutePoint::new(0.0, 0.0, true),
            RoutePoint::new(0.0, 0.001, true),
            RoutePoint::new(0.0, 0.002, false),
        ];
        for sample in build_samples(&points, 5.0) {
            assert!(sample.speed_mps >= MIN_SPEED_MPS || sample.speed_mps == 0.0);
            assert!(sample.time_delta_s > 0.0);
        }
    }

    #[test]
    fn stationary_point_inherits_prior_heading_and_zero_speed() {
        let points = vec![
            RoutePoint::new(0.0, 0.0, true),
            RoutePoint::new(0.0, 1.0, true),
            RoutePoint::new(0.0, 1.0, true),
        ];
        let samples = build_samples(&points, 5.0);
        assert_eq!(samples[2].speed_mps, 0.0);
        assert_eq!(samples[2].heading_deg, samples[1].heading_deg);
        assert_eq!(samples[2].time_delta_s, 1.0 / 5.0);
    }
}
