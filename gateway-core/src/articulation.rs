//! Articulated-implement kinematics (C1).
//!
//! Pure, deterministic function from antenna motion history to the
//! articulation joint position, implement axis, and implement centre.
//! Headings follow the convention used by the monitor app: `0` radians
//! points north, rotation increases clockwise.

use crate::coordinate::{clamp, wrap_angle, Coordinate};

const EPS_STEP: f64 = 0.01;
const EPS_IMPL: f64 = 0.01;

/// Frozen snapshot of one articulation computation.
#[derive(Debug, Clone, PartialEq)]
pub struct ArticulationState {
    pub last_center: Coordinate,
    pub current_center: Coordinate,
    pub articulation_point: Coordinate,
    /// Unit 2-vector pointing from the joint toward the trailing tool.
    pub axis: (f64, f64),
    /// Implement heading in radians, wrapped to `[-pi, pi)`.
    pub theta: f64,
    pub significant_motion: bool,
}

/// Inputs carried between successive calls so the implement heading can lag
/// the tractor's motion realistically instead of snapping to it each sample.
#[derive(Debug, Clone, Default)]
pub struct ArticulationHistory {
    pub impl_theta: Option<f64>,
    pub prev_displacement: Option<(f64, f64)>,
    pub last_fwd: Option<(f64, f64)>,
    pub last_right: Option<(f64, f64)>,
}

#[allow(clippy::too_many_arguments)]
pub fn compute(
    last_xy: Coordinate,
    cur_xy: Coordinate,
    fwd: (f64, f64),
    right: (f64, f64),
    antenna_offset: f64,
    long_offset: f64,
    lat_offset: f64,
    work_width: f64,
    articulation_to_tool: Option<f64>,
    tractor_heading: Option<f64>,
    history: &ArticulationHistory,
) -> ArticulationState {
    let l_hitch = (antenna_offset + long_offset).max(0.1);
    let l_impl = articulation_to_tool.unwrap_or_else(|| (0.5 * work_width).max(1.0));

    // 2. Joint position for the current step.
    let joint = Coordinate::new(
        cur_xy.x - l_hitch * fwd.0 + lat_offset * right.0,
        cur_xy.y - l_hitch * fwd.1 + lat_offset * right.1,
    );

    // 3. Tractor heading.
    let displacement = cur_xy.delta(&last_xy);
    let dist = displacement.hypot();
    let heading_cur = if dist >= EPS_STEP {
        displacement.x.atan2(displacement.y)
    } else if let Some(h) = tractor_heading {
        h
    } else if let Some(theta) = history.impl_theta {
        theta
    } else {
        0.0
    };

    // 4. Curvature from the change in displacement vectors.
    let kappa = match history.prev_displacement {
        Some((prev_dx, prev_dy)) if dist >= EPS_STEP => {
            let prev_dist = Coordinate::new(prev_dx, prev_dy).hypot();
            if prev_dist >= EPS_STEP {
                let prev_heading = prev_dx.atan2(prev_dy);
                let heading_disp = displacement.x.atan2(displacement.y);
                wrap_angle(heading_disp - prev_heading) / dist.max(1e-6)
            } else {
                0.0
            }
        }
        _ => 0.0,
    };

    // 5. Implement heading: integrate, then relax toward the tractor heading.
    let theta_i = match history.impl_theta {
        None => heading_cur,
        Some(prev_theta) => {
            let alpha = clamp(l_hitch / (l_hitch + l_impl), 0.3, 0.9);
            let integrated = wrap_angle(prev_theta + alpha * kappa * dist);
            let err = wrap_angle(heading_cur - integrated);
            let relax = clamp(dist / l_impl.max(0.1), 0.0, 1.0);
            wrap_angle(integrated + (1.0 - alpha) * err * relax)
        }
    };

    // 6. Axis: unit vector from the joint toward the trailing tool.
    let axis = Coordinate::new(-theta_i.sin(), -theta_i.cos()).normalized();

    // 7. Current implement centre.
    let current_center = joint.translate(l_impl * axis.x, l_impl * axis.y);

    // 8. Previous joint and axis, falling back to current orientation when
    // the caller has no history for the prior step.
    let fwd_prev = history.last_fwd.unwrap_or(fwd);
    let right_prev = history.last_right.unwrap_or(right);
    let joint_prev = Coordinate::new(
        last_xy.x - l_hitch * fwd_prev.0 + lat_offset * right_prev.0,
        last_xy.y - l_hitch * fwd_prev.1 + lat_offset * right_prev.1,
    );
    let axis_prev = match history.impl_theta {
        None => axis,
        Some(theta) => Coordinate::new(-theta.sin(), -theta.cos()).normalized(),
    };
    let last_center = joint_prev.translate(l_impl * axis_prev.x, l_impl * axis_prev.y);

    let significant_motion = current_center.distance_to(&last_center) >= EPS_IMPL;

    ArticulationState {
        last_center,
        current_center,
        articulation_point: joint,
        axis: (axis.x, axis.y),
        theta: theta_i,
        significant_motion,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fwd_right_for(heading_rad: f64) -> ((f64, f64), (f64, f64)) {
        let fwd = (heading_rad.sin(), heading_rad.cos());
        let right = (fwd.1, -fwd.0);
        (fwd, right)
    }

    #[test]
    fn theta_stays_in_wrapped_range() {
        let mut history = ArticulationHistory::default();
        let mut last_xy = Coordinate::new(0.0, 0.0);
        for i in 0..200 {
            let heading = (i as f64) * 0.3;
            let (fwd, right) = fwd_right_for(heading);
            let cur_xy = last_xy.translate(fwd.0 * 1.5, fwd.1 * 1.5);
            let state = compute(
                last_xy, cur_xy, fwd, right, 1.0, 0.5, 0.0, 2.0, None, None, &history,
            );
            assert!(state.theta >= -std::f64::consts::PI && state.theta < std::f64::consts::PI);
            history.prev_displacement = Some((cur_xy.x - last_xy.x, cur_xy.y - last_xy.y));
            history.impl_theta = Some(state.theta);
            history.last_fwd = Some(fwd);
            history.last_right = Some(right);
            last_xy = cur_xy;
        }
    }

    #[test]
    fn antenna_to_joint_distance_matches_offsets() {
        let (fwd, right) = fwd_right_for(0.0);
        let last_xy = Coordinate::new(0.0, 0.0);
        let cur_xy = Coordinate::new(0.0, 1.0);
        let history = ArticulationHistory::default();
        let state = compute(
            last_xy, cur_xy, fwd, right, 1.2, 0.3, 0.0, 2.0, None, None, &history,
        );
        let expected = 1.2 + 0.3;
        let actual = cur_xy.distance_to(&state.articulation_point);
        assert!((actual - expected).abs() < 0.01);
    }

    #[test]
    fn first_call_initialises_heading_to_tractor_heading() {
        let (fwd, right) = fwd_right_for(0.0);
        let last_xy = Coordinate::new(0.0, 0.0);
        let cur_xy = Coordinate::new(0.0, 1.0);
        let history = ArticulationHistory::default();
        let state = compute(
            last_xy, cur_xy, fwd, right, 1.0, 0.0, 0.0, 2.0, None, None, &history,
        );
        assert!((state.theta - 0.0).abs() < 1e-9);
    }
}
