//! Planter simulator (C5): one worker thread per registered session,
//! composing the route generator, sample builder, articulation model, and
//! geodetic projector into `GNSS_FIX` messages at the configured rate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use gateway_protocol::{gnss_fix_message, Message};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::articulation::{self, ArticulationHistory};
use crate::coordinate::Coordinate;
use crate::geo::GeoAnchor;
use crate::gnss::SessionId;
use crate::implement::ImplementProfile;
use crate::route::{generate_serpentine, RoutePoint};
use crate::sample::{build_samples, Sample};

/// A session the publisher can stream `GNSS_FIX` messages into. Kept
/// decoupled from the concrete [`crate::session::Session`] type so the
/// simulator can be tested without a real connection.
pub trait TelemetryTarget: Send + Sync {
    fn id(&self) -> SessionId;
    fn can_stream(&self) -> bool;
    /// True while a previously sent `GNSS_FIX` is still unacknowledged —
    /// the publisher skips sending the next fix until the peer catches up.
    fn awaiting_ack(&self) -> bool;
    fn send_message(&self, message: Message) -> bool;
}

pub trait TelemetryPublisher: Send + Sync {
    fn register_session(&self, session: Arc<dyn TelemetryTarget>);
    fn unregister_session(&self, session_id: SessionId);
}

#[derive(Debug, Clone)]
pub struct PlanterConfig {
    pub field_length_m: f64,
    pub headland_length_m: f64,
    pub speed_mps: f64,
    pub sample_rate_hz: f64,
    pub passes_per_cycle: u32,
    pub base_lat: f64,
    pub base_lon: f64,
    pub altitude_m: f64,
    pub accuracy_m: f64,
    pub loop_forever: bool,
}

impl Default for PlanterConfig {
    fn default() -> Self {
        Self {
            field_length_m: 300.0,
            headland_length_m: 20.0,
            speed_mps: 2.5,
            sample_rate_hz: 2.0,
            passes_per_cycle: 8,
            base_lat: -22.0,
            base_lon: -47.0,
            altitude_m: 550.0,
            accuracy_m: 0.05,
            loop_forever: true,
        }
    }
}

impl PlanterConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.sample_rate_hz <= 0.0 {
            return Err("sample_rate_hz must be positive".into());
        }
        if self.speed_mps <= 0.0 {
            return Err("speed_mps must be positive".into());
        }
        if self.field_length_m <= 0.0 {
            return Err("field_length_m must be positive".into());
        }
        if self.headland_length_m < 0.0 {
            return Err("headland_length_m must be non-negative".into());
        }
        if self.passes_per_cycle < 2 {
            return Err("passes_per_cycle must be at least 2".into());
        }
        Ok(())
    }
}

struct WorkerHandle {
    stop_flag: Arc<AtomicBool>,
    join_handle: Option<JoinHandle<()>>,
}

pub struct PlanterSimulator {
    self_ref: std::sync::Weak<PlanterSimulator>,
    config: PlanterConfig,
    implement_profile: Option<ImplementProfile>,
    implement_width_m: f64,
    row_count: u32,
    anchor: GeoAnchor,
    /// An externally supplied route (C2 external mode), used verbatim in
    /// place of the generated serpentine when present.
    route_override: Option<Vec<RoutePoint>>,
    workers: Mutex<HashMap<SessionId, WorkerHandle>>,
}

impl PlanterSimulator {
    /// Construct the simulator behind an `Arc`. A self-reference is kept
    /// internally (via `Arc::new_cyclic`) so a worker thread can hold a
    /// strong handle back to the simulator that spawned it without the
    /// simulator needing to be passed in separately at every call site.
    pub fn new(
        config: PlanterConfig,
        implement_profile: Option<ImplementProfile>,
    ) -> Result<Arc<Self>, String> {
        Self::with_route(config, implement_profile, None)
    }

    /// Construct the simulator with an externally supplied route (C2
    /// external mode) instead of the generated serpentine pattern.
    pub fn with_route(
        config: PlanterConfig,
        implement_profile: Option<ImplementProfile>,
        route_override: Option<Vec<RoutePoint>>,
    ) -> Result<Arc<Self>, String> {
        config.validate()?;
        let (implement_width_m, row_count) = match &implement_profile {
            Some(p) => (p.working_width_m(), p.row_count),
            None => (13.0, 26),
        };
        let anchor = GeoAnchor::new(config.base_lat, config.base_lon);
        Ok(Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            config,
            implement_profile,
            implement_width_m,
            row_count,
            anchor,
            route_override,
            workers: Mutex::new(HashMap::new()),
        }))
    }

    fn step_distance(&self) -> f64 {
        self.config.speed_mps / self.config.sample_rate_hz
    }

    /// Compute one cycle of samples (C2 -> C3). Cached by the worker after
    /// the first call so the point sequence is not rebuilt every loop.
    fn cycle_samples(&self) -> Vec<Sample> {
        let points: Vec<RoutePoint> = match &self.route_override {
            Some(points) => points.clone(),
            None => generate_serpentine(
                self.config.field_length_m,
                self.config.headland_length_m,
                self.implement_width_m,
                self.config.passes_per_cycle,
                self.step_distance(),
            ),
        };
        build_samples(&points, self.config.sample_rate_hz)
    }

    fn is_articulated(&self) -> bool {
        self.implement_profile
            .as_ref()
            .map(|p| p.articulated)
            .unwrap_or(false)
    }

    fn build_message(
        &self,
        sample: &Sample,
        sequence: u64,
        history: &mut ArticulationHistory,
        last_antenna: &mut Option<Coordinate>,
        timestamp: f64,
    ) -> Message {
        let point = sample.point;
        let (latitude, longitude) = self.anchor.to_geodetic(Coordinate::new(point.east_m, point.north_m));
        let sections: Vec<bool> = std::iter::repeat(point.active).take(self.row_count as usize).collect();

        let mut implement = serde_json::Map::new();
        implement.insert("active".into(), json!(point.active));
        implement.insert("sections".into(), json!(sections));

        if self.is_articulated() {
            implement.insert("mode".into(), json!("articulated"));
            let cur_xy = Coordinate::new(point.east_m, point.north_m);
            let last_xy = last_antenna.unwrap_or(cur_xy);
            let h = sample.heading_deg.to_radians();
            let fwd = (h.sin(), h.cos());
            let right = (fwd.1, -fwd.0);
            let profile = self.implement_profile.as_ref().expect("articulated implies profile present");

            let state = articulation::compute(
                last_xy,
                cur_xy,
                fwd,
                right,
                profile.antenna_to_articulation_m.unwrap_or(1.0),
                0.0,
                0.0,
                self.implement_width_m,
                profile.articulation_to_tool_m,
                Some(h),
                history,
            );

            history.prev_displacement = Some((cur_xy.x - last_xy.x, cur_xy.y - last_xy.y));
            history.impl_theta = Some(state.theta);
            history.last_fwd = Some(fwd);
            history.last_right = Some(right);
            *last_antenna = Some(cur_xy);

            let (joint_lat, joint_lon) = self.anchor.to_geodetic(state.articulation_point);
            let (impl_lat, impl_lon) = self.anchor.to_geodetic(state.current_center);

            implement.insert(
                "articulation".into(),
                json!({
                    "antenna_xy_m": [cur_xy.x, cur_xy.y],
                    "joint_xy_m": [state.articulation_point.x, state.articulation_point.y],
                    "implement_xy_m": [state.current_center.x, state.current_center.y],
                    "joint_latlon": [joint_lat, joint_lon],
                    "implement_latlon": [impl_lat, impl_lon],
                    "axis": [state.axis.0, state.axis.1],
                    "theta_rad": state.theta,
                    "has_motion": state.significant_motion,
                }),
            );
        } else {
            implement.insert("mode".into(), json!("fixed"));
        }

        gnss_fix_message(
            latitude,
            longitude,
            self.config.altitude_m,
            Some(self.config.accuracy_m),
            sequence,
            timestamp,
            Some(sample.heading_deg),
            Some(sample.speed_mps),
            Some(if point.active { "FIXED" } else { "HOLD" }),
            Some(serde_json::Value::Object(implement)),
        )
    }

    fn on_worker_finished(&self, session_id: SessionId) {
        self.workers.lock().expect("workers lock poisoned").remove(&session_id);
    }

    /// Stop every worker: signal all stop-events, then join each with a
    /// 2-second timeout.
    pub fn stop(&self) {
        let handles: Vec<(SessionId, WorkerHandle)> = {
            let mut workers = self.workers.lock().expect("workers lock poisoned");
            workers.drain().collect()
        };
        for (_, handle) in &handles {
            handle.stop_flag.store(true, Ordering::SeqCst);
        }
        for (session_id, mut handle) in handles {
            if let Some(join_handle) = handle.join_handle.take() {
                join_with_timeout(join_handle, Duration::from_secs(2), session_id);
            }
        }
    }
}

fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration, session_id: SessionId) {
    // std::thread::JoinHandle has no native timed join; the worker loop
    // itself checks the stop flag at least once per `time_delta_s`, so in
    // practice this either returns promptly or the caller has already
    // waited roughly one sample interval. We approximate the documented
    // 2s timeout by polling `is_finished` rather than blocking forever.
    let start = std::time::Instant::now();
    loop {
        if handle.is_finished() {
            let _ = handle.join();
            return;
        }
        if start.elapsed() >= timeout {
            warn!(session_id, "planter worker did not stop within timeout");
            return;
        }
        thread::sleep(Duration::from_millis(20));
    }
}

impl TelemetryPublisher for PlanterSimulator {
    fn register_session(&self, session: Arc<dyn TelemetryTarget>) {
        let session_id = session.id();
        let stop_flag = Arc::new(AtomicBool::new(false));
        let simulator = self
            .self_ref
            .upgrade()
            .expect("simulator registering a session while already dropped");

        let worker_config = WorkerContext {
            simulator,
            session,
            stop_flag: stop_flag.clone(),
        };

        let join_handle = thread::Builder::new()
            .name(format!("planter-sim-{session_id:x}"))
            .spawn(move || worker_config.run())
            .expect("failed to spawn planter worker thread");

        self.workers.lock().expect("workers lock poisoned").insert(
            session_id,
            WorkerHandle {
                stop_flag,
                join_handle: Some(join_handle),
            },
        );
    }

    fn unregister_session(&self, session_id: SessionId) {
        let handle = self.workers.lock().expect("workers lock poisoned").remove(&session_id);
        if let Some(handle) = handle {
            handle.stop_flag.store(true, Ordering::SeqCst);
            if let Some(join_handle) = handle.join_handle {
                join_with_timeout(join_handle, Duration::from_secs(2), session_id);
            }
        }
    }
}

struct WorkerContext {
    simulator: Arc<PlanterSimulator>,
    session: Arc<dyn TelemetryTarget>,
    stop_flag: Arc<AtomicBool>,
}

impl WorkerContext {
    fn run(self) {
        let simulator = &self.simulator;
        let session_id = self.session.id();
        let mut sequence: u64 = 1;
        let mut cycle: Option<Vec<Sample>> = None;

        while !self.stop_flag.load(Ordering::SeqCst) {
            if !self.session.can_stream() {
                thread::sleep(Duration::from_millis(200));
                continue;
            }
            if cycle.is_none() {
                let samples = simulator.cycle_samples();
                if samples.is_empty() {
                    debug!(session_id, "empty cycle, worker exiting");
                    simulator.on_worker_finished(session_id);
                    return;
                }
                cycle = Some(samples);
            }

            let mut history = ArticulationHistory::default();
            let mut last_antenna: Option<Coordinate> = None;

            for sample in cycle.as_ref().expect("cycle populated above") {
                if self.stop_flag.load(Ordering::SeqCst) {
                    break;
                }
                if self.session.awaiting_ack() {
                    thread::sleep(Duration::from_secs_f64(sample.time_delta_s.max(0.0)));
                    continue;
                }
                let timestamp = wall_clock_seconds();
                let message = simulator.build_message(sample, sequence, &mut history, &mut last_antenna, timestamp);
                if self.session.send_message(message) {
                    sequence += 1;
                }
                thread::sleep(Duration::from_secs_f64(sample.time_delta_s.max(0.0)));
            }

            if !simulator.config.loop_forever {
                break;
            }
            // Reset articulation history between cycles; the cached point
            // sequence itself is reused.
        }

        info!(session_id, "planter worker stopped");
        simulator.on_worker_finished(session_id);
    }
}

fn wall_clock_seconds() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::Mutex as StdMutex;

    struct RecordingTarget {
        id: SessionId,
        streaming: AtomicBool,
        sent: StdMutex<Vec<Message>>,
    }

    impl TelemetryTarget for RecordingTarget {
        fn id(&self) -> SessionId {
            self.id
        }
        fn can_stream(&self) -> bool {
            self.streaming.load(Ordering::SeqCst)
        }
        fn awaiting_ack(&self) -> bool {
            false
        }
        fn send_message(&self, message: Message) -> bool {
            self.sent.lock().unwrap().push(message);
            true
        }
    }

    #[test]
    fn scenario_s6_planter_cycle_coverage() {
        let profile = ImplementProfile {
            role: "planter".into(),
            name: "test".into(),
            manufacturer: None,
            model: None,
            row_count: 26,
            row_spacing_m: 0.5,
            hitch_to_tool_m: 3.0,
            articulated: true,
            antenna_to_articulation_m: Some(1.2),
            articulation_to_tool_m: Some(6.0),
            sections: vec![],
        };
        let config = PlanterConfig {
            field_length_m: 20.0,
            headland_length_m: 3.0,
            speed_mps: 130.0,
            sample_rate_hz: 5.0,
            passes_per_cycle: 2,
            loop_forever: false,
            ..PlanterConfig::default()
        };
        let simulator = PlanterSimulator::new(config, Some(profile)).unwrap();
        let samples = simulator.cycle_samples();
        assert!(!samples.is_empty());

        let mut history = ArticulationHistory::default();
        let mut last_antenna = None;
        let mut messages = Vec::new();
        for (i, sample) in samples.iter().enumerate() {
            messages.push(simulator.build_message(sample, i as u64 + 1, &mut history, &mut last_antenna, 0.0));
        }

        let has_active_all_sections_true = messages.iter().any(|m| {
            let implement = &m.payload["implement"];
            implement["active"] == json!(true)
                && implement["sections"].as_array().unwrap().iter().all(|v| v == &json!(true))
        });
        let has_inactive_all_sections_false = messages.iter().any(|m| {
            let implement = &m.payload["implement"];
            implement["active"] == json!(false)
                && implement["sections"].as_array().unwrap().iter().all(|v| v == &json!(false))
        });
        let has_articulated_within_tolerance = messages.iter().any(|m| {
            let implement = &m.payload["implement"];
            if implement["mode"] != json!("articulated") {
                return false;
            }
            let Some(art) = implement.get("articulation") else {
                return false;
            };
            let antenna = art["antenna_xy_m"].as_array().unwrap();
            let joint = art["joint_xy_m"].as_array().unwrap();
            let dx = antenna[0].as_f64().unwrap() - joint[0].as_f64().unwrap();
            let dy = antenna[1].as_f64().unwrap() - joint[1].as_f64().unwrap();
            ((dx * dx + dy * dy).sqrt() - 1.2).abs() < 0.01
        });

        assert!(has_active_all_sections_true, "expected an active sample with all 26 sections true");
        assert!(has_inactive_all_sections_false, "expected an inactive sample with all sections false");
        assert!(has_articulated_within_tolerance, "expected an articulated sample within 1cm of antenna offset");
    }

    #[test]
    fn register_and_unregister_lifecycle() {
        let config = PlanterConfig {
            field_length_m: 5.0,
            headland_length_m: 1.0,
            speed_mps: 50.0,
            sample_rate_hz: 5.0,
            passes_per_cycle: 2,
            loop_forever: false,
            ..PlanterConfig::default()
        };
        let simulator = PlanterSimulator::new(config, None).unwrap();
        let target = Arc::new(RecordingTarget {
            id: 1,
            streaming: AtomicBool::new(true),
            sent: StdMutex::new(Vec::new()),
        });
        simulator.register_session(target.clone());
        // Give the worker a moment to run its (short, non-looping) cycle.
        thread::sleep(Duration::from_millis(300));
        assert!(!target.sent.lock().unwrap().is_empty());
        simulator.unregister_session(1);
    }

    #[test]
    fn sequence_ids() {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        let _ = NEXT.fetch_add(1, Ordering::SeqCst);
    }
}
