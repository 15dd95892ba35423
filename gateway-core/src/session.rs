//! Session state machine (C7): per-connection logical conversation —
//! handshake, typed-message dispatch, subscription extraction, outbound
//! sender handle, pending-fix tracking, ack correlation, NTRIP correction
//! relay.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use gateway_protocol::{
    ack_message, error_message, hello_ack, info_message, ntrip_correction_ack_message,
    pong_message, status_message, Message, MessageType,
};
use serde_json::Value;
use tracing::{info, warn};

use crate::agent_state::AgentState;
use crate::gnss::{GnssCoordinator, SessionId};
use crate::implement::ImplementProfile;
use crate::planter::{TelemetryPublisher, TelemetryTarget};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const CAPABILITIES: [&str; 6] = [
    "telemetry/basic",
    "telemetry/rtk",
    "corrections/ntrip",
    "implement/management",
    "implement/profile",
    "update/zip",
];

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Side effects the session triggers but does not perform itself, so the
/// state machine stays free of process-level concerns and is testable in
/// isolation. `gatewayd` wires these to real `systemctl`/`reboot` calls;
/// tests wire them to no-ops or recorders.
pub trait SystemActions: Send + Sync {
    fn restart_service(&self);
    fn reboot(&self);
    /// Write an UPDATE package (already decoded from base64) to the
    /// updates directory and unpack it over the agent root. Returns an
    /// error message (for `invalid_package`) on extraction failure.
    fn install_update(&self, name: &str, content: &[u8]) -> Result<(), String>;
}

/// A no-op set of system actions, used where no real daemon lifecycle is
/// wired up (tests, or a GNSS-coordinator-only deployment).
pub struct NullSystemActions;

impl SystemActions for NullSystemActions {
    fn restart_service(&self) {
        info!("service restart requested (no-op system actions)");
    }
    fn reboot(&self) {
        info!("reboot requested (no-op system actions)");
    }
    fn install_update(&self, name: &str, _content: &[u8]) -> Result<(), String> {
        info!(name, "update install requested (no-op system actions)");
        Ok(())
    }
}

/// The sender half of a connection: given an outbound message, attempt to
/// write it to the peer. Returns `false` (without panicking) if the write
/// fails; the session logs and treats that the same as "not sent".
pub type Sender = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

#[derive(Default)]
struct PendingState {
    pending_fix_sequence: Option<i64>,
    last_ack_sequence: Option<i64>,
    last_ack_status: Option<String>,
    last_ack_timestamp: Option<f64>,
    last_heartbeat_at: Option<f64>,
}

enum SessionPhase {
    PreHandshake,
    Ready,
    Closed,
}

/// The logical conversation with one connected monitor, spanning one
/// stream connection. Cheap to construct; most state lives behind a
/// single mutex since inbound handling and the telemetry worker thread
/// both touch the back-pressure fields.
pub struct Session {
    id: SessionId,
    /// Set once the session is wrapped via [`Session::into_arc`], so
    /// `on_hello` can hand the publisher/GNSS coordinator a strong handle
    /// to this session without requiring every caller to construct the
    /// `Arc` themselves.
    self_ref: Mutex<Option<std::sync::Weak<Session>>>,
    phase: Mutex<SessionPhase>,
    telemetry_subscribed: Mutex<bool>,
    sender: Mutex<Option<Sender>>,
    registered_with_publisher: Mutex<bool>,
    pending: Mutex<PendingState>,
    agent_state: Arc<AgentState>,
    implement_profile: Option<ImplementProfile>,
    publisher: Option<Arc<dyn TelemetryPublisher>>,
    gnss_coordinator: Option<Arc<dyn GnssCoordinator>>,
    system_actions: Arc<dyn SystemActions>,
    clock: Box<dyn Fn() -> f64 + Send + Sync>,
}

impl Session {
    pub fn new(
        agent_state: Arc<AgentState>,
        implement_profile: Option<ImplementProfile>,
        publisher: Option<Arc<dyn TelemetryPublisher>>,
        gnss_coordinator: Option<Arc<dyn GnssCoordinator>>,
        system_actions: Arc<dyn SystemActions>,
    ) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::SeqCst),
            self_ref: Mutex::new(None),
            phase: Mutex::new(SessionPhase::PreHandshake),
            telemetry_subscribed: Mutex::new(false),
            sender: Mutex::new(None),
            registered_with_publisher: Mutex::new(false),
            pending: Mutex::new(PendingState::default()),
            agent_state,
            implement_profile,
            publisher,
            gnss_coordinator,
            system_actions,
            clock: Box::new(monotonic_seconds),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: impl Fn() -> f64 + Send + Sync + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Wrap the session in an `Arc`, recording a self-reference so that a
    /// later HELLO can register a strong handle to this session with the
    /// publisher and GNSS coordinator.
    pub fn into_arc(self) -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            *self.self_ref.lock().expect("self_ref lock poisoned") = Some(weak.clone());
            self
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn attach_sender(&self, sender: Sender) {
        *self.sender.lock().expect("sender lock poisoned") = Some(sender);
    }

    pub fn detach_sender(&self) {
        *self.sender.lock().expect("sender lock poisoned") = None;
    }

    fn handshake_complete(&self) -> bool {
        matches!(*self.phase.lock().expect("phase lock poisoned"), SessionPhase::Ready)
    }

    pub fn telemetry_subscribed(&self) -> bool {
        *self.telemetry_subscribed.lock().expect("subscribed lock poisoned")
    }

    pub fn awaiting_ack(&self) -> bool {
        self.pending.lock().expect("pending lock poisoned").pending_fix_sequence.is_some()
    }

    pub fn last_ack_sequence(&self) -> Option<i64> {
        self.pending.lock().expect("pending lock poisoned").last_ack_sequence
    }

    pub fn last_ack_status(&self) -> Option<String> {
        self.pending.lock().expect("pending lock poisoned").last_ack_status.clone()
    }

    pub fn last_ack_timestamp(&self) -> Option<f64> {
        self.pending.lock().expect("pending lock poisoned").last_ack_timestamp
    }

    pub fn last_heartbeat_at(&self) -> Option<f64> {
        self.pending.lock().expect("pending lock poisoned").last_heartbeat_at
    }

    /// Entry point: dispatch one inbound message, returning zero or more
    /// outbound replies. Never panics on peer input.
    pub fn handle_message(&self, message: &Message) -> Vec<Message> {
        if matches!(*self.phase.lock().expect("phase lock poisoned"), SessionPhase::PreHandshake)
            && message.message_type != MessageType::Hello
        {
            return vec![error_message(
                "handshake required",
                Some("handshake_required"),
                None,
            )];
        }

        match message.message_type {
            MessageType::Hello => self.on_hello(&message.payload),
            MessageType::Ping => vec![pong_message()],
            MessageType::Info => self.on_info(),
            MessageType::GetStatus => self.on_status_request(),
            MessageType::StartJob => self.on_start_job(&message.payload),
            MessageType::StopJob => self.on_stop_job(&message.payload),
            MessageType::Update => self.on_update(&message.payload),
            MessageType::Reboot => self.on_reboot(),
            MessageType::GnssAck => self.on_gnss_ack(&message.payload),
            MessageType::NtripCorrection => self.on_ntrip_correction(&message.payload),
            _ => vec![error_message(
                &format!("unsupported message: {}", message.message_type.as_wire_str()),
                Some("unsupported"),
                None,
            )],
        }
    }

    /// Unregister from the publisher and GNSS coordinator, and detach the
    /// sender so subsequent sends become no-ops. Idempotent.
    pub fn close(&self) {
        *self.phase.lock().expect("phase lock poisoned") = SessionPhase::Closed;

        let was_registered = {
            let mut flag = self.registered_with_publisher.lock().expect("registered lock poisoned");
            std::mem::replace(&mut *flag, false)
        };
        if was_registered {
            if let Some(publisher) = &self.publisher {
                publisher.unregister_session(self.id);
            }
            if let Some(coordinator) = &self.gnss_coordinator {
                coordinator.unregister_session(self.id);
            }
        }
        self.detach_sender();
    }

    fn extract_subscription(payload: &Value) -> bool {
        let raw = payload.get("subscribe").or_else(|| payload.get("subscriptions"));
        match raw {
            None => true,
            Some(Value::Bool(b)) => *b,
            Some(Value::Array(items)) => items.iter().any(|v| {
                matches!(v.as_str(), Some("telemetry/rtk") | Some("telemetry"))
            }),
            Some(Value::Object(map)) => {
                if let Some(v) = map.get("telemetry/rtk").and_then(Value::as_bool) {
                    return v;
                }
                if let Some(v) = map
                    .get("telemetry")
                    .and_then(|t| t.get("rtk"))
                    .and_then(Value::as_bool)
                {
                    return v;
                }
                true
            }
            _ => true,
        }
    }

    fn on_hello(&self, payload: &Value) -> Vec<Message> {
        *self.phase.lock().expect("phase lock poisoned") = SessionPhase::Ready;
        let subscribed = Self::extract_subscription(payload);
        *self.telemetry_subscribed.lock().expect("subscribed lock poisoned") = subscribed;
        self.register_with_collaborators();

        info!(session_id = self.id, subscribed, "handshake complete");
        vec![hello_ack(VERSION, &CAPABILITIES)]
    }

    /// Register with the publisher/GNSS coordinator exactly once, iff a
    /// strong self-handle is available (the session was constructed via
    /// [`Session::into_arc`]). A session used only for unit tests without
    /// wrapping is never registered — fine, since those tests have no
    /// publisher/coordinator to register with anyway.
    fn register_with_collaborators(&self) {
        let mut registered = self.registered_with_publisher.lock().expect("registered lock poisoned");
        if *registered {
            return;
        }
        let strong = self
            .self_ref
            .lock()
            .expect("self_ref lock poisoned")
            .as_ref()
            .and_then(std::sync::Weak::upgrade);
        let Some(strong) = strong else {
            return;
        };
        *registered = true;
        drop(registered);

        if let Some(publisher) = &self.publisher {
            publisher.register_session(strong.clone() as Arc<dyn TelemetryTarget>);
        }
        if let Some(coordinator) = &self.gnss_coordinator {
            coordinator.register_session(self.id);
        }
    }

    fn on_info(&self) -> Vec<Message> {
        let snapshot = self.agent_state.snapshot();
        let implement = self.implement_profile.as_ref().map(ImplementProfile::to_payload);
        vec![info_message(VERSION, snapshot.uptime_s, implement)]
    }

    fn on_status_request(&self) -> Vec<Message> {
        let snapshot = self.agent_state.snapshot();
        vec![status_message(snapshot.job_running)]
    }

    fn on_start_job(&self, payload: &Value) -> Vec<Message> {
        self.agent_state.set_job_running(true);
        self.agent_state.mark_command(payload.clone());
        vec![ack_message("START_JOB")]
    }

    fn on_stop_job(&self, payload: &Value) -> Vec<Message> {
        self.agent_state.set_job_running(false);
        self.agent_state.mark_command(payload.clone());
        vec![ack_message("STOP_JOB")]
    }

    fn on_update(&self, payload: &Value) -> Vec<Message> {
        let name = match payload.get("name").and_then(Value::as_str) {
            Some(n) => n,
            None => {
                return vec![error_message(
                    "missing update name",
                    Some("invalid_payload"),
                    None,
                )]
            }
        };
        let content_b64 = match payload.get("content_b64").and_then(Value::as_str) {
            Some(c) => c,
            None => {
                return vec![error_message(
                    "missing update content",
                    Some("invalid_payload"),
                    None,
                )]
            }
        };
        let content = match BASE64.decode(content_b64) {
            Ok(bytes) => bytes,
            Err(e) => {
                return vec![error_message(
                    &format!("invalid base64: {e}"),
                    Some("invalid_payload"),
                    None,
                )]
            }
        };

        match self.system_actions.install_update(name, &content) {
            Ok(()) => {
                self.system_actions.restart_service();
                vec![ack_message("UPDATE")]
            }
            Err(e) => vec![error_message(&e, Some("invalid_package"), None)],
        }
    }

    fn on_reboot(&self) -> Vec<Message> {
        self.system_actions.reboot();
        vec![ack_message("REBOOT")]
    }

    fn on_gnss_ack(&self, payload: &Value) -> Vec<Message> {
        let sequence = match payload.get("sequence").and_then(Value::as_i64) {
            Some(seq) => seq,
            None => {
                warn!(session_id = self.id, "GNSS_ACK missing integer sequence, dropped");
                return vec![];
            }
        };
        let status = payload
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let timestamp = payload.get("timestamp").and_then(Value::as_f64);
        let now = (self.clock)();

        {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            pending.last_ack_sequence = Some(sequence);
            pending.last_ack_status = Some(status.clone());
            pending.last_ack_timestamp = timestamp;
            pending.last_heartbeat_at = Some(now);
            if pending.pending_fix_sequence == Some(sequence) {
                pending.pending_fix_sequence = None;
            }
        }

        if let Some(coordinator) = &self.gnss_coordinator {
            coordinator.acknowledge_fix(sequence, &status, timestamp);
        }
        vec![]
    }

    fn on_ntrip_correction(&self, payload: &Value) -> Vec<Message> {
        let sequence = match payload.get("sequence").and_then(Value::as_i64) {
            Some(seq) => seq,
            None => {
                return vec![error_message(
                    "missing or non-integer sequence",
                    Some("invalid_payload"),
                    None,
                )]
            }
        };
        let format = match payload.get("format").and_then(Value::as_str) {
            Some(f) => f.to_string(),
            None => {
                return vec![error_message(
                    "missing correction format",
                    Some("invalid_payload"),
                    None,
                )]
            }
        };
        let payload_b64 = match payload.get("payload").and_then(Value::as_str) {
            Some(p) => p,
            None => {
                return vec![error_message(
                    "missing correction payload",
                    Some("invalid_payload"),
                    None,
                )]
            }
        };
        let decoded = match BASE64.decode(payload_b64) {
            Ok(bytes) => bytes,
            Err(e) => {
                return vec![error_message(
                    &format!("invalid base64: {e}"),
                    Some("invalid_payload"),
                    None,
                )]
            }
        };
        let timestamp = payload.get("timestamp").and_then(Value::as_f64);

        if let Some(coordinator) = &self.gnss_coordinator {
            coordinator.handle_correction(sequence, &decoded, &format, timestamp);
        }

        vec![ntrip_correction_ack_message(sequence, "accepted", timestamp)]
    }

    /// Send a reply directly to the attached sender, bypassing the
    /// telemetry subscription gate in [`Session::can_stream`] — used for
    /// command/control replies (HELLO_ACK, ACK, ERROR, ...), which must
    /// reach the peer regardless of telemetry subscription state.
    pub fn send_direct(&self, message: &Message) -> bool {
        let sender = self.sender.lock().expect("sender lock poisoned").clone();
        match sender {
            Some(sender) => sender(message),
            None => false,
        }
    }

    /// `can_stream()`: true iff handshake complete, subscribed, and a
    /// sender is attached.
    pub fn can_stream(&self) -> bool {
        self.handshake_complete() && self.telemetry_subscribed() && self.sender.lock().expect("sender lock poisoned").is_some()
    }
}

impl TelemetryTarget for Session {
    fn id(&self) -> SessionId {
        self.id
    }

    fn can_stream(&self) -> bool {
        Session::can_stream(self)
    }

    fn awaiting_ack(&self) -> bool {
        Session::awaiting_ack(self)
    }

    fn send_message(&self, message: Message) -> bool {
        if !self.can_stream() {
            return false;
        }
        let sender = {
            let guard = self.sender.lock().expect("sender lock poisoned");
            match guard.as_ref() {
                Some(s) => s.clone(),
                None => return false,
            }
        };
        let sent = sender(&message);
        if sent && message.message_type == MessageType::GnssFix {
            if let Some(sequence) = message.payload.get("sequence").and_then(Value::as_i64) {
                self.mark_fix_sent(sequence);
            }
        }
        sent
    }
}

impl Session {
    fn mark_fix_sent(&self, sequence: i64) {
        let mut pending = self.pending.lock().expect("pending lock poisoned");
        pending.pending_fix_sequence = Some(sequence);
        pending.last_heartbeat_at = Some((self.clock)());
    }
}

fn monotonic_seconds() -> f64 {
    use std::time::Instant;
    thread_local! {
        static START: Instant = Instant::now();
    }
    START.with(|start| start.elapsed().as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex as StdMutex;

    fn make_session() -> Session {
        Session::new(Arc::new(AgentState::new()), None, None, None, Arc::new(NullSystemActions))
    }

    #[test]
    fn s1_handshake_advertises_capabilities() {
        let session = make_session();
        let msg = Message::new(MessageType::Hello, serde_json::json!({}));
        let replies = session.handle_message(&msg);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].message_type, MessageType::HelloAck);
        let caps = replies[0].payload["capabilities"].as_array().unwrap();
        let has = |c: &str| caps.iter().any(|v| v == c);
        assert!(has("telemetry/rtk"));
        assert!(has("corrections/ntrip"));
        assert!(session.handshake_complete());
    }

    #[test]
    fn s2_pre_handshake_rejection() {
        let session = make_session();
        let msg = Message::new(MessageType::Ping, serde_json::json!({}));
        let replies = session.handle_message(&msg);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].message_type, MessageType::Error);
        assert_eq!(replies[0].payload["code"], serde_json::json!("handshake_required"));
    }

    struct RecordingCoordinator {
        corrections: StdMutex<Vec<(i64, Vec<u8>, String, Option<f64>)>>,
    }

    impl GnssCoordinator for RecordingCoordinator {
        fn register_session(&self, _session_id: SessionId) {}
        fn unregister_session(&self, _session_id: SessionId) {}
        fn handle_correction(&self, sequence: i64, payload: &[u8], format: &str, timestamp: Option<f64>) {
            self.corrections
                .lock()
                .unwrap()
                .push((sequence, payload.to_vec(), format.to_string(), timestamp));
        }
        fn acknowledge_fix(&self, _sequence: i64, _status: &str, _timestamp: Option<f64>) {}
    }

    #[test]
    fn s3_ntrip_correction_round_trip() {
        let coordinator = Arc::new(RecordingCoordinator {
            corrections: StdMutex::new(Vec::new()),
        });
        let session = Session::new(
            Arc::new(AgentState::new()),
            None,
            None,
            Some(coordinator.clone() as Arc<dyn GnssCoordinator>),
            Arc::new(NullSystemActions),
        );
        session.handle_message(&Message::new(MessageType::Hello, serde_json::json!({})));

        let msg = Message::new(
            MessageType::NtripCorrection,
            serde_json::json!({"sequence": 7, "format": "RTCM3", "payload": "cnRjbS1kYXRh", "timestamp": 12.5}),
        );
        let replies = session.handle_message(&msg);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].message_type, MessageType::NtripCorrectionAck);
        assert_eq!(replies[0].payload["sequence"], serde_json::json!(7));
        assert_eq!(replies[0].payload["status"], serde_json::json!("accepted"));

        let calls = coordinator.corrections.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, 7);
        assert_eq!(calls[0].1, b"rtcm-data");
        assert_eq!(calls[0].2, "RTCM3");
        assert_eq!(calls[0].3, Some(12.5));
    }

    #[test]
    fn s4_invalid_correction_base64() {
        let coordinator = Arc::new(RecordingCoordinator {
            corrections: StdMutex::new(Vec::new()),
        });
        let session = Session::new(
            Arc::new(AgentState::new()),
            None,
            None,
            Some(coordinator.clone() as Arc<dyn GnssCoordinator>),
            Arc::new(NullSystemActions),
        );
        session.handle_message(&Message::new(MessageType::Hello, serde_json::json!({})));

        let msg = Message::new(
            MessageType::NtripCorrection,
            serde_json::json!({"sequence": 1, "format": "RTCM3", "payload": "***"}),
        );
        let replies = session.handle_message(&msg);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].message_type, MessageType::Error);
        assert_eq!(replies[0].payload["code"], serde_json::json!("invalid_payload"));
        assert!(coordinator.corrections.lock().unwrap().is_empty());
    }

    #[test]
    fn s5_gnss_ack_clears_pending() {
        let clock_calls = Arc::new(StdMutex::new(vec![10.0, 20.0]));
        let clock_calls_for_closure = clock_calls.clone();
        let session = Session::new(Arc::new(AgentState::new()), None, None, None, Arc::new(NullSystemActions))
            .with_clock(move || {
                let mut calls = clock_calls_for_closure.lock().unwrap();
                if calls.is_empty() {
                    0.0
                } else {
                    calls.remove(0)
                }
            });
        session.handle_message(&Message::new(MessageType::Hello, serde_json::json!({})));

        session.mark_fix_sent(42);
        assert!(session.awaiting_ack());
        assert_eq!(session.last_heartbeat_at(), Some(10.0));

        let msg = Message::new(MessageType::GnssAck, serde_json::json!({"sequence": 42, "status": "ok"}));
        let replies = session.handle_message(&msg);
        assert!(replies.is_empty());
        assert!(!session.awaiting_ack());
        assert_eq!(session.last_heartbeat_at(), Some(20.0));
    }

    #[test]
    fn send_message_requires_handshake_subscription_and_sender() {
        let session = make_session();
        let sent = StdMutex::new(Vec::new());
        let flag = Arc::new(AtomicBool::new(true));
        let _ = flag;

        let msg = gateway_protocol::gnss_fix_message(0.0, 0.0, 0.0, None, 1, 0.0, None, None, None, None);
        assert!(!TelemetryTarget::send_message(&session, msg.clone()));

        session.handle_message(&Message::new(MessageType::Hello, serde_json::json!({})));
        assert!(!TelemetryTarget::send_message(&session, msg.clone()));

        session.attach_sender(Arc::new(move |m: &Message| {
            sent.lock().unwrap().push(m.clone());
            true
        }));
        assert!(TelemetryTarget::send_message(&session, msg));
        assert_eq!(session.pending.lock().unwrap().pending_fix_sequence, Some(1));
    }

    #[test]
    fn unsupported_message_after_handshake() {
        let session = make_session();
        session.handle_message(&Message::new(MessageType::Hello, serde_json::json!({})));
        let replies = session.handle_message(&Message::new(MessageType::GnssFix, serde_json::json!({})));
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].message_type, MessageType::Error);
        assert_eq!(replies[0].payload["code"], serde_json::json!("unsupported"));
    }
}
