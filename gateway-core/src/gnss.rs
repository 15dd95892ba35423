//! GNSS coordination interface used by the session state machine to relay
//! RTK corrections toward hardware and to learn about fix acknowledgements,
//! decoupled from any particular session.

use std::sync::{Arc, Mutex, Weak};

/// How sessions interested in GNSS coordination are identified — the core
/// only needs a stable identity to register/unregister by.
pub type SessionId = u64;

pub trait GnssCoordinator: Send + Sync {
    fn register_session(&self, session_id: SessionId);
    fn unregister_session(&self, session_id: SessionId);
    fn handle_correction(&self, sequence: i64, payload: &[u8], format: &str, timestamp: Option<f64>);
    fn acknowledge_fix(&self, sequence: i64, status: &str, timestamp: Option<f64>);
}

/// A coordinator with no real hardware behind it: registration is tracked
/// for test/inspection purposes, corrections and acknowledgements are
/// logged and otherwise discarded. Useful as the default when no GNSS
/// integration is configured.
#[derive(Default)]
pub struct NullGnssCoordinator {
    registered: Mutex<Vec<SessionId>>,
}

impl NullGnssCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registered_sessions(&self) -> Vec<SessionId> {
        self.registered.lock().expect("lock poisoned").clone()
    }
}

impl GnssCoordinator for NullGnssCoordinator {
    fn register_session(&self, session_id: SessionId) {
        self.registered.lock().expect("lock poisoned").push(session_id);
    }

    fn unregister_session(&self, session_id: SessionId) {
        self.registered
            .lock()
            .expect("lock poisoned")
            .retain(|id| *id != session_id);
    }

    fn handle_correction(&self, sequence: i64, payload: &[u8], format: &str, _timestamp: Option<f64>) {
        tracing::debug!(sequence, format, bytes = payload.len(), "correction discarded: no GNSS hardware configured");
    }

    fn acknowledge_fix(&self, sequence: i64, status: &str, _timestamp: Option<f64>) {
        tracing::debug!(sequence, status, "fix acknowledgement noted: no GNSS hardware configured");
    }
}

/// A weak handle a coordinator can keep without holding a session (or the
/// reverse) alive past its natural lifetime — see the worker-map ownership
/// note in [`crate::planter`].
pub type SharedGnssCoordinator = Arc<dyn GnssCoordinator>;
pub type WeakGnssCoordinator = Weak<dyn GnssCoordinator>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_coordinator_tracks_registration() {
        let coord = NullGnssCoordinator::new();
        coord.register_session(1);
        coord.register_session(2);
        coord.unregister_session(1);
        assert_eq!(coord.registered_sessions(), vec![2]);
    }
}
