//! Agent state (C6): a process-wide mutable record guarded by a single
//! lock, with thread-safe snapshots.
//!
//! Represented as an explicit value owned by the service and passed into
//! every session factory, rather than a hidden global — lock discipline is
//! unchanged from a module-level singleton, but ownership is visible.

use std::sync::Mutex;
use std::time::Instant;

use serde_json::Value;

struct Inner {
    job_running: bool,
    uptime_start: Instant,
    last_command: Option<Value>,
}

/// Snapshot returned by [`AgentState::snapshot`]: a consistent copy of the
/// three guarded fields plus the derived uptime.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentSnapshot {
    pub job_running: bool,
    pub uptime_s: u64,
    pub last_command: Option<Value>,
}

pub struct AgentState {
    inner: Mutex<Inner>,
}

impl AgentState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                job_running: false,
                uptime_start: Instant::now(),
                last_command: None,
            }),
        }
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        let inner = self.inner.lock().expect("agent state lock poisoned");
        AgentSnapshot {
            job_running: inner.job_running,
            uptime_s: inner.uptime_start.elapsed().as_secs(),
            last_command: inner.last_command.clone(),
        }
    }

    pub fn set_job_running(&self, running: bool) {
        let mut inner = self.inner.lock().expect("agent state lock poisoned");
        inner.job_running = running;
    }

    pub fn mark_command(&self, command: Value) {
        let mut inner = self.inner.lock().expect("agent state lock poisoned");
        inner.last_command = Some(command);
    }
}

impl Default for AgentState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_mutations() {
        let state = AgentState::new();
        assert!(!state.snapshot().job_running);
        state.set_job_running(true);
        state.mark_command(serde_json::json!({"type": "START_JOB"}));
        let snap = state.snapshot();
        assert!(snap.job_running);
        assert_eq!(snap.last_command, Some(serde_json::json!({"type": "START_JOB"})));
    }
}
