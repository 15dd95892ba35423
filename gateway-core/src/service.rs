//! Service orchestrator (C8): owns the long-lived shared state — agent
//! state, implement profile, planter simulator, GNSS coordinator — and
//! manufactures a [`Session`] per accepted connection, wired to that
//! shared state.

use std::path::PathBuf;
use std::sync::Arc;

use gateway_protocol::Message;
use tracing::info;

use crate::agent_state::AgentState;
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::geo::GeoAnchor;
use crate::gnss::{GnssCoordinator, NullGnssCoordinator};
use crate::implement::{load_implement_profile, ImplementProfile};
use crate::planter::{PlanterSimulator, TelemetryPublisher};
use crate::route::{load_route_from_json, resolve_route_path};
use crate::session::{Session, SystemActions};
use crate::update::ProcessSystemActions;

/// Search roots route files are resolved against, in priority order: the
/// current working directory, then an explicit agent root and its config
/// subdirectory, then none (no package-bundled routes directory exists
/// here — the bundled default lives in [`crate::implement`] instead).
fn route_search_roots(agent_root: Option<&std::path::Path>) -> Vec<PathBuf> {
    let mut roots = vec![std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))];
    if let Some(root) = agent_root {
        roots.push(root.to_path_buf());
        roots.push(root.join("config"));
    }
    roots
}

pub struct GatewayService {
    agent_state: Arc<AgentState>,
    implement_profile: Option<ImplementProfile>,
    publisher: Option<Arc<PlanterSimulator>>,
    gnss_coordinator: Arc<dyn GnssCoordinator>,
    system_actions: Arc<dyn SystemActions>,
}

impl GatewayService {
    /// Build the service from configuration, loading the implement
    /// profile and (if enabled) constructing the planter simulator with
    /// either the configured external route or the generated serpentine.
    pub fn from_config(config: &GatewayConfig, agent_root: Option<&std::path::Path>) -> Result<Arc<Self>, GatewayError> {
        let implement_profile = load_implement_profile(config.implement_profile_path.as_deref());

        let publisher = if config.enable_planter_simulator {
            let planter_config = config.planter_config();
            let route_override = match &config.route_file_path {
                Some(file_name) => {
                    let roots = route_search_roots(agent_root);
                    let resolved = resolve_route_path(file_name, &roots).ok_or_else(|| {
                        GatewayError::InvalidRoute(format!(
                            "route file {} not found in any search root",
                            file_name.display()
                        ))
                    })?;
                    let contents = std::fs::read_to_string(&resolved)?;
                    let anchor = GeoAnchor::new(planter_config.base_lat, planter_config.base_lon);
                    Some(load_route_from_json(&contents, &anchor)?)
                }
                None => None,
            };
            let simulator = PlanterSimulator::with_route(planter_config, Some(implement_profile.clone()), route_override)
                .map_err(GatewayError::InvalidConfig)?;
            Some(simulator)
        } else {
            None
        };

        let install_root = agent_root
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        Ok(Arc::new(Self {
            agent_state: Arc::new(AgentState::new()),
            implement_profile: Some(implement_profile),
            publisher,
            gnss_coordinator: Arc::new(NullGnssCoordinator::new()),
            system_actions: Arc::new(ProcessSystemActions::new(install_root, config.systemd_unit_name.clone())),
        }))
    }

    /// Construct a new session wired to the service's shared collaborators
    /// and immediately attach `sender` as its outbound path. The session
    /// registers itself with the publisher/GNSS coordinator on HELLO, not
    /// here.
    pub fn new_session(&self, sender: crate::session::Sender) -> Arc<Session> {
        let publisher = self
            .publisher
            .clone()
            .map(|p| p as Arc<dyn TelemetryPublisher>);
        let session = Session::new(
            self.agent_state.clone(),
            self.implement_profile.clone(),
            publisher,
            Some(self.gnss_coordinator.clone()),
            self.system_actions.clone(),
        )
        .into_arc();
        session.attach_sender(sender);
        session
    }

    /// Deliver a command/control reply to `session`'s peer.
    pub fn send_to(&self, session: &Session, message: &Message) -> bool {
        session.send_direct(message)
    }

    /// Stop all planter worker threads. Called during graceful shutdown.
    pub fn shutdown(&self) {
        if let Some(publisher) = &self.publisher {
            info!("stopping planter simulator workers");
            publisher.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn new_session_attaches_sender_and_handles_hello() {
        let config = GatewayConfig {
            enable_planter_simulator: false,
            ..GatewayConfig::default()
        };
        let service = GatewayService::from_config(&config, None).unwrap();

        let sent = Arc::new(Mutex::new(Vec::new()));
        let sent_for_closure = sent.clone();
        let session = service.new_session(Arc::new(move |m: &Message| {
            sent_for_closure.lock().unwrap().push(m.clone());
            true
        }));

        let hello = Message::new(gateway_protocol::MessageType::Hello, serde_json::json!({}));
        for reply in session.handle_message(&hello) {
            service.send_to(&session, &reply);
        }
        assert_eq!(sent.lock().unwrap().len(), 1);
        assert_eq!(sent.lock().unwrap()[0].message_type, gateway_protocol::MessageType::HelloAck);
    }
}
