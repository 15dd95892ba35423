//! `gatewayd`: the field gateway daemon. Loads configuration, builds the
//! shared service state, and runs the TCP (and, where available, RFCOMM)
//! accept loops until interrupted.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use gateway_core::config::GatewayConfig;
use gateway_core::transport::{rfcomm, run_tcp_server};
use gateway_core::GatewayService;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gateway_core=info,gatewayd=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn config_path() -> PathBuf {
    std::env::var_os("GATEWAY_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/etc/magateway/gateway.toml"))
}

fn main() -> anyhow::Result<()> {
    init_tracing();

    let path = config_path();
    let config = GatewayConfig::load(&path)?;
    tracing::info!(path = %path.display(), "configuration loaded");

    let agent_root = std::env::var_os("GATEWAY_AGENT_ROOT").map(PathBuf::from);
    let service = GatewayService::from_config(&config, agent_root.as_deref())?;

    let stop = Arc::new(AtomicBool::new(false));
    install_signal_handler(stop.clone());

    if config.enable_bluetooth {
        let rfcomm_config = rfcomm::RfcommConfig {
            channel: config.bluetooth_channel,
            service_name: config.bluetooth_service_name.clone(),
        };
        match rfcomm::run_rfcomm_server(rfcomm_config, service.clone(), stop.clone()) {
            Ok(()) => {}
            Err(e) => tracing::warn!(error = %e, "RFCOMM transport unavailable, continuing with TCP only"),
        }
    }

    let result = run_tcp_server(&config.tcp_host, config.tcp_port, service.clone(), stop);
    service.shutdown();
    result.map_err(Into::into)
}

/// Install the SIGTERM/SIGINT handler before starting the accept loops —
/// doing this up front, rather than inside a closure that might never run
/// if startup fails early, is the fix for a gap where an early panic could
/// leave simulator worker threads running past process exit.
fn install_signal_handler(stop: Arc<AtomicBool>) {
    let result = ctrlc::set_handler(move || {
        stop.store(true, Ordering::SeqCst);
    });
    if let Err(e) = result {
        tracing::warn!(error = %e, "failed to install signal handler; rely on process kill for shutdown");
    }
}
