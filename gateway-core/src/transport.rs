//! Transport listeners: a TCP accept loop always available, plus a
//! Bluetooth RFCOMM listener for the real field deployment.
//!
//! Both transports terminate at the same [`crate::session::Session`] and
//! [`gateway_protocol::LineCodec`] — the wire protocol doesn't know or
//! care which socket type carried it.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use gateway_protocol::LineCodec;
use tracing::{error, info, warn};

use crate::service::GatewayService;

/// Accept TCP connections on `host:port` until `stop` is set, spawning one
/// thread per connection. Blocks the calling thread; run it on its own
/// thread (or the main thread) from `gatewayd`.
pub fn run_tcp_server(host: &str, port: u16, service: Arc<GatewayService>, stop: Arc<AtomicBool>) -> std::io::Result<()> {
    let listener = TcpListener::bind((host, port))?;
    listener.set_nonblocking(true)?;
    info!(host, port, "TCP listener bound");

    while !stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let service = service.clone();
                let stop = stop.clone();
                std::thread::Builder::new()
                    .name(format!("tcp-conn-{peer}"))
                    .spawn(move || handle_tcp_connection(stream, peer.to_string(), service, stop))
                    .expect("failed to spawn connection thread");
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(std::time::Duration::from_millis(50));
            }
            Err(e) => {
                error!(error = %e, "TCP accept failed");
                return Err(e);
            }
        }
    }
    info!("TCP listener stopping");
    Ok(())
}

fn handle_tcp_connection(stream: TcpStream, peer: String, service: Arc<GatewayService>, stop: Arc<AtomicBool>) {
    if let Err(e) = stream.set_read_timeout(Some(std::time::Duration::from_millis(250))) {
        warn!(peer, error = %e, "failed to set read timeout");
    }
    let writer = match stream.try_clone() {
        Ok(w) => w,
        Err(e) => {
            error!(peer, error = %e, "failed to clone connection for writer");
            return;
        }
    };

    let session = service.new_session(writer_sender(writer));
    info!(peer, session_id = session.id(), "connection accepted");

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {
                if line.trim().is_empty() {
                    continue;
                }
                match LineCodec::decode(&line) {
                    Ok(message) => {
                        for reply in session.handle_message(&message) {
                            let _ = service.send_to(&session, &reply);
                        }
                    }
                    Err(e) => {
                        warn!(peer, error = %e, "malformed line from peer");
                        let reply = gateway_protocol::error_message(
                            "malformed message",
                            Some("bad_json"),
                            Some(serde_json::json!({ "error": e.to_string() })),
                        );
                        let _ = service.send_to(&session, &reply);
                        continue;
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {
                continue;
            }
            Err(e) => {
                warn!(peer, error = %e, "connection read error");
                break;
            }
        }
    }

    session.close();
    info!(peer, session_id = session.id(), "connection closed");
}

fn writer_sender(mut writer: TcpStream) -> crate::session::Sender {
    Arc::new(move |message: &gateway_protocol::Message| {
        let line = LineCodec::encode(message);
        writer.write_all(line.as_bytes()).is_ok()
    })
}

/// Bluetooth RFCOMM listener. Real RFCOMM sockets depend on a host
/// Bluetooth stack (BlueZ on Linux) with no portable std/crates.io
/// equivalent to `TcpListener`; wiring it up is a packaging-time decision
/// left to the deployment, not something this crate can do portably.
/// This module documents the shape that wiring takes without fabricating
/// a dependency the pack never reaches for.
pub mod rfcomm {
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    use crate::service::GatewayService;

    /// Configuration for an RFCOMM listener: channel number and the
    /// service name advertised over SDP.
    #[derive(Debug, Clone)]
    pub struct RfcommConfig {
        pub channel: u8,
        pub service_name: String,
    }

    /// Not implemented in this crate: accepting RFCOMM connections
    /// requires a platform Bluetooth stack binding that is out of scope
    /// here. A real deployment substitutes a platform-specific listener
    /// that feeds accepted streams through the same
    /// [`crate::session::Session`] + line-protocol path the TCP listener
    /// uses in [`super::run_tcp_server`].
    pub fn run_rfcomm_server(
        _config: RfcommConfig,
        _service: Arc<GatewayService>,
        _stop: Arc<AtomicBool>,
    ) -> std::io::Result<()> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "RFCOMM transport requires a platform Bluetooth stack binding; not available in this build",
        ))
    }
}
