//! Internal error types for the narrow set of fallible operations that are
//! not peer-facing. Peer-facing failures are represented as protocol
//! `ERROR` messages instead (see [`crate::session`]); nothing here is ever
//! shown to the peer directly.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid route: {0}")]
    InvalidRoute(String),

    #[error("invalid implement profile: {0}")]
    InvalidImplementProfile(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("update package error: {0}")]
    UpdatePackage(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
