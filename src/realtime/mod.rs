//! Realtime push connections: one shared WebSocket per endpoint URL.
//!
//! Consumers ask the [`ConnectionManager`] for a connection by URL and attach
//! listeners. Inbound frames are JSON and are fanned out to every listener in
//! registration order. The layer is receive-only.

pub mod connection;
pub mod manager;
pub mod policy;

pub use connection::{Connection, ConnectionStatus, ErrorHandler, Listener, ListenerId};
pub use manager::ConnectionManager;
pub use policy::ReconnectPolicy;

use thiserror::Error;

/// Transport-level problems reported to a connection's error handler.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RealtimeError {
    #[error("invalid realtime URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("realtime receive failed on {url}: {reason}")]
    Receive { url: String, reason: String },
    #[error("undecodable realtime frame on {url}: {reason}")]
    Decode { url: String, reason: String },
    #[error("reconnect attempts exhausted for {url} after {attempts} tries")]
    ReconnectExhausted { url: String, attempts: usize },
}

impl From<RealtimeError> for crate::error::DashError {
    fn from(error: RealtimeError) -> Self {
        crate::error::DashError::Transport(error.to_string())
    }
}
