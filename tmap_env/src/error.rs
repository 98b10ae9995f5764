//! Error types for the T-MAP environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Datagram send failed (socket buffer full, peer gone, etc.)
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Local socket could not be bound
    #[error("Bind failed on {addr}: {reason}")]
    BindError { addr: String, reason: String },

    /// Link is administratively down (simulated partition)
    #[error("Link down: {0}")]
    LinkDown(String),
}

impl EnvError {
    /// Creates a network error.
    pub fn network(msg: impl Into<String>) -> Self {
        Self::NetworkError(msg.into())
    }

    /// Creates a bind error for the given address.
    pub fn bind(addr: impl std::fmt::Display, reason: impl std::fmt::Display) -> Self {
        Self::BindError {
            addr: addr.to_string(),
            reason: reason.to_string(),
        }
    }
}
