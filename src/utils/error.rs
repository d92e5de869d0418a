//! Error taxonomy for the messaging layer.
//!
//! Connection-fatal conditions (authentication, capacity, transport loss)
//! get their own variants so callers can decide whether to retry. An
//! acknowledgement timeout is deliberately absent: it is reported through
//! `DeliveryResult`, not as an error.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, HubLinkError>;

#[derive(Error, Debug)]
pub enum HubLinkError {
    /// Missing or unknown credential. Not retryable.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The pool is at its connection limit; retry later.
    #[error("connection limit reached ({limit} sessions)")]
    CapacityExceeded { limit: usize },

    /// Malformed or unexpected envelope.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The transport went away while the operation was outstanding.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("message queue full ({max_size} entries)")]
    QueueFull { max_size: usize },

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The owning task has shut down and can no longer answer.
    #[error("connection task stopped")]
    Closed,
}

impl HubLinkError {
    /// Whether a client should back off and try the same operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HubLinkError::CapacityExceeded { .. }
                | HubLinkError::ConnectionLost(_)
                | HubLinkError::Timeout { .. }
                | HubLinkError::WebSocket(_)
                | HubLinkError::Io(_)
        )
    }
}

impl From<sled::Error> for HubLinkError {
    fn from(err: sled::Error) -> Self {
        HubLinkError::Storage(err.to_string())
    }
}
