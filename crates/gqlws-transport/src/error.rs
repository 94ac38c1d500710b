//! Transport error types.

use std::time::Duration;

/// Transport errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Connection attempt failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection closed.
    #[error("connection closed: {reason}")]
    Closed {
        /// Close code, when the peer supplied one.
        code: Option<u16>,
        /// Close reason.
        reason: String,
    },

    /// Operation timed out.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// Payload could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),

    /// Operation attempted in an invalid connection state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// WebSocket protocol error.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
