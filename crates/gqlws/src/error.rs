//! Error types shared by both peers.

use thiserror::Error;

use crate::protocol::{CloseCode, GraphqlError};

/// A frame was rejected before dispatch.
///
/// Every variant carries a recommended close code via
/// [`ProtocolError::close_code`]; higher layers apply it to the connection.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    /// Frame was not a single JSON object of the expected shape.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Unknown `type` discriminant.
    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// Operation-scoped message without a non-empty id.
    #[error("missing operation id on {0}")]
    MissingId(&'static str),

    /// Connection-scoped message carrying an id.
    #[error("unexpected operation id on {0}")]
    UnexpectedId(&'static str),

    /// Message type requires a payload.
    #[error("missing payload on {0}")]
    MissingPayload(&'static str),

    /// Outbound message failed to serialize.
    #[error("serialize error: {0}")]
    Serialize(String),
}

impl ProtocolError {
    /// The close code a peer should apply after this rejection.
    #[must_use]
    pub const fn close_code(&self) -> CloseCode {
        CloseCode::BadRequest
    }
}

/// Close signal observed on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    /// Close code.
    pub code: u16,
    /// Close reason.
    pub reason: String,
    /// Whether the close completed the closing handshake.
    pub was_clean: bool,
}

impl CloseEvent {
    /// Create a clean close event.
    #[must_use]
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            was_clean: true,
        }
    }

    /// The event used when a transport drops without a closing handshake.
    #[must_use]
    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self {
            code: 1006,
            reason: reason.into(),
            was_clean: false,
        }
    }
}

impl std::fmt::Display for CloseEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.reason)
    }
}

/// Failure delivered to a subscription sink.
///
/// Exactly one of these reaches a sink's `error` capability: GraphQL errors
/// from an `error` message, the close event that ended the connection, or a
/// socket-level failure description.
#[derive(Debug, Clone, Error)]
pub enum SubscriptionError {
    /// The server ended the operation with an `error` message.
    #[error("graphql errors: {0:?}")]
    Graphql(Vec<GraphqlError>),

    /// The connection closed before the operation completed.
    #[error("connection closed ({0})")]
    Closed(CloseEvent),

    /// Socket-level failure.
    #[error("transport error: {0}")]
    Transport(String),
}
