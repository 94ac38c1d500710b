//! Wire protocol types for `graphql-transport-ws`.
//!
//! Messages travel as single JSON objects `{type, id?, payload?}` inside text
//! frames. Decoding is strict: unknown types, a missing or empty `id` on an
//! operation-scoped message, and an `id` on a connection-scoped message are
//! all rejected before any payload is interpreted.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

/// The WebSocket subprotocol identifier peers must negotiate.
pub const GRAPHQL_TRANSPORT_WS_PROTOCOL: &str = "graphql-transport-ws";

// ─────────────────────────────────────────────────────────────────────────────
// Close codes
// ─────────────────────────────────────────────────────────────────────────────

/// Close codes with wire-level significance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// 1000: normal close.
    NormalClosure,
    /// 1011: unexpected server error.
    InternalServerError,
    /// 4400: malformed message or protocol violation.
    BadRequest,
    /// 4401: handshake not initialised before an operation.
    Unauthorized,
    /// 4403: handshake rejected by the connect hook.
    Forbidden,
    /// 4406: subprotocol not negotiated.
    SubprotocolNotAcceptable,
    /// 4408: `connection_init` not received within the deadline.
    ConnectionInitialisationTimeout,
    /// 4409: duplicate active operation id.
    SubscriberAlreadyExists,
    /// 4429: a second `connection_init` after acknowledgement.
    TooManyInitialisationRequests,
}

impl CloseCode {
    /// Numeric close code.
    #[must_use]
    pub const fn code(self) -> u16 {
        match self {
            Self::NormalClosure => 1000,
            Self::InternalServerError => 1011,
            Self::BadRequest => 4400,
            Self::Unauthorized => 4401,
            Self::Forbidden => 4403,
            Self::SubprotocolNotAcceptable => 4406,
            Self::ConnectionInitialisationTimeout => 4408,
            Self::SubscriberAlreadyExists => 4409,
            Self::TooManyInitialisationRequests => 4429,
        }
    }

    /// Default close reason.
    #[must_use]
    pub const fn reason(self) -> &'static str {
        match self {
            Self::NormalClosure => "Normal Closure",
            Self::InternalServerError => "Internal server error",
            Self::BadRequest => "Bad Request",
            Self::Unauthorized => "Unauthorized",
            Self::Forbidden => "Forbidden",
            Self::SubprotocolNotAcceptable => "Subprotocol not acceptable",
            Self::ConnectionInitialisationTimeout => "Connection initialisation timeout",
            Self::SubscriberAlreadyExists => "Subscriber already exists",
            Self::TooManyInitialisationRequests => "Too many initialisation requests",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// GraphQL result types
// ─────────────────────────────────────────────────────────────────────────────

/// GraphQL error location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorLocation {
    /// Line number in the document (1-based).
    pub line: u32,
    /// Column number in the document (1-based).
    pub column: u32,
}

/// GraphQL path segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    /// Field name.
    Key(String),
    /// List index.
    Index(i64),
}

/// GraphQL error in the response format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphqlError {
    /// Human-readable error message.
    pub message: String,
    /// Location(s) within the document.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<ErrorLocation>,
    /// Path within the response where the error occurred.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<PathSegment>,
    /// Extensions metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl GraphqlError {
    /// Create an error carrying only a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            locations: Vec::new(),
            path: Vec::new(),
            extensions: None,
        }
    }
}

/// Result of executing a GraphQL operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Response data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// GraphQL errors.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<GraphqlError>,
    /// Extensions payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl ExecutionResult {
    /// A result carrying only data.
    #[must_use]
    pub fn from_data(data: Value) -> Self {
        Self {
            data: Some(data),
            ..Self::default()
        }
    }

    /// A result carrying only errors.
    #[must_use]
    pub fn from_errors(errors: Vec<GraphqlError>) -> Self {
        Self {
            errors,
            ..Self::default()
        }
    }
}

/// Payload of a `subscribe` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    /// Operation to run when the document contains several.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
    /// GraphQL document text.
    pub query: String,
    /// Variable values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Value>,
    /// Extensions payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl SubscribeRequest {
    /// Create a request for a bare document.
    #[must_use]
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            operation_name: None,
            query: query.into(),
            variables: None,
            extensions: None,
        }
    }

    /// Attach an operation name.
    #[must_use]
    pub fn with_operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }

    /// Attach variable values.
    #[must_use]
    pub fn with_variables(mut self, variables: Value) -> Self {
        self.variables = Some(variables);
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Messages
// ─────────────────────────────────────────────────────────────────────────────

/// Protocol message.
///
/// Serialization follows the wire format directly; use [`Message::decode`]
/// for inbound frames so the strict shape rules apply.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Client → server handshake opener.
    ConnectionInit {
        /// Connection params forwarded to the connect hook.
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    /// Server → client handshake acknowledgement.
    ConnectionAck {
        /// Optional payload echoed by the connect hook.
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    /// Keepalive probe, either direction.
    Ping {
        /// Opaque payload echoed in the `pong`.
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    /// Keepalive reply, either direction.
    Pong {
        /// Opaque payload.
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    /// Client → server operation start.
    Subscribe {
        /// Operation id, unique while the operation is active.
        id: String,
        /// The operation to run.
        payload: SubscribeRequest,
    },
    /// Server → client operation result.
    Next {
        /// Operation id.
        id: String,
        /// One execution result.
        payload: ExecutionResult,
    },
    /// Server → client terminal failure for one operation.
    Error {
        /// Operation id.
        id: String,
        /// The errors that ended the operation.
        payload: Vec<GraphqlError>,
    },
    /// Terminal completion for one operation, either direction.
    Complete {
        /// Operation id.
        id: String,
    },
}

/// Raw envelope used for strict decoding.
#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    payload: Option<Value>,
}

impl Message {
    /// Decode a text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawMessage =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        match raw.kind.as_str() {
            "connection_init" => Ok(Self::ConnectionInit {
                payload: reject_id(raw, "connection_init")?,
            }),
            "connection_ack" => Ok(Self::ConnectionAck {
                payload: reject_id(raw, "connection_ack")?,
            }),
            "ping" => Ok(Self::Ping {
                payload: reject_id(raw, "ping")?,
            }),
            "pong" => Ok(Self::Pong {
                payload: reject_id(raw, "pong")?,
            }),
            "subscribe" => {
                let id = require_id(raw.id, "subscribe")?;
                let payload = raw
                    .payload
                    .ok_or(ProtocolError::MissingPayload("subscribe"))?;
                let payload: SubscribeRequest = serde_json::from_value(payload)
                    .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
                Ok(Self::Subscribe { id, payload })
            }
            "next" => {
                let id = require_id(raw.id, "next")?;
                let payload = raw.payload.ok_or(ProtocolError::MissingPayload("next"))?;
                let payload: ExecutionResult = serde_json::from_value(payload)
                    .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
                Ok(Self::Next { id, payload })
            }
            "error" => {
                let id = require_id(raw.id, "error")?;
                let payload = raw.payload.ok_or(ProtocolError::MissingPayload("error"))?;
                let payload = decode_errors(payload)?;
                Ok(Self::Error { id, payload })
            }
            "complete" => {
                let id = require_id(raw.id, "complete")?;
                Ok(Self::Complete { id })
            }
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }

    /// Encode to a text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialize(e.to_string()))
    }

    /// The operation id this message is scoped to, if any.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Subscribe { id, .. }
            | Self::Next { id, .. }
            | Self::Error { id, .. }
            | Self::Complete { id } => Some(id),
            _ => None,
        }
    }
}

fn require_id(id: Option<String>, kind: &'static str) -> Result<String, ProtocolError> {
    match id {
        Some(id) if !id.is_empty() => Ok(id),
        _ => Err(ProtocolError::MissingId(kind)),
    }
}

fn reject_id(raw: RawMessage, kind: &'static str) -> Result<Option<Value>, ProtocolError> {
    if raw.id.is_some() {
        return Err(ProtocolError::UnexpectedId(kind));
    }
    Ok(raw.payload)
}

// The `error` payload is an array of GraphQL errors; a bare error object is
// tolerated and wrapped.
fn decode_errors(payload: Value) -> Result<Vec<GraphqlError>, ProtocolError> {
    if payload.is_array() {
        serde_json::from_value(payload).map_err(|e| ProtocolError::Malformed(e.to_string()))
    } else {
        serde_json::from_value::<GraphqlError>(payload)
            .map(|err| vec![err])
            .map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_connection_init() {
        let msg = Message::decode(r#"{"type":"connection_init"}"#).unwrap();
        assert_eq!(msg, Message::ConnectionInit { payload: None });

        let msg = Message::decode(r#"{"type":"connection_init","payload":{"token":"t"}}"#).unwrap();
        let Message::ConnectionInit { payload: Some(p) } = msg else {
            panic!("expected payload");
        };
        assert_eq!(p["token"], "t");
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let err = Message::decode(r#"{"type":"start","id":"1"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownType(t) if t == "start"));
    }

    #[test]
    fn decode_rejects_id_on_connection_scoped() {
        let err = Message::decode(r#"{"type":"connection_init","id":"1"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedId("connection_init")));
    }

    #[test]
    fn decode_rejects_missing_or_empty_id() {
        let err = Message::decode(r#"{"type":"complete"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingId("complete")));

        let err =
            Message::decode(r#"{"type":"subscribe","id":"","payload":{"query":"{ hello }"}}"#)
                .unwrap_err();
        assert!(matches!(err, ProtocolError::MissingId("subscribe")));
    }

    #[test]
    fn decode_rejects_non_object() {
        assert!(Message::decode("[1,2,3]").is_err());
        assert!(Message::decode("\"subscribe\"").is_err());
        assert!(Message::decode("not json").is_err());
    }

    #[test]
    fn decode_subscribe_requires_query() {
        let err = Message::decode(r#"{"type":"subscribe","id":"1","payload":{}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));

        let msg = Message::decode(
            r#"{"type":"subscribe","id":"1","payload":{"query":"{ hello }","operationName":"Q"}}"#,
        )
        .unwrap();
        let Message::Subscribe { id, payload } = msg else {
            panic!("expected subscribe");
        };
        assert_eq!(id, "1");
        assert_eq!(payload.query, "{ hello }");
        assert_eq!(payload.operation_name.as_deref(), Some("Q"));
    }

    #[test]
    fn decode_error_wraps_bare_object() {
        let msg = Message::decode(r#"{"type":"error","id":"1","payload":{"message":"boom"}}"#)
            .unwrap();
        let Message::Error { payload, .. } = msg else {
            panic!("expected error");
        };
        assert_eq!(payload.len(), 1);
        assert_eq!(payload[0].message, "boom");
    }

    #[test]
    fn encode_subscribe_wire_shape() {
        let msg = Message::Subscribe {
            id: "1".to_string(),
            payload: SubscribeRequest::new("{ hello }"),
        };
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "subscribe");
        assert_eq!(value["id"], "1");
        assert_eq!(value["payload"]["query"], "{ hello }");
        assert!(value["payload"].get("operationName").is_none());
    }

    #[test]
    fn encode_decode_roundtrip_next() {
        let msg = Message::Next {
            id: "op-1".to_string(),
            payload: ExecutionResult::from_data(serde_json::json!({"hello": "Hello World!"})),
        };
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn close_codes() {
        assert_eq!(CloseCode::BadRequest.code(), 4400);
        assert_eq!(CloseCode::Unauthorized.code(), 4401);
        assert_eq!(CloseCode::SubscriberAlreadyExists.code(), 4409);
        assert_eq!(CloseCode::TooManyInitialisationRequests.code(), 4429);
        assert_eq!(CloseCode::ConnectionInitialisationTimeout.code(), 4408);
        assert_eq!(CloseCode::SubprotocolNotAcceptable.code(), 4406);
        assert_eq!(CloseCode::Forbidden.code(), 4403);
    }

    #[test]
    fn execution_result_skips_empty_fields() {
        let result = ExecutionResult::from_data(serde_json::json!({"a": 1}));
        let text = serde_json::to_string(&result).unwrap();
        assert!(!text.contains("errors"));
        assert!(!text.contains("extensions"));
    }

    #[test]
    fn graphql_error_path_segments() {
        let err: GraphqlError = serde_json::from_str(
            r#"{"message":"oops","path":["viewer",0,"id"],"locations":[{"line":1,"column":2}]}"#,
        )
        .unwrap();
        assert_eq!(err.path[0], PathSegment::Key("viewer".to_string()));
        assert_eq!(err.path[1], PathSegment::Index(0));
        assert_eq!(err.locations[0].line, 1);
    }
}
