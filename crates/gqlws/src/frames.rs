//! Inbound frame classification shared by both peers.

use gqlws_transport::{WsCloseFrame, WsMessage};

use crate::error::ProtocolError;
use crate::protocol::Message;

/// What a received WebSocket frame means to the protocol layer.
pub(crate) enum Inbound {
    /// A decoded protocol message.
    Message(Message),
    /// A frame the codec rejected; the connection closes with 4400.
    Violation(ProtocolError),
    /// Transport-level ping/pong, handled below this layer.
    Control,
    /// The peer closed the connection.
    Closed(Option<WsCloseFrame>),
}

pub(crate) fn classify(frame: WsMessage) -> Inbound {
    match frame {
        WsMessage::Text(text) => decode(&text),
        // JSON in binary frames is tolerated; the payload rules still apply.
        WsMessage::Binary(bytes) => match String::from_utf8(bytes) {
            Ok(text) => decode(&text),
            Err(_) => Inbound::Violation(ProtocolError::Malformed(
                "binary frame is not valid UTF-8".to_string(),
            )),
        },
        WsMessage::Ping(_) | WsMessage::Pong(_) => Inbound::Control,
        WsMessage::Close(frame) => Inbound::Closed(frame),
    }
}

fn decode(text: &str) -> Inbound {
    match Message::decode(text) {
        Ok(message) => Inbound::Message(message),
        Err(err) => Inbound::Violation(err),
    }
}
