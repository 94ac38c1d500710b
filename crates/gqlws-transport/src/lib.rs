//! WebSocket transport adapter for the gqlws protocol crates.
//!
//! Wraps `tokio-tungstenite` into a message-oriented full-duplex transport:
//!
//! - **Client**: HTTP upgrade with a subprotocol offer and connect timeout
//! - **Server**: acceptor that negotiates a required subprotocol
//! - **Framing**: text/binary/ping/pong/close messages with close codes
//! - **Splitting**: independent sink/source halves so a connection can run a
//!   dedicated writer task alongside its reader

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

mod error;
mod websocket;

pub use error::{TransportError, TransportResult};
pub use websocket::{
    WsClient, WsCloseFrame, WsConfig, WsConnection, WsMessage, WsSink, WsSource, accept,
};
