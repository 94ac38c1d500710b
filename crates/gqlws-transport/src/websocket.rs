//! WebSocket connection primitives.
//!
//! Client connector with subprotocol negotiation, server acceptor, and a
//! splittable connection wrapper over `tokio-tungstenite`.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::{
    HeaderName, HeaderValue, SEC_WEBSOCKET_PROTOCOL,
};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, accept_hdr_async, connect_async};
use tracing::debug;
use url::Url;

use crate::{TransportError, TransportResult};

/// WebSocket message types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    /// Text message.
    Text(String),
    /// Binary message.
    Binary(Vec<u8>),
    /// Ping message.
    Ping(Vec<u8>),
    /// Pong message.
    Pong(Vec<u8>),
    /// Close message.
    Close(Option<WsCloseFrame>),
}

impl WsMessage {
    /// Create a text message.
    #[must_use]
    pub fn text(data: impl Into<String>) -> Self {
        Self::Text(data.into())
    }

    /// Check if this is a close message.
    #[must_use]
    pub const fn is_close(&self) -> bool {
        matches!(self, Self::Close(_))
    }

    /// Get text data if this is a text message.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Parse the payload as JSON.
    ///
    /// # Errors
    /// Returns a JSON error if the payload is not a data message or not valid
    /// JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match self {
            Self::Text(s) => serde_json::from_str(s),
            Self::Binary(b) => serde_json::from_slice(b),
            _ => Err(serde::de::Error::custom("not a data message")),
        }
    }
}

impl From<Message> for WsMessage {
    fn from(msg: Message) -> Self {
        match msg {
            Message::Text(s) => Self::Text(s.to_string()),
            Message::Binary(b) => Self::Binary(b.to_vec()),
            Message::Ping(b) => Self::Ping(b.to_vec()),
            Message::Pong(b) => Self::Pong(b.to_vec()),
            Message::Close(frame) => Self::Close(frame.map(|f| WsCloseFrame {
                code: f.code.into(),
                reason: f.reason.to_string(),
            })),
            Message::Frame(_) => Self::Binary(vec![]),
        }
    }
}

impl From<WsMessage> for Message {
    fn from(msg: WsMessage) -> Self {
        match msg {
            WsMessage::Text(s) => Self::Text(s.into()),
            WsMessage::Binary(b) => Self::Binary(b.into()),
            WsMessage::Ping(b) => Self::Ping(b.into()),
            WsMessage::Pong(b) => Self::Pong(b.into()),
            WsMessage::Close(frame) => Self::Close(frame.map(Into::into)),
        }
    }
}

/// WebSocket close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsCloseFrame {
    /// Close code.
    pub code: u16,
    /// Close reason.
    pub reason: String,
}

impl WsCloseFrame {
    /// Create a new close frame.
    #[must_use]
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Normal closure.
    #[must_use]
    pub fn normal() -> Self {
        Self::new(1000, "Normal Closure")
    }
}

impl From<WsCloseFrame> for tokio_tungstenite::tungstenite::protocol::CloseFrame {
    fn from(frame: WsCloseFrame) -> Self {
        use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
        Self {
            code: CloseCode::from(frame.code),
            reason: frame.reason.into(),
        }
    }
}

/// WebSocket client configuration.
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Additional handshake headers.
    pub headers: HashMap<String, String>,
    /// Subprotocols offered during the handshake.
    pub subprotocols: Vec<String>,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            headers: HashMap::new(),
            subprotocols: Vec::new(),
        }
    }
}

impl WsConfig {
    /// Create new configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set connection timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Add a handshake header.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Offer a subprotocol during the handshake.
    #[must_use]
    pub fn with_subprotocol(mut self, protocol: impl Into<String>) -> Self {
        self.subprotocols.push(protocol.into());
        self
    }
}

/// WebSocket client.
pub struct WsClient {
    url: String,
    config: WsConfig,
}

impl WsClient {
    /// Create a new WebSocket client.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            config: WsConfig::default(),
        }
    }

    /// Create with configuration.
    #[must_use]
    pub fn with_config(url: impl Into<String>, config: WsConfig) -> Self {
        Self {
            url: url.into(),
            config,
        }
    }

    /// Connect to the WebSocket server.
    ///
    /// Performs the HTTP upgrade, offering the configured subprotocols. The
    /// subprotocol the server selected (if any) is available on the returned
    /// connection.
    pub async fn connect(&self) -> TransportResult<WsConnection> {
        let url = Url::parse(&self.url)
            .map_err(|e: url::ParseError| TransportError::ConnectionFailed(e.to_string()))?;

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        for (key, value) in &self.config.headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
            request.headers_mut().insert(name, value);
        }

        if !self.config.subprotocols.is_empty() {
            let offer = self.config.subprotocols.join(", ");
            let value = HeaderValue::from_str(&offer)
                .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
            request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
        }

        let connect_result =
            tokio::time::timeout(self.config.connect_timeout, connect_async(request)).await;

        let Ok(ws_result) = connect_result else {
            return Err(TransportError::Timeout(self.config.connect_timeout));
        };

        let (inner, response) = ws_result.map_err(|e: tokio_tungstenite::tungstenite::Error| {
            TransportError::WebSocket(e.to_string())
        })?;

        let subprotocol = response
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        debug!(url = %url, subprotocol = ?subprotocol, "websocket connected");

        Ok(WsConnection {
            inner,
            subprotocol,
            closed: false,
        })
    }

    /// Get the URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Accept an inbound WebSocket handshake on a raw stream.
///
/// Negotiates `subprotocol` when the peer offered it; callers inspect
/// [`WsConnection::subprotocol`] to learn whether negotiation succeeded and
/// apply their own close policy when it did not.
pub async fn accept<S>(stream: S, subprotocol: &str) -> TransportResult<WsConnection<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let selected = HeaderValue::from_str(subprotocol)
        .map_err(|_| TransportError::InvalidState(format!("invalid subprotocol: {subprotocol}")))?;
    let mut negotiated = false;

    let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        let offered = request
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if offered.split(',').map(str::trim).any(|p| p == subprotocol) {
            response
                .headers_mut()
                .insert(SEC_WEBSOCKET_PROTOCOL, selected.clone());
            negotiated = true;
        }
        Ok(response)
    };

    let inner = accept_hdr_async(stream, callback)
        .await
        .map_err(|e| TransportError::WebSocket(e.to_string()))?;
    debug!(negotiated, "websocket accepted");

    Ok(WsConnection {
        inner,
        subprotocol: negotiated.then(|| subprotocol.to_string()),
        closed: false,
    })
}

/// Active WebSocket connection.
pub struct WsConnection<S = MaybeTlsStream<TcpStream>> {
    inner: WebSocketStream<S>,
    subprotocol: Option<String>,
    closed: bool,
}

impl<S> WsConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// The subprotocol negotiated during the handshake, if any.
    #[must_use]
    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    /// Send a message.
    pub async fn send(&mut self, message: WsMessage) -> TransportResult<()> {
        if self.closed {
            return Err(TransportError::InvalidState("connection is closed".into()));
        }
        self.inner
            .send(message.into())
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }

    /// Send a text message.
    pub async fn send_text(&mut self, text: impl Into<String>) -> TransportResult<()> {
        self.send(WsMessage::text(text)).await
    }

    /// Serialize a value to JSON and send it as a text message.
    pub async fn send_json<T: serde::Serialize + Sync>(&mut self, data: &T) -> TransportResult<()> {
        let json = serde_json::to_string(data).map_err(|e| TransportError::Parse(e.to_string()))?;
        self.send_text(json).await
    }

    /// Receive the next message. Returns `None` once the stream ends.
    pub async fn recv(&mut self) -> TransportResult<Option<WsMessage>> {
        if self.closed {
            return Ok(None);
        }
        match self.inner.next().await {
            Some(Ok(msg)) => {
                let ws_msg: WsMessage = msg.into();
                if ws_msg.is_close() {
                    self.closed = true;
                }
                Ok(Some(ws_msg))
            }
            Some(Err(e)) => Err(TransportError::WebSocket(e.to_string())),
            None => {
                self.closed = true;
                Ok(None)
            }
        }
    }

    /// Close the connection with a specific frame.
    pub async fn close(&mut self, frame: WsCloseFrame) -> TransportResult<()> {
        if !self.closed {
            self.closed = true;
            self.inner
                .send(Message::Close(Some(frame.into())))
                .await
                .map_err(|e| TransportError::WebSocket(e.to_string()))?;
        }
        Ok(())
    }

    /// Split into independent write and read halves.
    #[must_use]
    pub fn split(self) -> (WsSink<S>, WsSource<S>) {
        let (sink, source) = self.inner.split();
        (WsSink { inner: sink }, WsSource { inner: source })
    }
}

/// Write half of a split connection.
pub struct WsSink<S = MaybeTlsStream<TcpStream>> {
    inner: SplitSink<WebSocketStream<S>, Message>,
}

impl<S> WsSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Send a message.
    pub async fn send(&mut self, message: WsMessage) -> TransportResult<()> {
        self.inner
            .send(message.into())
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }

    /// Send a text message.
    pub async fn send_text(&mut self, text: impl Into<String>) -> TransportResult<()> {
        self.send(WsMessage::text(text)).await
    }

    /// Send a close frame.
    pub async fn close(&mut self, frame: WsCloseFrame) -> TransportResult<()> {
        self.inner
            .send(Message::Close(Some(frame.into())))
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }
}

/// Read half of a split connection.
pub struct WsSource<S = MaybeTlsStream<TcpStream>> {
    inner: SplitStream<WebSocketStream<S>>,
}

impl<S> WsSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Receive the next message. Returns `None` once the stream ends.
    pub async fn next(&mut self) -> Option<TransportResult<WsMessage>> {
        match self.inner.next().await {
            Some(Ok(msg)) => Some(Ok(msg.into())),
            Some(Err(e)) => Some(Err(TransportError::WebSocket(e.to_string()))),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_message_text() {
        let msg = WsMessage::text("hello");
        assert_eq!(msg.as_text(), Some("hello"));
        assert!(!msg.is_close());
    }

    #[test]
    fn ws_message_json() {
        let msg = WsMessage::text(r#"{"key": "value"}"#);

        #[derive(serde::Deserialize)]
        struct Data {
            key: String,
        }

        let data: Data = msg.json().unwrap();
        assert_eq!(data.key, "value");
    }

    #[test]
    fn ws_message_json_rejects_control_frames() {
        let msg = WsMessage::Ping(vec![]);
        assert!(msg.json::<serde_json::Value>().is_err());
    }

    #[test]
    fn ws_close_frame_roundtrip() {
        let frame = WsCloseFrame::new(4400, "Bad Request");
        let tungstenite: tokio_tungstenite::tungstenite::protocol::CloseFrame =
            frame.clone().into();
        let back = WsMessage::from(Message::Close(Some(tungstenite)));
        assert_eq!(back, WsMessage::Close(Some(frame)));
    }

    #[test]
    fn ws_config_builder() {
        let config = WsConfig::new()
            .with_connect_timeout(Duration::from_secs(3))
            .with_header("Authorization", "Bearer token")
            .with_subprotocol("graphql-transport-ws");

        assert_eq!(config.connect_timeout, Duration::from_secs(3));
        assert_eq!(
            config.headers.get("Authorization").map(String::as_str),
            Some("Bearer token")
        );
        assert_eq!(config.subprotocols, vec!["graphql-transport-ws"]);
    }
}
