//! Shared fixtures: a scriptable engine and raw WebSocket peers.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, Stream, StreamExt};
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message as TtMessage};
use tokio_tungstenite::{WebSocketStream, accept_hdr_async};

use gqlws::{
    ExecutionResult, GraphqlEngine, GraphqlError, OperationContext, OperationKind, ResultStream,
    Server, SubscribeRequest,
};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

// ─────────────────────────────────────────────────────────────────────────────
// Test engine
// ─────────────────────────────────────────────────────────────────────────────

/// Engine with canned behaviors keyed off the document text:
///
/// - `{ hello }` resolves to `Hello World!`
/// - `{ params }` echoes the accepted connection params
/// - `subscription { greetings }` streams five greetings and completes
/// - `subscription { counter }` streams integers forever, paced
/// - `subscription { forever }` never yields; dropping it sets the cancel flag
/// - `subscription { failing }` errors after starting
/// - anything containing `__invalid` fails validation
#[derive(Clone, Default)]
pub struct TestEngine {
    pub cancelled: Arc<AtomicBool>,
}

pub const GREETINGS: [&str; 5] = ["Hi", "Bonjour", "Hola", "Ciao", "Zdravo"];

#[async_trait]
impl GraphqlEngine for TestEngine {
    fn plan(&self, request: &SubscribeRequest) -> Result<OperationKind, Vec<GraphqlError>> {
        let query = request.query.trim();
        if query.contains("__invalid") {
            return Err(vec![GraphqlError::new("Cannot query field \"__invalid\"")]);
        }
        if query.starts_with("subscription") {
            Ok(OperationKind::Subscription)
        } else if query.starts_with("mutation") {
            Ok(OperationKind::Mutation)
        } else {
            Ok(OperationKind::Query)
        }
    }

    async fn execute(&self, ctx: OperationContext) -> ExecutionResult {
        if ctx.request.query.contains("params") {
            let params = ctx.connection_params.unwrap_or(Value::Null);
            return ExecutionResult::from_data(json!({ "params": params }));
        }
        ExecutionResult::from_data(json!({ "hello": "Hello World!" }))
    }

    async fn subscribe(&self, ctx: OperationContext) -> Result<ResultStream, Vec<GraphqlError>> {
        let query = ctx.request.query;
        if query.contains("greetings") {
            let items = GREETINGS
                .iter()
                .map(|g| Ok(ExecutionResult::from_data(json!({ "greetings": g }))))
                .collect::<Vec<_>>();
            return Ok(Box::pin(futures_util::stream::iter(items)));
        }
        if query.contains("counter") {
            let stream = futures_util::stream::unfold(0_u64, |n| async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Some((
                    Ok(ExecutionResult::from_data(json!({ "counter": n }))),
                    n + 1,
                ))
            });
            return Ok(Box::pin(stream));
        }
        if query.contains("forever") {
            return Ok(Box::pin(NeverStream {
                _guard: DropFlag(Arc::clone(&self.cancelled)),
            }));
        }
        if query.contains("failing") {
            let items = vec![Err(vec![GraphqlError::new("source exploded")])];
            return Ok(Box::pin(futures_util::stream::iter(items)));
        }
        Err(vec![GraphqlError::new("unknown subscription")])
    }
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Never yields; observable through the drop flag when cancelled.
struct NeverStream {
    _guard: DropFlag,
}

impl Stream for NeverStream {
    type Item = Result<ExecutionResult, Vec<GraphqlError>>;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Poll::Pending
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Server under test
// ─────────────────────────────────────────────────────────────────────────────

pub async fn spawn_server<E: GraphqlEngine>(server: Server<E>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = server.listen(listener).await;
    });
    addr
}

// ─────────────────────────────────────────────────────────────────────────────
// Raw peers (tokio-tungstenite directly)
// ─────────────────────────────────────────────────────────────────────────────

pub type RawClient = WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>;
pub type RawServerSocket = WebSocketStream<TcpStream>;

/// Connect a raw client offering the `graphql-transport-ws` subprotocol.
pub async fn connect_raw(addr: SocketAddr) -> RawClient {
    connect_raw_with_protocol(addr, Some("graphql-transport-ws")).await
}

pub async fn connect_raw_with_protocol(addr: SocketAddr, protocol: Option<&str>) -> RawClient {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    let mut request = format!("ws://{addr}")
        .into_client_request()
        .expect("request");
    if let Some(protocol) = protocol {
        request.headers_mut().insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_str(protocol).expect("header"),
        );
    }
    let (ws, _) = tokio_tungstenite::connect_async(request)
        .await
        .expect("connect");
    ws
}

/// A raw server that hands accepted sockets back to the test body.
pub async fn raw_ws_server() -> (String, mpsc::Receiver<RawServerSocket>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let url = format!("ws://{}", listener.local_addr().expect("local addr"));
    let (tx, rx) = mpsc::channel(4);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let Ok(ws) = accept_hdr_async(stream, echo_subprotocol).await else {
                continue;
            };
            if tx.send(ws).await.is_err() {
                break;
            }
        }
    });
    (url, rx)
}

fn echo_subprotocol(
    request: &Request,
    mut response: Response,
) -> Result<Response, ErrorResponse> {
    if request.headers().get(SEC_WEBSOCKET_PROTOCOL).is_some() {
        response.headers_mut().insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static("graphql-transport-ws"),
        );
    }
    Ok(response)
}

/// A raw server that upgrades without ever selecting a subprotocol.
pub async fn raw_ws_server_without_subprotocol() -> (String, mpsc::Receiver<RawServerSocket>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let url = format!("ws://{}", listener.local_addr().expect("local addr"));
    let (tx, rx) = mpsc::channel(4);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let Ok(ws) = accept_hdr_async(stream, ignore_subprotocol).await else {
                continue;
            };
            if tx.send(ws).await.is_err() {
                break;
            }
        }
    });
    (url, rx)
}

fn ignore_subprotocol(_request: &Request, response: Response) -> Result<Response, ErrorResponse> {
    Ok(response)
}

// ─────────────────────────────────────────────────────────────────────────────
// Frame helpers
// ─────────────────────────────────────────────────────────────────────────────

pub async fn send_json<S>(ws: &mut WebSocketStream<S>, value: &Value)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    ws.send(TtMessage::Text(value.to_string().into()))
        .await
        .expect("send");
}

pub async fn send_text<S>(ws: &mut WebSocketStream<S>, text: &str)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    ws.send(TtMessage::Text(text.to_string().into()))
        .await
        .expect("send");
}

/// Next data frame as JSON; skips transport pings/pongs.
pub async fn recv_json<S>(ws: &mut WebSocketStream<S>) -> Value
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let frame = timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("websocket error");
        match frame {
            TtMessage::Text(text) => return serde_json::from_str(&text).expect("json"),
            TtMessage::Binary(bytes) => return serde_json::from_slice(&bytes).expect("json"),
            TtMessage::Ping(_) | TtMessage::Pong(_) => {}
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Read frames until the close frame and return `(code, reason)`.
pub async fn recv_close<S>(ws: &mut WebSocketStream<S>) -> (u16, String)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let frame = timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for close");
        match frame {
            None => panic!("stream ended without a close frame"),
            Some(Ok(TtMessage::Close(Some(frame)))) => {
                return (frame.code.into(), frame.reason.to_string());
            }
            Some(Ok(TtMessage::Close(None))) => return (1005, String::new()),
            Some(Ok(_)) => {}
            Some(Err(e)) => panic!("websocket error while awaiting close: {e}"),
        }
    }
}

/// Assert that no data frame arrives within `window`.
pub async fn assert_silence<S>(ws: &mut WebSocketStream<S>, window: Duration)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let result = timeout(window, async {
        loop {
            match ws.next().await {
                Some(Ok(TtMessage::Text(text))) => return Some(text.to_string()),
                Some(Ok(TtMessage::Ping(_) | TtMessage::Pong(_))) => {}
                _ => return None,
            }
        }
    })
    .await;
    if let Ok(Some(text)) = result {
        panic!("expected silence, got frame: {text}");
    }
}

/// Close the socket with an application code.
pub async fn close_with<S>(ws: &mut WebSocketStream<S>, code: u16, reason: &str)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    ws.close(Some(CloseFrame {
        code: code.into(),
        reason: reason.to_string().into(),
    }))
    .await
    .expect("close");
}

/// Standard handshake from a raw client: init then expect ack.
pub async fn init_raw(ws: &mut RawClient) {
    send_json(ws, &json!({"type": "connection_init"})).await;
    let ack = recv_json(ws).await;
    assert_eq!(ack["type"], "connection_ack");
}
