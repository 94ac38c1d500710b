//! Per-socket protocol state machine.
//!
//! Each connection owns a serialized reader (this module) and a serialized
//! writer task; operation runners hand their outbound messages to the writer
//! channel, so traffic for different ids interleaves only on message
//! boundaries.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tracing::{debug, warn};

use gqlws_transport::{WsCloseFrame, WsConnection, WsSink};

use crate::engine::{GraphqlEngine, OperationContext};
use crate::frames::{Inbound, classify};
use crate::protocol::{CloseCode, Message, SubscribeRequest};
use crate::server::{ServerConfig, ServerHooks, runner};

/// Outbound traffic handed to the writer task.
pub(crate) enum Outbound {
    Message(Message),
    Close(CloseCode, String),
}

/// Registry slot for one active operation.
///
/// Dropping the slot resolves the runner's cancel receiver, which drops the
/// engine's result stream.
pub(crate) struct OperationSlot {
    _cancel: oneshot::Sender<()>,
}

pub(crate) type Registry = Arc<Mutex<HashMap<String, OperationSlot>>>;

pub(crate) async fn run<E, S>(
    engine: Arc<E>,
    hooks: Arc<dyn ServerHooks>,
    config: ServerConfig,
    conn: WsConnection<S>,
) where
    E: GraphqlEngine,
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    if conn.subprotocol().is_none() {
        let mut conn = conn;
        let code = CloseCode::SubprotocolNotAcceptable;
        let _ = conn
            .close(WsCloseFrame::new(code.code(), code.reason()))
            .await;
        return;
    }

    let (sink, source) = conn.split();
    let (out, out_rx) = mpsc::channel::<Outbound>(64);
    let writer = tokio::spawn(write_loop(sink, out_rx));

    let registry: Registry = Arc::new(Mutex::new(HashMap::new()));
    let mut session = Session {
        engine,
        hooks,
        config,
        out,
        registry: Arc::clone(&registry),
        source: Source(source),
        connection_params: None,
    };
    session.run().await;
    drop(session);

    // Cancels every still-active runner; their outbound senders drop and the
    // writer drains out.
    registry.lock().clear();
    let _ = writer.await;
}

async fn write_loop<S>(mut sink: WsSink<S>, mut rx: mpsc::Receiver<Outbound>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(out) = rx.recv().await {
        match out {
            Outbound::Message(msg) => match msg.encode() {
                Ok(text) => {
                    if let Err(e) = sink.send_text(text).await {
                        debug!(error = %e, "outbound write failed");
                        return;
                    }
                }
                Err(e) => warn!(error = %e, "dropping unencodable message"),
            },
            Outbound::Close(code, reason) => {
                let _ = sink.close(WsCloseFrame::new(code.code(), reason)).await;
                return;
            }
        }
    }
}

/// Read half wrapper classifying frames as they arrive.
struct Source<S>(gqlws_transport::WsSource<S>);

impl<S> Source<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    async fn next(&mut self) -> Inbound {
        match self.0.next().await {
            Some(Ok(frame)) => classify(frame),
            Some(Err(e)) => {
                debug!(error = %e, "transport error");
                Inbound::Closed(None)
            }
            None => Inbound::Closed(None),
        }
    }
}

struct Session<E, S> {
    engine: Arc<E>,
    hooks: Arc<dyn ServerHooks>,
    config: ServerConfig,
    out: mpsc::Sender<Outbound>,
    registry: Registry,
    source: Source<S>,
    connection_params: Option<Value>,
}

impl<E, S> Session<E, S>
where
    E: GraphqlEngine,
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn run(&mut self) {
        if self.handshake().await {
            self.ready_loop().await;
        }
    }

    /// Await `connection_init`, gate it through the connect hook, and
    /// acknowledge. Returns `false` when the connection must not proceed.
    async fn handshake(&mut self) -> bool {
        let deadline = sleep(self.config.connection_init_timeout);
        tokio::pin!(deadline);

        loop {
            let inbound = tokio::select! {
                () = &mut deadline => {
                    debug!("connection_init not received before the deadline");
                    self.close(CloseCode::ConnectionInitialisationTimeout, None).await;
                    return false;
                }
                inbound = self.source.next() => inbound,
            };

            match inbound {
                Inbound::Closed(_) => return false,
                Inbound::Control => {}
                Inbound::Violation(err) => {
                    self.close(err.close_code(), Some(err.to_string())).await;
                    return false;
                }
                Inbound::Message(Message::ConnectionInit { payload }) => {
                    match self.hooks.on_connect(payload.as_ref()).await {
                        Ok(ack) => {
                            self.connection_params = payload;
                            debug!("connection acknowledged");
                            return self.send(Message::ConnectionAck { payload: ack }).await;
                        }
                        Err(denied) => {
                            debug!("connection rejected by connect hook");
                            self.close(CloseCode::Forbidden, denied.reason).await;
                            return false;
                        }
                    }
                }
                Inbound::Message(Message::Ping { payload }) => {
                    if !self.send(Message::Pong { payload }).await {
                        return false;
                    }
                }
                Inbound::Message(Message::Pong { .. }) => {}
                Inbound::Message(Message::Subscribe { .. } | Message::Complete { .. }) => {
                    self.close(CloseCode::Unauthorized, None).await;
                    return false;
                }
                Inbound::Message(_) => {
                    self.close(CloseCode::BadRequest, None).await;
                    return false;
                }
            }
        }
    }

    async fn ready_loop(&mut self) {
        loop {
            match self.source.next().await {
                Inbound::Closed(_) => return,
                Inbound::Control => {}
                Inbound::Violation(err) => {
                    self.close(err.close_code(), Some(err.to_string())).await;
                    return;
                }
                Inbound::Message(msg) => match msg {
                    Message::Subscribe { id, payload } => {
                        if !self.start_operation(id, payload).await {
                            return;
                        }
                    }
                    Message::Complete { id } => {
                        // Dropping the slot cancels the runner; completes for
                        // unknown ids are ignored.
                        self.registry.lock().remove(&id);
                    }
                    Message::Ping { payload } => {
                        if !self.send(Message::Pong { payload }).await {
                            return;
                        }
                    }
                    Message::Pong { .. } => {}
                    Message::ConnectionInit { .. } => {
                        self.close(CloseCode::TooManyInitialisationRequests, None)
                            .await;
                        return;
                    }
                    Message::ConnectionAck { .. }
                    | Message::Next { .. }
                    | Message::Error { .. } => {
                        self.close(CloseCode::BadRequest, None).await;
                        return;
                    }
                },
            }
        }
    }

    /// Register an operation and spawn its runner. Returns `false` when the
    /// id is already active and the connection is closing with `4409`.
    async fn start_operation(&mut self, id: String, payload: SubscribeRequest) -> bool {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        {
            let mut ops = self.registry.lock();
            if ops.contains_key(&id) {
                drop(ops);
                let reason = format!("Subscriber for {id} already exists");
                self.close(CloseCode::SubscriberAlreadyExists, Some(reason))
                    .await;
                return false;
            }
            ops.insert(id.clone(), OperationSlot { _cancel: cancel_tx });
        }

        let ctx = OperationContext {
            id,
            request: payload,
            connection_params: self.connection_params.clone(),
        };
        tokio::spawn(runner::run(
            Arc::clone(&self.engine),
            Arc::clone(&self.hooks),
            ctx,
            self.out.clone(),
            Arc::clone(&self.registry),
            cancel_rx,
        ));
        true
    }

    async fn send(&mut self, msg: Message) -> bool {
        self.out.send(Outbound::Message(msg)).await.is_ok()
    }

    async fn close(&mut self, code: CloseCode, reason: Option<String>) {
        let reason = reason.unwrap_or_else(|| code.reason().to_string());
        let _ = self.out.send(Outbound::Close(code, reason)).await;
    }
}
