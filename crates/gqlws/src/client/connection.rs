//! Client connection actor.
//!
//! One background task owns the socket and the operation registry. Commands
//! arrive on an unbounded channel, frames on the transport; both are handled
//! from the same loop, so the send queue and inbound dispatch stay serialized.
//! Connections are established lazily (unless configured eager), torn down
//! when the last operation finishes, and retried with backoff on
//! non-fatal closes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, interval_at, sleep};
use tracing::{debug, warn};

use gqlws_transport::{WsClient, WsCloseFrame, WsConfig, WsConnection};

use crate::client::retry::is_fatal_close_code;
use crate::client::subscription::EventSink;
use crate::client::{ClientConfig, ClientHooks, ConnectionParams, IdGenerator, RetryPredicate};
use crate::error::{CloseEvent, SubscriptionError};
use crate::frames::{Inbound, classify};
use crate::protocol::{CloseCode, GRAPHQL_TRANSPORT_WS_PROTOCOL, Message, SubscribeRequest};

/// Commands from [`crate::client::Client`] handles to the actor.
pub(crate) enum Command {
    Subscribe(PendingOperation),
    Unsubscribe { key: u64 },
    Close,
}

/// A subscription as handed over by the caller.
pub(crate) struct PendingOperation {
    pub key: u64,
    pub request: SubscribeRequest,
    pub sink: Box<dyn EventSink>,
    pub retry: Option<bool>,
}

struct ClientOperation {
    request: SubscribeRequest,
    sink: Box<dyn EventSink>,
    retry: bool,
    /// Wire id on the current connection; `None` while not subscribed.
    id: Option<String>,
}

enum SessionEnd {
    /// Close command received or every handle dropped.
    Shutdown,
    /// Lazy teardown after the last operation finished.
    Idle,
    /// Socket-level failure without a close event.
    Failed(String),
    /// Connection closed with an event.
    Closed(CloseEvent),
}

pub(crate) struct ConnectionActor {
    config: ClientConfig,
    params: ConnectionParams,
    should_retry: Option<RetryPredicate>,
    hooks: Arc<dyn ClientHooks>,
    generate_id: IdGenerator,
    commands: mpsc::UnboundedReceiver<Command>,
    operations: HashMap<u64, ClientOperation>,
    attempts: u32,
    /// Once set, the actor waits for a command before (re)connecting.
    connect_deferred: bool,
}

impl ConnectionActor {
    pub(crate) fn new(
        config: ClientConfig,
        params: ConnectionParams,
        should_retry: Option<RetryPredicate>,
        hooks: Arc<dyn ClientHooks>,
        generate_id: IdGenerator,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let connect_deferred = config.lazy;
        Self {
            config,
            params,
            should_retry,
            hooks,
            generate_id,
            commands,
            operations: HashMap::new(),
            attempts: 0,
            connect_deferred,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            while self.operations.is_empty() && self.connect_deferred {
                match self.commands.recv().await {
                    Some(Command::Subscribe(op)) => self.register(op),
                    Some(Command::Unsubscribe { key }) => {
                        self.operations.remove(&key);
                    }
                    Some(Command::Close) | None => {
                        self.shutdown();
                        return;
                    }
                }
            }

            match self.session().await {
                SessionEnd::Shutdown => {
                    self.shutdown();
                    return;
                }
                SessionEnd::Idle => {
                    self.attempts = 0;
                    self.connect_deferred = true;
                }
                SessionEnd::Failed(reason) => {
                    self.hooks.on_closed(None);
                    if self.operations.is_empty() || self.attempts >= self.config.retry.max_attempts
                    {
                        self.fail_all(SubscriptionError::Transport(reason));
                        self.attempts = 0;
                        self.connect_deferred = true;
                    } else {
                        self.attempts += 1;
                        if !self.backoff().await {
                            self.shutdown();
                            return;
                        }
                    }
                }
                SessionEnd::Closed(event) => {
                    self.hooks.on_closed(Some(&event));
                    let retryable = !self.operations.is_empty()
                        && self.attempts < self.config.retry.max_attempts
                        && self.close_retryable(&event);
                    if retryable {
                        // Operations that opted out ride no retry; they see
                        // the close event now.
                        let err = SubscriptionError::Closed(event);
                        self.operations.retain(|_, op| {
                            if op.retry {
                                true
                            } else {
                                op.sink.error(err.clone());
                                false
                            }
                        });
                        if self.operations.is_empty() {
                            self.attempts = 0;
                            self.connect_deferred = true;
                        } else {
                            self.attempts += 1;
                            if !self.backoff().await {
                                self.shutdown();
                                return;
                            }
                        }
                    } else {
                        self.fail_all(SubscriptionError::Closed(event));
                        self.attempts = 0;
                        self.connect_deferred = true;
                    }
                }
            }
        }
    }

    /// One connection from dial to close.
    async fn session(&mut self) -> SessionEnd {
        for op in self.operations.values_mut() {
            op.id = None;
        }

        self.hooks.on_connecting();
        debug!(url = %self.config.url, attempt = self.attempts, "connecting");

        let params = self.params.resolve().await;
        let ws_config = WsConfig::new().with_subprotocol(GRAPHQL_TRANSPORT_WS_PROTOCOL);
        let client = WsClient::with_config(self.config.url.clone(), ws_config);
        let mut conn = match client.connect().await {
            Ok(conn) => conn,
            Err(e) => {
                debug!(error = %e, "connect failed");
                return SessionEnd::Failed(e.to_string());
            }
        };

        if conn.subprotocol() != Some(GRAPHQL_TRANSPORT_WS_PROTOCOL) {
            let code = CloseCode::SubprotocolNotAcceptable;
            let _ = conn
                .close(WsCloseFrame::new(code.code(), code.reason()))
                .await;
            return SessionEnd::Closed(CloseEvent::new(code.code(), code.reason()));
        }

        if let Err(e) = conn
            .send_json(&Message::ConnectionInit { payload: params })
            .await
        {
            return SessionEnd::Failed(e.to_string());
        }

        match self.await_ack(&mut conn).await {
            Ok(()) => {}
            Err(end) => return end,
        }
        self.hooks.on_connected();
        self.attempts = 0;
        debug!("connection acknowledged");

        // Drain everything queued or carried over from the previous
        // connection, each under a fresh id.
        let mut active: HashMap<String, u64> = HashMap::new();
        let keys: Vec<u64> = self.operations.keys().copied().collect();
        for key in keys {
            if let Err(end) = self.subscribe_on_wire(&mut conn, &mut active, key).await {
                return end;
            }
        }

        let period = self.config.keep_alive.unwrap_or(Duration::from_secs(86_400));
        let mut keepalive = interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Subscribe(op)) => {
                        let key = op.key;
                        self.register(op);
                        if let Err(end) = self.subscribe_on_wire(&mut conn, &mut active, key).await {
                            return end;
                        }
                    }
                    Some(Command::Unsubscribe { key }) => {
                        if let Some(op) = self.operations.remove(&key) {
                            if let Some(id) = op.id {
                                active.remove(&id);
                                if let Err(e) = conn.send_json(&Message::Complete { id }).await {
                                    return SessionEnd::Failed(e.to_string());
                                }
                            }
                        }
                        if self.idle_teardown(&mut conn).await {
                            return SessionEnd::Idle;
                        }
                    }
                    Some(Command::Close) | None => {
                        let _ = conn.close(WsCloseFrame::normal()).await;
                        return SessionEnd::Shutdown;
                    }
                },
                frame = conn.recv() => match frame {
                    Err(e) => return SessionEnd::Failed(e.to_string()),
                    Ok(None) => {
                        return SessionEnd::Closed(CloseEvent::abnormal("connection dropped"));
                    }
                    Ok(Some(ws)) => match classify(ws) {
                        Inbound::Control => {}
                        Inbound::Closed(frame) => return SessionEnd::Closed(close_event(frame)),
                        Inbound::Violation(err) => {
                            return protocol_close(&mut conn, err.to_string()).await;
                        }
                        Inbound::Message(msg) => {
                            self.hooks.on_message(&msg);
                            match msg {
                                Message::Next { id, payload } => {
                                    if let Some(key) = active.get(&id) {
                                        if let Some(op) = self.operations.get_mut(key) {
                                            op.sink.next(payload);
                                        }
                                    }
                                }
                                Message::Error { id, payload } => {
                                    if let Some(key) = active.remove(&id) {
                                        if let Some(mut op) = self.operations.remove(&key) {
                                            op.sink.error(SubscriptionError::Graphql(payload));
                                        }
                                    }
                                    if self.idle_teardown(&mut conn).await {
                                        return SessionEnd::Idle;
                                    }
                                }
                                Message::Complete { id } => {
                                    if let Some(key) = active.remove(&id) {
                                        if let Some(mut op) = self.operations.remove(&key) {
                                            op.sink.complete();
                                        }
                                    }
                                    if self.idle_teardown(&mut conn).await {
                                        return SessionEnd::Idle;
                                    }
                                }
                                Message::Ping { payload } => {
                                    if let Err(e) =
                                        conn.send_json(&Message::Pong { payload }).await
                                    {
                                        return SessionEnd::Failed(e.to_string());
                                    }
                                }
                                // A duplicate ack is tolerated.
                                Message::Pong { .. } | Message::ConnectionAck { .. } => {}
                                Message::ConnectionInit { .. } | Message::Subscribe { .. } => {
                                    return protocol_close(
                                        &mut conn,
                                        "unexpected client-to-server message".to_string(),
                                    )
                                    .await;
                                }
                            }
                        }
                    }
                },
                _ = keepalive.tick(), if self.config.keep_alive.is_some() => {
                    if let Err(e) = conn.send_json(&Message::Ping { payload: None }).await {
                        return SessionEnd::Failed(e.to_string());
                    }
                }
            }
        }
    }

    /// Wait for `connection_ack`, tolerating keepalives.
    async fn await_ack(&mut self, conn: &mut WsConnection) -> Result<(), SessionEnd> {
        let deadline = sleep(self.config.connection_ack_timeout);
        tokio::pin!(deadline);

        loop {
            let frame = tokio::select! {
                () = &mut deadline => {
                    let reason = "Connection acknowledgement timeout";
                    let _ = conn
                        .close(WsCloseFrame::new(CloseCode::BadRequest.code(), reason))
                        .await;
                    return Err(SessionEnd::Closed(CloseEvent::new(
                        CloseCode::BadRequest.code(),
                        reason,
                    )));
                }
                frame = conn.recv() => frame,
            };

            match frame {
                Err(e) => return Err(SessionEnd::Failed(e.to_string())),
                Ok(None) => {
                    return Err(SessionEnd::Closed(CloseEvent::abnormal(
                        "connection dropped before ack",
                    )));
                }
                Ok(Some(ws)) => match classify(ws) {
                    Inbound::Control => {}
                    Inbound::Closed(frame) => return Err(SessionEnd::Closed(close_event(frame))),
                    Inbound::Violation(err) => {
                        return Err(protocol_close(conn, err.to_string()).await);
                    }
                    Inbound::Message(msg) => {
                        self.hooks.on_message(&msg);
                        match msg {
                            Message::ConnectionAck { payload: _ } => return Ok(()),
                            Message::Ping { payload } => {
                                if let Err(e) = conn.send_json(&Message::Pong { payload }).await {
                                    return Err(SessionEnd::Failed(e.to_string()));
                                }
                            }
                            Message::Pong { .. } => {}
                            other => {
                                debug!(message = ?other, "unexpected message before ack");
                                return Err(protocol_close(
                                    conn,
                                    "expected connection_ack".to_string(),
                                )
                                .await);
                            }
                        }
                    }
                },
            }
        }
    }

    /// Put one registered operation on the wire under a fresh id.
    async fn subscribe_on_wire(
        &mut self,
        conn: &mut WsConnection,
        active: &mut HashMap<String, u64>,
        key: u64,
    ) -> Result<(), SessionEnd> {
        if !self.operations.contains_key(&key) {
            return Ok(());
        }

        let mut id = (self.generate_id)();
        while active.contains_key(&id) {
            warn!(%id, "operation id collision, regenerating");
            id = (self.generate_id)();
        }
        active.insert(id.clone(), key);

        let request = match self.operations.get_mut(&key) {
            Some(op) => {
                op.id = Some(id.clone());
                op.request.clone()
            }
            None => return Ok(()),
        };

        if let Err(e) = conn
            .send_json(&Message::Subscribe {
                id,
                payload: request,
            })
            .await
        {
            return Err(SessionEnd::Failed(e.to_string()));
        }
        Ok(())
    }

    async fn idle_teardown(&mut self, conn: &mut WsConnection) -> bool {
        if self.config.lazy && self.operations.is_empty() {
            debug!("last operation finished, closing lazily");
            let _ = conn.close(WsCloseFrame::normal()).await;
            return true;
        }
        false
    }

    /// Sleep out the backoff while still accepting commands. Returns `false`
    /// on shutdown.
    async fn backoff(&mut self) -> bool {
        let wait = self
            .config
            .retry
            .wait_for_attempt(self.attempts.saturating_sub(1));
        debug!(attempt = self.attempts, wait_ms = wait.as_millis() as u64, "backing off");
        let delay = sleep(wait);
        tokio::pin!(delay);

        loop {
            tokio::select! {
                () = &mut delay => return true,
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Subscribe(op)) => self.register(op),
                    Some(Command::Unsubscribe { key }) => {
                        self.operations.remove(&key);
                    }
                    Some(Command::Close) | None => return false,
                }
            }
        }
    }

    fn register(&mut self, op: PendingOperation) {
        let retry = op.retry.unwrap_or(self.config.resubscribe);
        self.operations.insert(
            op.key,
            ClientOperation {
                request: op.request,
                sink: op.sink,
                retry,
                id: None,
            },
        );
    }

    fn close_retryable(&self, event: &CloseEvent) -> bool {
        match &self.should_retry {
            Some(predicate) => predicate(event),
            None => !is_fatal_close_code(event.code),
        }
    }

    fn fail_all(&mut self, error: SubscriptionError) {
        for (_, mut op) in self.operations.drain() {
            op.sink.error(error.clone());
        }
    }

    fn shutdown(&mut self) {
        for (_, mut op) in self.operations.drain() {
            op.sink.complete();
        }
    }
}

fn close_event(frame: Option<WsCloseFrame>) -> CloseEvent {
    frame.map_or_else(
        || CloseEvent::abnormal("connection closed without a close frame"),
        |f| CloseEvent::new(f.code, f.reason),
    )
}

async fn protocol_close(conn: &mut WsConnection, reason: String) -> SessionEnd {
    let _ = conn
        .close(WsCloseFrame::new(CloseCode::BadRequest.code(), reason.clone()))
        .await;
    SessionEnd::Closed(CloseEvent::new(CloseCode::BadRequest.code(), reason))
}
