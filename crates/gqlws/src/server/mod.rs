//! Server endpoint: accepts WebSocket connections and executes GraphQL
//! operations against the configured engine, streaming results back.

mod connection;
mod runner;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use gqlws_transport::{TransportResult, WsConnection, accept};

use crate::engine::{GraphqlEngine, OperationContext, OperationKind};
use crate::protocol::{ExecutionResult, GRAPHQL_TRANSPORT_WS_PROTOCOL, GraphqlError};

/// Default deadline for the client's `connection_init`.
pub const DEFAULT_CONNECTION_INIT_TIMEOUT: Duration = Duration::from_secs(3);

/// Handshake rejection returned by [`ServerHooks::on_connect`].
///
/// Closes the connection with `4403 Forbidden`.
#[derive(Debug, Clone, Default)]
pub struct ConnectDenied {
    /// Reason placed on the close frame, when given.
    pub reason: Option<String>,
}

impl ConnectDenied {
    /// Deny with a reason.
    #[must_use]
    pub fn with_reason(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
        }
    }
}

/// Engine bypass returned by [`ServerHooks::on_subscribe`].
#[derive(Debug)]
pub enum SubscribeAction {
    /// Emit these results and complete without consulting the engine.
    Respond(Vec<ExecutionResult>),
    /// End the operation with an `error` message.
    Reject(Vec<GraphqlError>),
}

/// Per-connection lifecycle hooks.
///
/// Every method has a no-op default; implement only what the deployment
/// needs.
#[async_trait]
pub trait ServerHooks: Send + Sync + 'static {
    /// Inspect the `connection_init` payload.
    ///
    /// Accept by returning an optional payload to echo on `connection_ack`;
    /// reject to close with `4403 Forbidden`.
    ///
    /// # Errors
    /// A [`ConnectDenied`] rejection closes the handshake.
    async fn on_connect(&self, payload: Option<&Value>) -> Result<Option<Value>, ConnectDenied> {
        let _ = payload;
        Ok(None)
    }

    /// Intercept a `subscribe` before the engine sees it.
    ///
    /// Returning an action short-circuits planning and execution.
    async fn on_subscribe(&self, ctx: &OperationContext) -> Option<SubscribeAction> {
        let _ = ctx;
        None
    }

    /// An operation was classified and is about to run.
    fn on_operation(&self, ctx: &OperationContext, kind: OperationKind) {
        let _ = (ctx, kind);
    }

    /// A `next` message is about to be sent.
    fn on_next(&self, id: &str, result: &ExecutionResult) {
        let _ = (id, result);
    }

    /// An `error` message is about to be sent.
    fn on_error(&self, id: &str, errors: &[GraphqlError]) {
        let _ = (id, errors);
    }

    /// A `complete` message is about to be sent.
    fn on_complete(&self, id: &str) {
        let _ = id;
    }
}

/// No-op hooks.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopServerHooks;

#[async_trait]
impl ServerHooks for NoopServerHooks {}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// How long the server waits for `connection_init` before closing with
    /// `4408`.
    pub connection_init_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            connection_init_timeout: DEFAULT_CONNECTION_INIT_TIMEOUT,
        }
    }
}

/// Server builder.
pub struct ServerBuilder<E> {
    engine: E,
    hooks: Arc<dyn ServerHooks>,
    config: ServerConfig,
}

impl<E: GraphqlEngine> ServerBuilder<E> {
    /// Install lifecycle hooks.
    #[must_use]
    pub fn with_hooks(mut self, hooks: impl ServerHooks) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    /// Override the `connection_init` deadline.
    #[must_use]
    pub fn with_connection_init_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_init_timeout = timeout;
        self
    }

    /// Build the server.
    #[must_use]
    pub fn build(self) -> Server<E> {
        Server {
            engine: Arc::new(self.engine),
            hooks: self.hooks,
            config: self.config,
        }
    }
}

/// GraphQL-over-WebSocket server endpoint.
pub struct Server<E> {
    engine: Arc<E>,
    hooks: Arc<dyn ServerHooks>,
    config: ServerConfig,
}

impl<E> Clone for Server<E> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            hooks: Arc::clone(&self.hooks),
            config: self.config.clone(),
        }
    }
}

impl<E: GraphqlEngine> Server<E> {
    /// Create a server with default configuration.
    #[must_use]
    pub fn new(engine: E) -> Self {
        Self::builder(engine).build()
    }

    /// Start building a server around an engine.
    #[must_use]
    pub fn builder(engine: E) -> ServerBuilder<E> {
        ServerBuilder {
            engine,
            hooks: Arc::new(NoopServerHooks),
            config: ServerConfig::default(),
        }
    }

    /// Accept connections from a listener until it fails.
    pub async fn listen(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            debug!(%peer, "inbound connection");
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.accept(stream).await {
                    debug!(%peer, error = %e, "connection ended with transport error");
                }
            });
        }
    }

    /// Upgrade one TCP stream and run it to completion.
    pub async fn accept(&self, stream: TcpStream) -> TransportResult<()> {
        let conn = accept(stream, GRAPHQL_TRANSPORT_WS_PROTOCOL).await?;
        self.handle(conn).await;
        Ok(())
    }

    /// Run an already-upgraded WebSocket connection to completion.
    ///
    /// Exposed for callers that perform their own HTTP integration.
    pub async fn handle<S>(&self, conn: WsConnection<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        connection::run(
            Arc::clone(&self.engine),
            Arc::clone(&self.hooks),
            self.config.clone(),
            conn,
        )
        .await;
    }
}
