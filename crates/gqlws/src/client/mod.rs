//! Client: initiates connections and exposes the operation subscription API.
//!
//! A [`Client`] is a cheap handle onto a background connection actor. The
//! actor dials lazily by default, multiplexes every subscription over one
//! socket, and reconnects with backoff when a retryable close interrupts
//! live operations.

mod connection;
mod retry;
mod subscription;

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

pub use retry::{RetryPolicy, RetryPredicate, is_fatal_close_code};
pub use subscription::{EventSink, SubscribeOptions, SubscriptionHandle, SubscriptionStream};

use crate::client::connection::{Command, ConnectionActor, PendingOperation};
use crate::client::subscription::ChannelSink;
use crate::error::{CloseEvent, SubscriptionError};
use crate::protocol::{Message, SubscribeRequest};

/// Default deadline for the server's `connection_ack`.
pub const DEFAULT_CONNECTION_ACK_TIMEOUT: Duration = Duration::from_secs(3);

/// Operation id generator; the default draws a v4 UUID per operation.
pub type IdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

/// Payload sent with `connection_init`.
pub enum ConnectionParams {
    /// No payload.
    None,
    /// The same value on every connect.
    Static(Value),
    /// Produced at connect time, once per attempt.
    Provider(Arc<dyn Fn() -> BoxFuture<'static, Option<Value>> + Send + Sync>),
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self::None
    }
}

impl ConnectionParams {
    pub(crate) async fn resolve(&self) -> Option<Value> {
        match self {
            Self::None => None,
            Self::Static(value) => Some(value.clone()),
            Self::Provider(provider) => provider().await,
        }
    }
}

/// Connection lifecycle notifications.
pub trait ClientHooks: Send + Sync + 'static {
    /// A connection attempt is starting.
    fn on_connecting(&self) {}

    /// The handshake completed.
    fn on_connected(&self) {}

    /// The connection ended; `None` for socket-level failures without a
    /// close event.
    fn on_closed(&self, event: Option<&CloseEvent>) {
        let _ = event;
    }

    /// A protocol message arrived.
    fn on_message(&self, message: &Message) {
        let _ = message;
    }
}

/// No-op hooks.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopClientHooks;

impl ClientHooks for NoopClientHooks {}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server URL (`ws://` or `wss://`).
    pub url: String,
    /// Connect on first subscribe instead of eagerly.
    pub lazy: bool,
    /// How long to wait for `connection_ack`.
    pub connection_ack_timeout: Duration,
    /// Emit `ping` on this interval once ready.
    pub keep_alive: Option<Duration>,
    /// Reconnect policy.
    pub retry: RetryPolicy,
    /// Default resubscription opt-in for operations that do not set one.
    pub resubscribe: bool,
}

impl ClientConfig {
    /// Defaults for a URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            lazy: true,
            connection_ack_timeout: DEFAULT_CONNECTION_ACK_TIMEOUT,
            keep_alive: None,
            retry: RetryPolicy::default(),
            resubscribe: true,
        }
    }
}

/// Client builder.
pub struct ClientBuilder {
    config: ClientConfig,
    params: ConnectionParams,
    should_retry: Option<RetryPredicate>,
    hooks: Arc<dyn ClientHooks>,
    generate_id: IdGenerator,
}

impl ClientBuilder {
    fn new(url: impl Into<String>) -> Self {
        Self {
            config: ClientConfig::new(url),
            params: ConnectionParams::default(),
            should_retry: None,
            hooks: Arc::new(NoopClientHooks),
            generate_id: Arc::new(|| uuid::Uuid::new_v4().to_string()),
        }
    }

    /// Send this payload with every `connection_init`.
    #[must_use]
    pub fn with_connection_params(mut self, params: Value) -> Self {
        self.params = ConnectionParams::Static(params);
        self
    }

    /// Produce the `connection_init` payload at connect time.
    #[must_use]
    pub fn with_connection_params_provider<F, Fut>(mut self, provider: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<Value>> + Send + 'static,
    {
        self.params = ConnectionParams::Provider(Arc::new(move || {
            Box::pin(provider()) as BoxFuture<'static, Option<Value>>
        }));
        self
    }

    /// Connect eagerly instead of on first subscribe.
    #[must_use]
    pub const fn with_lazy(mut self, lazy: bool) -> Self {
        self.config.lazy = lazy;
        self
    }

    /// Override the acknowledgement deadline.
    #[must_use]
    pub const fn with_connection_ack_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_ack_timeout = timeout;
        self
    }

    /// Emit `ping` on this interval once ready.
    #[must_use]
    pub const fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.config.keep_alive = Some(interval);
        self
    }

    /// Override the reconnect policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    /// Override which close events are retried.
    #[must_use]
    pub fn with_should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CloseEvent) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Some(Arc::new(predicate));
        self
    }

    /// Default resubscription opt-in for operations that do not set one.
    #[must_use]
    pub const fn with_resubscribe(mut self, resubscribe: bool) -> Self {
        self.config.resubscribe = resubscribe;
        self
    }

    /// Install lifecycle hooks.
    #[must_use]
    pub fn with_hooks(mut self, hooks: impl ClientHooks) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    /// Override operation id generation. Collisions against active ids are
    /// still detected and regenerated.
    #[must_use]
    pub fn with_id_generator<F>(mut self, generate: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.generate_id = Arc::new(generate);
        self
    }

    /// Build the client and spawn its connection actor.
    ///
    /// Must be called within a tokio runtime.
    #[must_use]
    pub fn build(self) -> Client {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let actor = ConnectionActor::new(
            self.config,
            self.params,
            self.should_retry,
            self.hooks,
            self.generate_id,
            command_rx,
        );
        tokio::spawn(actor.run());
        Client {
            commands,
            next_key: Arc::new(AtomicU64::new(1)),
        }
    }
}

/// GraphQL-over-WebSocket client handle.
///
/// Cloning shares the underlying connection.
pub struct Client {
    commands: mpsc::UnboundedSender<Command>,
    next_key: Arc<AtomicU64>,
}

impl Clone for Client {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            next_key: Arc::clone(&self.next_key),
        }
    }
}

impl Client {
    /// Start building a client for a URL.
    #[must_use]
    pub fn builder(url: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(url)
    }

    /// Create a client with default configuration.
    ///
    /// Must be called within a tokio runtime.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self::builder(url).build()
    }

    /// Subscribe to an operation, receiving results as a stream.
    ///
    /// This never fails: connection problems surface as an `Err` item on the
    /// stream. The handle cancels the operation.
    #[must_use]
    pub fn subscribe(&self, request: SubscribeRequest) -> (SubscriptionStream, SubscriptionHandle) {
        self.subscribe_with_options(request, SubscribeOptions::default())
    }

    /// Subscribe with per-operation options.
    #[must_use]
    pub fn subscribe_with_options(
        &self,
        request: SubscribeRequest,
        options: SubscribeOptions,
    ) -> (SubscriptionStream, SubscriptionHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.subscribe_with_sink(request, Box::new(ChannelSink::new(tx)), options);
        (UnboundedReceiverStream::new(rx), handle)
    }

    /// Subscribe with a caller-supplied sink.
    pub fn subscribe_with_sink(
        &self,
        request: SubscribeRequest,
        sink: Box<dyn EventSink>,
        options: SubscribeOptions,
    ) -> SubscriptionHandle {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let op = PendingOperation {
            key,
            request,
            sink,
            retry: options.retry,
        };
        if let Err(mpsc::error::SendError(command)) = self.commands.send(Command::Subscribe(op)) {
            if let Command::Subscribe(mut op) = command {
                op.sink
                    .error(SubscriptionError::Transport("client closed".to_string()));
            }
        }
        SubscriptionHandle::new(key, self.commands.clone())
    }

    /// Close the connection; remaining subscriptions complete.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }
}
