//! Caller-facing subscription surface.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::client::connection::Command;
use crate::error::SubscriptionError;
use crate::protocol::ExecutionResult;

/// Caller-supplied capability set receiving one operation's results.
///
/// The client guarantees at most one terminal invocation (`error` or
/// `complete`) and no `next` after it. Cancelling through the handle invokes
/// neither; the caller already knows.
pub trait EventSink: Send + 'static {
    /// One execution result arrived.
    fn next(&mut self, result: ExecutionResult);

    /// The operation ended with a failure.
    fn error(&mut self, error: SubscriptionError);

    /// The operation completed normally.
    fn complete(&mut self);
}

/// Per-subscription options.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubscribeOptions {
    /// Whether to re-send this operation (with a fresh id) after a retried
    /// connection loss. `None` uses the client-level default.
    pub retry: Option<bool>,
}

impl SubscribeOptions {
    /// Opt in or out of resubscription.
    #[must_use]
    pub const fn with_retry(mut self, retry: bool) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// Stream of results for one subscription, ending at its terminal.
pub type SubscriptionStream = UnboundedReceiverStream<Result<ExecutionResult, SubscriptionError>>;

/// Cancellation handle returned by `subscribe`.
///
/// Unsubscribing after a terminal outcome is a no-op, and repeated calls
/// behave like a single one.
pub struct SubscriptionHandle {
    key: u64,
    commands: mpsc::UnboundedSender<Command>,
    used: Arc<AtomicBool>,
}

impl SubscriptionHandle {
    pub(crate) fn new(key: u64, commands: mpsc::UnboundedSender<Command>) -> Self {
        Self {
            key,
            commands,
            used: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Stop the operation: sends `complete` to the server and frees the id.
    pub fn unsubscribe(&self) {
        if !self.used.swap(true, Ordering::SeqCst) {
            let _ = self.commands.send(Command::Unsubscribe { key: self.key });
        }
    }
}

/// Sink feeding the channel behind a [`SubscriptionStream`].
pub(crate) struct ChannelSink {
    tx: mpsc::UnboundedSender<Result<ExecutionResult, SubscriptionError>>,
}

impl ChannelSink {
    pub(crate) const fn new(
        tx: mpsc::UnboundedSender<Result<ExecutionResult, SubscriptionError>>,
    ) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn next(&mut self, result: ExecutionResult) {
        let _ = self.tx.send(Ok(result));
    }

    fn error(&mut self, error: SubscriptionError) {
        let _ = self.tx.send(Err(error));
    }

    fn complete(&mut self) {
        // Dropping the sender ends the stream.
    }
}
