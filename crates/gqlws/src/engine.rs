//! The seam between the protocol core and a GraphQL engine.
//!
//! The core never parses GraphQL itself. It hands each `subscribe` payload to
//! a [`GraphqlEngine`], which classifies the operation and either executes it
//! to a single result or opens a lazy result stream.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::Value;

use crate::protocol::{ExecutionResult, GraphqlError, SubscribeRequest};

/// Kind of a classified GraphQL operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// Single-result read.
    Query,
    /// Single-result write.
    Mutation,
    /// Streaming operation.
    Subscription,
}

/// Everything an engine needs to run one operation.
#[derive(Debug, Clone)]
pub struct OperationContext {
    /// Operation id assigned by the client.
    pub id: String,
    /// The subscribe payload as received.
    pub request: SubscribeRequest,
    /// Connection params accepted during the handshake.
    pub connection_params: Option<Value>,
}

/// Lazy sequence of results for a subscription.
///
/// Dropping the stream is the cancellation hook: the engine's cleanup runs
/// and no further items are produced. An `Err` item ends the operation with
/// an `error` message.
pub type ResultStream = BoxStream<'static, Result<ExecutionResult, Vec<GraphqlError>>>;

/// GraphQL engine capability set.
///
/// Schema, root values, and any execution context live inside the
/// implementor; the protocol core only routes payloads and results.
#[async_trait]
pub trait GraphqlEngine: Send + Sync + 'static {
    /// Parse, validate, and classify a document.
    ///
    /// # Errors
    /// Validation errors end the operation with an `error` message; the
    /// connection stays open.
    fn plan(&self, request: &SubscribeRequest) -> Result<OperationKind, Vec<GraphqlError>>;

    /// Execute a query or mutation to a single result.
    ///
    /// Field-level failures belong inside the returned result's `errors`.
    async fn execute(&self, ctx: OperationContext) -> ExecutionResult;

    /// Open the result stream for a subscription.
    ///
    /// # Errors
    /// A setup failure ends the operation with an `error` message.
    async fn subscribe(&self, ctx: OperationContext) -> Result<ResultStream, Vec<GraphqlError>>;
}
