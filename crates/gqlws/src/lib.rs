//! GraphQL over WebSocket: the `graphql-transport-ws` protocol, both sides.
//!
//! This crate multiplexes GraphQL operations over a single WebSocket
//! connection:
//!
//! - **Server**: accepts connections, runs the handshake, dispatches
//!   operations against a [`GraphqlEngine`], and streams results back, each
//!   labeled with its operation id.
//! - **Client**: connects lazily, retries with backoff, and exposes a
//!   subscription API whose failures always flow through the sink.
//!
//! The GraphQL engine itself (parse, validate, execute) is a seam: implement
//! [`GraphqlEngine`] over whatever executor the deployment uses.
//!
//! ```rust,ignore
//! let server = Server::builder(engine).build();
//! tokio::spawn(async move { server.listen(listener).await });
//!
//! let client = Client::builder("ws://127.0.0.1:4000/graphql").build();
//! let (mut stream, handle) = client.subscribe(SubscribeRequest::new("{ hello }"));
//! while let Some(result) = stream.next().await {
//!     println!("{result:?}");
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

mod client;
mod engine;
mod error;
mod frames;
mod protocol;
mod server;

pub use client::{
    Client, ClientBuilder, ClientConfig, ClientHooks, ConnectionParams,
    DEFAULT_CONNECTION_ACK_TIMEOUT, EventSink, IdGenerator, NoopClientHooks, RetryPolicy,
    RetryPredicate, SubscribeOptions, SubscriptionHandle, SubscriptionStream, is_fatal_close_code,
};
pub use engine::{GraphqlEngine, OperationContext, OperationKind, ResultStream};
pub use error::{CloseEvent, ProtocolError, SubscriptionError};
pub use protocol::{
    CloseCode, ErrorLocation, ExecutionResult, GRAPHQL_TRANSPORT_WS_PROTOCOL, GraphqlError,
    Message, PathSegment, SubscribeRequest,
};
pub use server::{
    ConnectDenied, DEFAULT_CONNECTION_INIT_TIMEOUT, NoopServerHooks, Server, ServerBuilder,
    ServerConfig, ServerHooks, SubscribeAction,
};
