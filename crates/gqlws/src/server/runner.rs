//! Drives one operation from `subscribe` to its terminal message.
//!
//! A runner owns the engine call for its id and nothing else. It frees its
//! registry entry before emitting the terminal, so the id is reusable the
//! moment the terminal is on the writer queue, and a concurrent cancel
//! (peer `complete` or connection close) simply drops the result stream.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::engine::{GraphqlEngine, OperationContext, OperationKind};
use crate::protocol::{ExecutionResult, GraphqlError, Message};
use crate::server::connection::{Outbound, Registry};
use crate::server::{ServerHooks, SubscribeAction};

pub(crate) async fn run<E: GraphqlEngine>(
    engine: Arc<E>,
    hooks: Arc<dyn ServerHooks>,
    ctx: OperationContext,
    out: mpsc::Sender<Outbound>,
    registry: Registry,
    cancel: oneshot::Receiver<()>,
) {
    let id = ctx.id.clone();
    tokio::select! {
        _ = cancel => {
            debug!(%id, "operation cancelled");
        }
        () = drive(engine, hooks, ctx, out, registry) => {}
    }
}

async fn drive<E: GraphqlEngine>(
    engine: Arc<E>,
    hooks: Arc<dyn ServerHooks>,
    ctx: OperationContext,
    out: mpsc::Sender<Outbound>,
    registry: Registry,
) {
    let id = ctx.id.clone();

    if let Some(action) = hooks.on_subscribe(&ctx).await {
        match action {
            SubscribeAction::Respond(results) => {
                for result in results {
                    if !send_next(&hooks, &out, &id, result).await {
                        return;
                    }
                }
                finish_complete(&hooks, &out, &registry, &id).await;
            }
            SubscribeAction::Reject(errors) => {
                finish_error(&hooks, &out, &registry, &id, errors).await;
            }
        }
        return;
    }

    let kind = match engine.plan(&ctx.request) {
        Ok(kind) => kind,
        Err(errors) => {
            finish_error(&hooks, &out, &registry, &id, errors).await;
            return;
        }
    };
    hooks.on_operation(&ctx, kind);

    match kind {
        OperationKind::Query | OperationKind::Mutation => {
            let result = engine.execute(ctx).await;
            if !send_next(&hooks, &out, &id, result).await {
                return;
            }
            finish_complete(&hooks, &out, &registry, &id).await;
        }
        OperationKind::Subscription => {
            let mut stream = match engine.subscribe(ctx).await {
                Ok(stream) => stream,
                Err(errors) => {
                    finish_error(&hooks, &out, &registry, &id, errors).await;
                    return;
                }
            };
            while let Some(item) = stream.next().await {
                match item {
                    Ok(result) => {
                        if !send_next(&hooks, &out, &id, result).await {
                            return;
                        }
                    }
                    Err(errors) => {
                        drop(stream);
                        finish_error(&hooks, &out, &registry, &id, errors).await;
                        return;
                    }
                }
            }
            finish_complete(&hooks, &out, &registry, &id).await;
        }
    }
}

async fn send_next(
    hooks: &Arc<dyn ServerHooks>,
    out: &mpsc::Sender<Outbound>,
    id: &str,
    result: ExecutionResult,
) -> bool {
    hooks.on_next(id, &result);
    out.send(Outbound::Message(Message::Next {
        id: id.to_string(),
        payload: result,
    }))
    .await
    .is_ok()
}

async fn finish_complete(
    hooks: &Arc<dyn ServerHooks>,
    out: &mpsc::Sender<Outbound>,
    registry: &Registry,
    id: &str,
) {
    if registry.lock().remove(id).is_none() {
        // Cancelled concurrently; the peer asked for the stop and gets no
        // terminal echo.
        return;
    }
    hooks.on_complete(id);
    let _ = out
        .send(Outbound::Message(Message::Complete { id: id.to_string() }))
        .await;
}

async fn finish_error(
    hooks: &Arc<dyn ServerHooks>,
    out: &mpsc::Sender<Outbound>,
    registry: &Registry,
    id: &str,
    errors: Vec<GraphqlError>,
) {
    if registry.lock().remove(id).is_none() {
        return;
    }
    hooks.on_error(id, &errors);
    let _ = out
        .send(Outbound::Message(Message::Error {
            id: id.to_string(),
            payload: errors,
        }))
        .await;
}
