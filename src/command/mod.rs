//! Command pipeline
//!
//! Routes command envelopes to their handlers through a middleware chain,
//! either in-process or across the NATS request/reply transport. Both buses
//! share one registration API so handler code never branches on deployment.

mod credentials;
mod local;
pub mod middleware;
mod nats;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::domain::{CommandEnvelope, OperationContext};
use crate::error::{AppResult, Response};

pub use credentials::NatsCredentials;
pub use local::LocalCommandBus;
pub use middleware::{AuthorizationMiddleware, Middleware, RecoveryMiddleware, TelemetryMiddleware};
pub use nats::{NatsCommandBus, ServerHandle};

/// Handler for one command type.
///
/// Business failures are returned as `Err(AppError)`; the bus folds them
/// into the wire [`Response`] envelope.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: &OperationContext,
        envelope: &CommandEnvelope,
    ) -> AppResult<Response>;
}

/// Identical dispatch API for the local and distributed buses.
#[async_trait]
pub trait CommandBus: Send + Sync {
    /// Register the handler for a fully qualified command type.
    fn register(&self, command_type: &str, handler: Arc<dyn CommandHandler>);

    /// Add a middleware. Middlewares wrap handlers outside-in, in the order
    /// they were added; the first added sees every command first.
    fn use_middleware(&self, middleware: Arc<dyn Middleware>);

    /// Dispatch an envelope to its handler.
    async fn send(
        &self,
        ctx: &OperationContext,
        envelope: &CommandEnvelope,
    ) -> AppResult<Response>;
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F> CommandHandler for FnHandler<F>
where
    F: Fn(OperationContext, CommandEnvelope) -> BoxFuture<'static, AppResult<Response>>
        + Send
        + Sync,
{
    async fn handle(
        &self,
        ctx: &OperationContext,
        envelope: &CommandEnvelope,
    ) -> AppResult<Response> {
        (self.f)(ctx.clone(), envelope.clone()).await
    }
}

/// Adapt a closure into a [`CommandHandler`].
pub fn handler_fn<F>(f: F) -> Arc<dyn CommandHandler>
where
    F: Fn(OperationContext, CommandEnvelope) -> BoxFuture<'static, AppResult<Response>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnHandler { f })
}
