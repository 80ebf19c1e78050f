//! Command middleware
//!
//! Middlewares wrap handlers outside-in. The runtime ships three: panic
//! recovery, telemetry (span + counters per command) and an authorization
//! hook; applications add their own by implementing [`Middleware`].

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::Instrument;

use crate::domain::{CommandEnvelope, OperationContext};
use crate::error::{code, AppError, AppResult, Response};
use crate::observability::{metric, Metrics};

use super::CommandHandler;

/// A handler decorator: receives the next handler, returns the wrapped one.
pub trait Middleware: Send + Sync {
    fn wrap(&self, next: Arc<dyn CommandHandler>) -> Arc<dyn CommandHandler>;
}

// =========================================================================
// Recovery
// =========================================================================

/// Catches handler panics, logs them and converts them into an internal
/// error response so one bad command cannot take down a worker.
pub struct RecoveryMiddleware;

impl Middleware for RecoveryMiddleware {
    fn wrap(&self, next: Arc<dyn CommandHandler>) -> Arc<dyn CommandHandler> {
        Arc::new(Recovered { next })
    }
}

struct Recovered {
    next: Arc<dyn CommandHandler>,
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[async_trait]
impl CommandHandler for Recovered {
    async fn handle(
        &self,
        ctx: &OperationContext,
        envelope: &CommandEnvelope,
    ) -> AppResult<Response> {
        match std::panic::AssertUnwindSafe(self.next.handle(ctx, envelope))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic);
                tracing::error!(
                    command_type = %envelope.command_type,
                    command_id = %envelope.metadata.command_id,
                    panic = %message,
                    "handler panicked"
                );
                Ok(Response::err(
                    AppError::new(code::INTERNAL, "command handler panicked")
                        .with_detail("command_type", &envelope.command_type),
                ))
            }
        }
    }
}

// =========================================================================
// Telemetry
// =========================================================================

/// Span per command plus the `command.total` / `command.errors` counters and
/// the `command.duration` histogram.
pub struct TelemetryMiddleware {
    metrics: Metrics,
}

impl TelemetryMiddleware {
    pub fn new(metrics: Metrics) -> Self {
        Self { metrics }
    }
}

impl Middleware for TelemetryMiddleware {
    fn wrap(&self, next: Arc<dyn CommandHandler>) -> Arc<dyn CommandHandler> {
        Arc::new(Measured {
            next,
            metrics: self.metrics.clone(),
        })
    }
}

struct Measured {
    next: Arc<dyn CommandHandler>,
    metrics: Metrics,
}

#[async_trait]
impl CommandHandler for Measured {
    async fn handle(
        &self,
        ctx: &OperationContext,
        envelope: &CommandEnvelope,
    ) -> AppResult<Response> {
        let span = tracing::info_span!(
            "command",
            "command.id" = %envelope.metadata.command_id,
            "command.type" = %envelope.command_type,
            "command.principal_id" = envelope.metadata.principal_id.as_deref().unwrap_or(""),
            "command.correlation_id" = envelope.metadata.correlation_id.as_deref().unwrap_or(""),
        );

        let labels = [("command_type", envelope.command_type.as_str())];
        self.metrics.incr(metric::COMMAND_TOTAL, &labels, 1);

        let started = Instant::now();
        let result = self.next.handle(ctx, envelope).instrument(span).await;
        self.metrics
            .observe(metric::COMMAND_DURATION, &labels, started.elapsed().as_secs_f64());

        let failed = match &result {
            Ok(response) => !response.success,
            Err(_) => true,
        };
        if failed {
            self.metrics.incr(metric::COMMAND_ERRORS, &labels, 1);
        }

        result
    }
}

// =========================================================================
// Authorization
// =========================================================================

type AuthCheck = dyn Fn(&OperationContext, &CommandEnvelope) -> AppResult<()> + Send + Sync;

/// Rejects commands before they reach the handler.
pub struct AuthorizationMiddleware {
    check: Arc<AuthCheck>,
}

impl AuthorizationMiddleware {
    pub fn new<F>(check: F) -> Self
    where
        F: Fn(&OperationContext, &CommandEnvelope) -> AppResult<()> + Send + Sync + 'static,
    {
        Self {
            check: Arc::new(check),
        }
    }

    /// Require an authenticated principal on every command.
    pub fn require_principal() -> Self {
        Self::new(|ctx, envelope| {
            let principal = ctx
                .principal_id
                .as_deref()
                .or(envelope.metadata.principal_id.as_deref());
            if principal.map_or(true, str::is_empty) {
                return Err(AppError::new(
                    code::AUTHORIZATION_DENIED,
                    "command requires an authenticated principal",
                ));
            }
            Ok(())
        })
    }
}

impl Middleware for AuthorizationMiddleware {
    fn wrap(&self, next: Arc<dyn CommandHandler>) -> Arc<dyn CommandHandler> {
        Arc::new(Authorized {
            next,
            check: self.check.clone(),
        })
    }
}

struct Authorized {
    next: Arc<dyn CommandHandler>,
    check: Arc<AuthCheck>,
}

#[async_trait]
impl CommandHandler for Authorized {
    async fn handle(
        &self,
        ctx: &OperationContext,
        envelope: &CommandEnvelope,
    ) -> AppResult<Response> {
        if let Err(denied) = (self.check)(ctx, envelope) {
            tracing::warn!(
                command_type = %envelope.command_type,
                command_id = %envelope.metadata.command_id,
                "authorization denied"
            );
            return Ok(Response::err(denied));
        }
        self.next.handle(ctx, envelope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{handler_fn, CommandBus, LocalCommandBus};
    use crate::domain::CommandMetadata;
    use crate::observability::noop_metrics;

    fn envelope() -> CommandEnvelope {
        CommandEnvelope::new("t", &serde_json::json!({}), CommandMetadata::generate()).unwrap()
    }

    #[tokio::test]
    async fn test_recovery_converts_panic_to_internal_error() {
        let bus = LocalCommandBus::new();
        bus.use_middleware(Arc::new(RecoveryMiddleware));
        bus.register(
            "t",
            handler_fn(|_ctx, _env| async { panic!("boom") }.boxed()),
        );

        let response = bus.send(&OperationContext::new(), &envelope()).await.unwrap();
        assert!(!response.success);
        assert_eq!(response.error.unwrap().code, code::INTERNAL);
    }

    #[tokio::test]
    async fn test_authorization_denies_anonymous() {
        let bus = LocalCommandBus::new();
        bus.use_middleware(Arc::new(AuthorizationMiddleware::require_principal()));
        bus.register(
            "t",
            handler_fn(|_ctx, _env| async { Ok(Response::ok_empty()) }.boxed()),
        );

        let anonymous = bus.send(&OperationContext::new(), &envelope()).await.unwrap();
        assert!(!anonymous.success);
        assert_eq!(anonymous.error.unwrap().code, code::AUTHORIZATION_DENIED);

        let authed = bus
            .send(&OperationContext::new().with_principal("alice"), &envelope())
            .await
            .unwrap();
        assert!(authed.success);
    }

    #[tokio::test]
    async fn test_telemetry_passes_through() {
        let bus = LocalCommandBus::new();
        bus.use_middleware(Arc::new(TelemetryMiddleware::new(noop_metrics())));
        bus.register(
            "t",
            handler_fn(|_ctx, _env| async { Ok(Response::ok_empty()) }.boxed()),
        );

        let response = bus.send(&OperationContext::new(), &envelope()).await.unwrap();
        assert!(response.success);
    }
}
