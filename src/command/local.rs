//! Local command bus
//!
//! Synchronous in-process dispatch: the handler runs on the caller's task.
//! Persistence and idempotency are the handler's responsibility, typically
//! via the repository.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::domain::{CommandEnvelope, OperationContext};
use crate::error::{code, AppError, AppResult, Response};

use super::{CommandBus, CommandHandler, Middleware};

/// In-process [`CommandBus`].
#[derive(Default)]
pub struct LocalCommandBus {
    handlers: RwLock<HashMap<String, Arc<dyn CommandHandler>>>,
    middlewares: RwLock<Vec<Arc<dyn Middleware>>>,
}

impl LocalCommandBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Command types with a registered handler.
    pub fn registered_types(&self) -> Vec<String> {
        self.handlers
            .read()
            .expect("handler registry poisoned")
            .keys()
            .cloned()
            .collect()
    }

    fn composed_handler(&self, command_type: &str) -> Option<Arc<dyn CommandHandler>> {
        let handler = self
            .handlers
            .read()
            .expect("handler registry poisoned")
            .get(command_type)
            .cloned()?;

        // First-added middleware is outermost
        let middlewares = self.middlewares.read().expect("middleware list poisoned");
        Some(
            middlewares
                .iter()
                .rev()
                .fold(handler, |next, middleware| middleware.wrap(next)),
        )
    }
}

#[async_trait]
impl CommandBus for LocalCommandBus {
    fn register(&self, command_type: &str, handler: Arc<dyn CommandHandler>) {
        self.handlers
            .write()
            .expect("handler registry poisoned")
            .insert(command_type.to_string(), handler);
    }

    fn use_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.middlewares
            .write()
            .expect("middleware list poisoned")
            .push(middleware);
    }

    async fn send(
        &self,
        ctx: &OperationContext,
        envelope: &CommandEnvelope,
    ) -> AppResult<Response> {
        if ctx.is_expired() {
            return Ok(Response::err(AppError::new(
                code::CANCELLED,
                "deadline expired before dispatch",
            )));
        }

        let handler = self.composed_handler(&envelope.command_type).ok_or_else(|| {
            AppError::new(
                code::UNHANDLED_COMMAND,
                format!("no handler registered for {}", envelope.command_type),
            )
        })?;

        match handler.handle(ctx, envelope).await {
            Ok(response) => Ok(response),
            // Business failures become an error response, not a send error
            Err(error) => Ok(Response::err(error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::handler_fn;
    use crate::domain::CommandMetadata;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn envelope(command_type: &str) -> CommandEnvelope {
        CommandEnvelope::new(command_type, &serde_json::json!({}), CommandMetadata::generate())
            .unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_to_registered_handler() {
        let bus = LocalCommandBus::new();
        bus.register(
            "accounts.v1.OpenAccount",
            handler_fn(|_ctx, _env| async { Ok(Response::ok_empty()) }.boxed()),
        );

        let response = bus
            .send(&OperationContext::new(), &envelope("accounts.v1.OpenAccount"))
            .await
            .unwrap();
        assert!(response.success);
    }

    #[tokio::test]
    async fn test_unregistered_command_type() {
        let bus = LocalCommandBus::new();
        let err = bus
            .send(&OperationContext::new(), &envelope("unknown.v1.Command"))
            .await
            .unwrap_err();
        assert_eq!(err.code, code::UNHANDLED_COMMAND);
    }

    #[tokio::test]
    async fn test_handler_error_becomes_error_response() {
        let bus = LocalCommandBus::new();
        bus.register(
            "accounts.v1.Withdraw",
            handler_fn(|_ctx, _env| {
                async { Err(AppError::new("INSUFFICIENT_FUNDS", "balance too low")) }.boxed()
            }),
        );

        let response = bus
            .send(&OperationContext::new(), &envelope("accounts.v1.Withdraw"))
            .await
            .unwrap();
        assert!(!response.success);
        assert_eq!(response.error.unwrap().code, "INSUFFICIENT_FUNDS");
    }

    struct Tagger {
        tag: &'static str,
        order: Arc<std::sync::Mutex<Vec<&'static str>>>,
    }

    impl Middleware for Tagger {
        fn wrap(&self, next: Arc<dyn CommandHandler>) -> Arc<dyn CommandHandler> {
            struct Tagged {
                tag: &'static str,
                order: Arc<std::sync::Mutex<Vec<&'static str>>>,
                next: Arc<dyn CommandHandler>,
            }

            #[async_trait]
            impl CommandHandler for Tagged {
                async fn handle(
                    &self,
                    ctx: &OperationContext,
                    envelope: &CommandEnvelope,
                ) -> AppResult<Response> {
                    self.order.lock().unwrap().push(self.tag);
                    self.next.handle(ctx, envelope).await
                }
            }

            Arc::new(Tagged {
                tag: self.tag,
                order: self.order.clone(),
                next,
            })
        }
    }

    #[tokio::test]
    async fn test_middleware_wraps_outside_in() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let bus = LocalCommandBus::new();
        bus.use_middleware(Arc::new(Tagger { tag: "first", order: order.clone() }));
        bus.use_middleware(Arc::new(Tagger { tag: "second", order: order.clone() }));
        bus.register(
            "t",
            handler_fn(|_ctx, _env| async { Ok(Response::ok_empty()) }.boxed()),
        );

        bus.send(&OperationContext::new(), &envelope("t")).await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_expired_deadline_short_circuits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let bus = LocalCommandBus::new();
        let counter = calls.clone();
        bus.register(
            "t",
            handler_fn(move |_ctx, _env| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(Response::ok_empty()) }.boxed()
            }),
        );

        let ctx = OperationContext::new().with_timeout(std::time::Duration::ZERO);
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let response = bus.send(&ctx, &envelope("t")).await.unwrap();

        assert!(!response.success);
        assert_eq!(response.error.unwrap().code, code::CANCELLED);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
