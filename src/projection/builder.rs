//! Generic projection builder
//!
//! Fluent construction of a projection from per-event-type typed handlers.
//! The built projection dispatches on `event_type`, silently skipping types
//! it was not given a handler for, and derives its bus filter from the
//! registered types.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;

use crate::domain::{Event, OperationContext};
use crate::error::{AppError, AppResult};
use crate::event_bus::EventFilter;

use super::Projection;

type EventFn =
    Arc<dyn Fn(OperationContext, Event) -> BoxFuture<'static, AppResult<()>> + Send + Sync>;
type ResetFn = Arc<dyn Fn(OperationContext) -> BoxFuture<'static, AppResult<()>> + Send + Sync>;

/// Builder for in-memory / externally-stored projections.
pub struct ProjectionBuilder {
    name: String,
    handlers: HashMap<String, EventFn>,
    on_reset: Option<ResetFn>,
    filter: Option<EventFilter>,
}

impl ProjectionBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handlers: HashMap::new(),
            on_reset: None,
            filter: None,
        }
    }

    /// Register a typed handler for one event type. The payload is decoded
    /// into `T` before the handler runs.
    pub fn on<T, F, Fut>(mut self, event_type: impl Into<String>, handler: F) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(OperationContext, Event, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AppResult<()>> + Send + 'static,
    {
        let event_type = event_type.into();
        let handler = Arc::new(handler);
        self.handlers.insert(
            event_type.clone(),
            Arc::new(move |ctx, event| {
                let handler = handler.clone();
                let event_type = event_type.clone();
                Box::pin(async move {
                    let payload: T = serde_json::from_slice(&event.data).map_err(|e| {
                        AppError::internal(format!("cannot decode {event_type} payload: {e}"))
                    })?;
                    handler(ctx, event, payload).await
                })
            }),
        );
        self
    }

    /// Callback invoked by [`Projection::reset`] before a rebuild.
    pub fn on_reset<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(OperationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AppResult<()>> + Send + 'static,
    {
        let callback = Arc::new(callback);
        self.on_reset = Some(Arc::new(move |ctx| {
            let callback = callback.clone();
            Box::pin(async move { callback(ctx).await })
        }));
        self
    }

    /// Override the subscription filter; defaults to the registered event
    /// types.
    pub fn with_filter(mut self, filter: EventFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn build(self) -> Arc<dyn Projection> {
        let filter = self.filter.unwrap_or_else(|| {
            EventFilter::all().with_event_types(self.handlers.keys().cloned())
        });
        Arc::new(GenericProjection {
            name: self.name,
            handlers: self.handlers,
            on_reset: self.on_reset,
            filter,
        })
    }
}

struct GenericProjection {
    name: String,
    handlers: HashMap<String, EventFn>,
    on_reset: Option<ResetFn>,
    filter: EventFilter,
}

#[async_trait]
impl Projection for GenericProjection {
    fn name(&self) -> &str {
        &self.name
    }

    fn filter(&self) -> EventFilter {
        self.filter.clone()
    }

    async fn handle(&self, ctx: &OperationContext, event: &Event) -> AppResult<()> {
        match self.handlers.get(&event.event_type) {
            Some(handler) => handler(ctx.clone(), event.clone()).await,
            // Unknown types are skipped, not failed
            None => Ok(()),
        }
    }

    async fn reset(&self, ctx: &OperationContext) -> AppResult<()> {
        match &self.on_reset {
            Some(callback) => callback(ctx.clone()).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EventMetadata;
    use chrono::Utc;
    use serde::Deserialize;
    use std::sync::Mutex;

    #[derive(Debug, Deserialize)]
    struct Deposited {
        amount: String,
    }

    fn event(event_type: &str, data: serde_json::Value) -> Event {
        Event {
            id: crate::domain::random_event_id(),
            aggregate_id: "acc-1".to_string(),
            aggregate_type: "Account".to_string(),
            event_type: event_type.to_string(),
            version: 1,
            timestamp: Utc::now(),
            data: serde_json::to_vec(&data).unwrap(),
            metadata: EventMetadata::default(),
            unique_constraints: vec![],
            position: 1,
        }
    }

    #[tokio::test]
    async fn test_typed_dispatch() {
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        let projection = ProjectionBuilder::new("deposits")
            .on::<Deposited, _, _>("accounts.v1.MoneyDeposited", move |_ctx, _event, payload| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(payload.amount);
                    Ok(())
                }
            })
            .build();

        let ctx = OperationContext::new();
        projection
            .handle(&ctx, &event("accounts.v1.MoneyDeposited", serde_json::json!({"amount": "500.00"})))
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["500.00".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_event_type_is_skipped() {
        let projection = ProjectionBuilder::new("deposits")
            .on::<Deposited, _, _>("accounts.v1.MoneyDeposited", |_ctx, _event, _payload| async {
                Ok(())
            })
            .build();

        let result = projection
            .handle(
                &OperationContext::new(),
                &event("accounts.v1.AccountClosed", serde_json::json!({})),
            )
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_filter_derived_from_handlers() {
        let projection = ProjectionBuilder::new("deposits")
            .on::<Deposited, _, _>("accounts.v1.MoneyDeposited", |_ctx, _event, _payload| async {
                Ok(())
            })
            .build();

        let filter = projection.filter();
        assert!(filter.matches(&event("accounts.v1.MoneyDeposited", serde_json::json!({}))));
        assert!(!filter.matches(&event("accounts.v1.AccountClosed", serde_json::json!({}))));
    }

    #[tokio::test]
    async fn test_malformed_payload_fails_handler() {
        let projection = ProjectionBuilder::new("deposits")
            .on::<Deposited, _, _>("accounts.v1.MoneyDeposited", |_ctx, _event, _payload| async {
                Ok(())
            })
            .build();

        let mut bad = event("accounts.v1.MoneyDeposited", serde_json::json!({}));
        bad.data = b"not json".to_vec();
        assert!(projection.handle(&OperationContext::new(), &bad).await.is_err());
    }

    #[tokio::test]
    async fn test_reset_callback() {
        let reset_count = Arc::new(Mutex::new(0));
        let counter = reset_count.clone();

        let projection = ProjectionBuilder::new("deposits")
            .on_reset(move |_ctx| {
                let counter = counter.clone();
                async move {
                    *counter.lock().unwrap() += 1;
                    Ok(())
                }
            })
            .build();

        projection.reset(&OperationContext::new()).await.unwrap();
        assert_eq!(*reset_count.lock().unwrap(), 1);
    }
}
