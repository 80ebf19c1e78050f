//! Event Bus
//!
//! Durable fan-out of persisted events to subscribers. Two implementations
//! share one contract: an in-process bus for development and tests, and a
//! JetStream-backed bus for production. Per-aggregate ordering is preserved
//! on both; cross-aggregate ordering is not guaranteed.

mod memory;
mod nats;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::domain::Event;
use crate::error::AppResult;

pub use memory::InMemoryEventBus;
pub use nats::NatsEventBus;

/// Which events a subscription wants.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Restrict to these aggregate types; `None` accepts all.
    pub aggregate_types: Option<Vec<String>>,

    /// Restrict to these fully qualified event types; `None` accepts all.
    pub event_types: Option<Vec<String>>,

    /// Resume strictly after this stream position.
    pub from_position: Option<i64>,
}

impl EventFilter {
    /// Accept every event from the start of the stream.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_aggregate_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aggregate_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_event_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    pub fn from_position(mut self, position: i64) -> Self {
        self.from_position = Some(position);
        self
    }

    /// Type-level match; position is enforced by the bus, not here.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(aggregate_types) = &self.aggregate_types {
            if !aggregate_types.iter().any(|t| t == &event.aggregate_type) {
                return false;
            }
        }
        if let Some(event_types) = &self.event_types {
            if !event_types.iter().any(|t| t == &event.event_type) {
                return false;
            }
        }
        true
    }
}

/// Consumer callback for subscribed events.
///
/// Returning an error triggers redelivery per the bus policy; the handler
/// must therefore tolerate seeing the same event again.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> AppResult<()>;
}

/// Handle to an active subscription. Dropping it cancels delivery;
/// [`Subscription::unsubscribe`] additionally awaits worker shutdown and is
/// idempotent.
#[derive(Debug)]
pub struct Subscription {
    cancel: watch::Sender<bool>,
    worker: Option<JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn new(cancel: watch::Sender<bool>, worker: JoinHandle<()>) -> Self {
        Self {
            cancel,
            worker: Some(worker),
        }
    }

    pub async fn unsubscribe(&mut self) {
        let _ = self.cancel.send(true);
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.cancel.send(true);
    }
}

/// Durable pub/sub of persisted events.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish a batch; atomic from the publisher's perspective. Buses may
    /// deduplicate on event id.
    async fn publish(&self, events: &[Event]) -> AppResult<()>;

    /// Subscribe `handler` under a durable consumer name. On reconnect a
    /// consumer with the same name resumes from its last acknowledged
    /// position.
    async fn subscribe(
        &self,
        name: &str,
        filter: EventFilter,
        handler: Arc<dyn EventHandler>,
    ) -> AppResult<Subscription>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EventMetadata;
    use chrono::Utc;

    fn event(aggregate_type: &str, event_type: &str) -> Event {
        Event {
            id: crate::domain::random_event_id(),
            aggregate_id: "a-1".to_string(),
            aggregate_type: aggregate_type.to_string(),
            event_type: event_type.to_string(),
            version: 1,
            timestamp: Utc::now(),
            data: b"{}".to_vec(),
            metadata: EventMetadata::default(),
            unique_constraints: vec![],
            position: 0,
        }
    }

    #[test]
    fn test_filter_all_matches_everything() {
        let filter = EventFilter::all();
        assert!(filter.matches(&event("Account", "accounts.v1.AccountOpened")));
    }

    #[test]
    fn test_filter_by_aggregate_type() {
        let filter = EventFilter::all().with_aggregate_types(["Account"]);
        assert!(filter.matches(&event("Account", "accounts.v1.AccountOpened")));
        assert!(!filter.matches(&event("User", "users.v1.UserRegistered")));
    }

    #[test]
    fn test_filter_by_event_type() {
        let filter = EventFilter::all().with_event_types(["accounts.v1.MoneyDeposited"]);
        assert!(filter.matches(&event("Account", "accounts.v1.MoneyDeposited")));
        assert!(!filter.matches(&event("Account", "accounts.v1.AccountOpened")));
    }
}
