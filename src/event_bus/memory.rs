//! In-process event bus
//!
//! Same contract as the NATS bus, no external server: events are kept in a
//! replay buffer so late subscribers can resume from a position, and each
//! subscription gets its own ordered delivery task. Used in development and
//! hermetic tests.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::domain::Event;
use crate::error::AppResult;

use super::{EventBus, EventFilter, EventHandler, Subscription};

/// Redeliveries attempted before a subscription is parked.
const MAX_REDELIVERIES: u32 = 3;

struct Subscriber {
    filter: EventFilter,
    sender: mpsc::UnboundedSender<Event>,
}

#[derive(Default)]
struct Inner {
    /// Replay buffer in publish order, positions assigned by the bus when
    /// the event does not already carry one.
    buffer: Vec<Event>,
    seen_ids: HashSet<String>,
    next_position: i64,
    subscribers: Vec<Subscriber>,
}

/// In-memory [`EventBus`] implementation.
#[derive(Clone, Default)]
pub struct InMemoryEventBus {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct events retained in the replay buffer.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("bus lock poisoned").buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, events: &[Event]) -> AppResult<()> {
        let mut inner = self.inner.lock().expect("bus lock poisoned");
        for event in events {
            // Dedup on event id
            if !inner.seen_ids.insert(event.id.clone()) {
                continue;
            }

            let mut event = event.clone();
            if event.position <= 0 {
                event.position = inner.next_position + 1;
            }
            inner.next_position = inner.next_position.max(event.position);
            inner.buffer.push(event.clone());

            inner.subscribers.retain(|subscriber| {
                if !subscriber.filter.matches(&event) {
                    return true;
                }
                subscriber.sender.send(event.clone()).is_ok()
            });
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        name: &str,
        filter: EventFilter,
        handler: Arc<dyn EventHandler>,
    ) -> AppResult<Subscription> {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let (cancel_tx, mut cancel_rx) = watch::channel(false);

        {
            let mut inner = self.inner.lock().expect("bus lock poisoned");

            // Replay history after the requested position, then register for
            // live delivery under the same lock so ordering stays intact.
            let from_position = filter.from_position.unwrap_or(0);
            for event in &inner.buffer {
                if event.position > from_position && filter.matches(event) {
                    let _ = sender.send(event.clone());
                }
            }

            inner.subscribers.push(Subscriber {
                filter: filter.clone(),
                sender,
            });
        }

        let consumer = name.to_string();
        let worker = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel_rx.changed() => break,
                    event = receiver.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };

                let mut delivered = false;
                for attempt in 0..=MAX_REDELIVERIES {
                    match handler.handle(&event).await {
                        Ok(()) => {
                            delivered = true;
                            break;
                        }
                        Err(error) => {
                            tracing::warn!(
                                consumer = %consumer,
                                event_id = %event.id,
                                attempt,
                                %error,
                                "event handler failed"
                            );
                            tokio::time::sleep(Duration::from_millis(10 << attempt)).await;
                        }
                    }
                }

                if !delivered {
                    tracing::error!(
                        consumer = %consumer,
                        event_id = %event.id,
                        "redeliveries exhausted; parking subscription"
                    );
                    break;
                }
            }
        });

        Ok(Subscription::new(cancel_tx, worker))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EventMetadata;
    use crate::error::AppError;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event(aggregate_id: &str, version: i64) -> Event {
        Event {
            id: crate::domain::random_event_id(),
            aggregate_id: aggregate_id.to_string(),
            aggregate_type: "Account".to_string(),
            event_type: "accounts.v1.MoneyDeposited".to_string(),
            version,
            timestamp: Utc::now(),
            data: b"{}".to_vec(),
            metadata: EventMetadata::default(),
            unique_constraints: vec![],
            position: 0,
        }
    }

    struct Collector {
        versions: Mutex<Vec<i64>>,
        count: AtomicUsize,
    }

    impl Collector {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                versions: Mutex::new(Vec::new()),
                count: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl EventHandler for Collector {
        async fn handle(&self, event: &Event) -> AppResult<()> {
            self.versions.lock().unwrap().push(event.version);
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn wait_for(collector: &Collector, count: usize) {
        for _ in 0..200 {
            if collector.count.load(Ordering::SeqCst) >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {count} deliveries, got {}", collector.count.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_delivery_preserves_aggregate_order() {
        let bus = InMemoryEventBus::new();
        let collector = Collector::new();
        let _sub = bus
            .subscribe("orders", EventFilter::all(), collector.clone())
            .await
            .unwrap();

        let events: Vec<Event> = (1..=5).map(|v| event("acc-1", v)).collect();
        bus.publish(&events).await.unwrap();

        wait_for(&collector, 5).await;
        assert_eq!(*collector.versions.lock().unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_replay_from_position() {
        let bus = InMemoryEventBus::new();
        let events: Vec<Event> = (1..=4).map(|v| event("acc-1", v)).collect();
        bus.publish(&events).await.unwrap();

        let collector = Collector::new();
        let _sub = bus
            .subscribe("late", EventFilter::all().from_position(2), collector.clone())
            .await
            .unwrap();

        wait_for(&collector, 2).await;
        assert_eq!(*collector.versions.lock().unwrap(), vec![3, 4]);
    }

    #[tokio::test]
    async fn test_duplicate_event_ids_are_dropped() {
        let bus = InMemoryEventBus::new();
        let collector = Collector::new();
        let _sub = bus
            .subscribe("dedup", EventFilter::all(), collector.clone())
            .await
            .unwrap();

        let one = event("acc-1", 1);
        bus.publish(&[one.clone()]).await.unwrap();
        bus.publish(&[one]).await.unwrap();
        bus.publish(&[event("acc-1", 2)]).await.unwrap();

        wait_for(&collector, 2).await;
        assert_eq!(*collector.versions.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_filtered_subscription() {
        let bus = InMemoryEventBus::new();
        let collector = Collector::new();
        let filter = EventFilter::all().with_event_types(["accounts.v1.MoneyDeposited"]);
        let _sub = bus.subscribe("filtered", filter, collector.clone()).await.unwrap();

        let mut other = event("acc-1", 1);
        other.event_type = "accounts.v1.AccountOpened".to_string();
        bus.publish(&[other, event("acc-1", 2)]).await.unwrap();

        wait_for(&collector, 1).await;
        assert_eq!(*collector.versions.lock().unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let bus = InMemoryEventBus::new();
        let collector = Collector::new();
        let mut sub = bus
            .subscribe("gone", EventFilter::all(), collector.clone())
            .await
            .unwrap();

        sub.unsubscribe().await;
        sub.unsubscribe().await;

        bus.publish(&[event("acc-1", 1)]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(collector.count.load(Ordering::SeqCst), 0);
    }

    struct FailingHandler {
        failures: AtomicUsize,
        successes: AtomicUsize,
    }

    #[async_trait]
    impl EventHandler for FailingHandler {
        async fn handle(&self, _event: &Event) -> AppResult<()> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(AppError::internal("transient"));
            }
            self.successes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_transient_handler_errors_are_redelivered() {
        let bus = InMemoryEventBus::new();
        let handler = Arc::new(FailingHandler {
            failures: AtomicUsize::new(2),
            successes: AtomicUsize::new(0),
        });
        let _sub = bus
            .subscribe("flaky", EventFilter::all(), handler.clone())
            .await
            .unwrap();

        bus.publish(&[event("acc-1", 1)]).await.unwrap();

        for _ in 0..200 {
            if handler.successes.load(Ordering::SeqCst) == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("event was not redelivered to success");
    }
}
