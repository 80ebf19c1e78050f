//! Repository
//!
//! Bridge between aggregates and the event store: snapshot-accelerated
//! loads, saves with optimistic concurrency, command-idempotent saves and
//! conflict retry with exponential backoff. Persisted events are forwarded
//! to the event bus when one is wired in.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::aggregate::{Aggregate, AggregateRoot};
use crate::domain::{CommandResult, Event};
use crate::error::{AppError, AppResult};
use crate::event_bus::EventBus;
use crate::event_store::{EventStoreError, SqliteEventStore};
use crate::observability::{metric, noop_metrics, Metrics};
use crate::snapshot::{Snapshot, SnapshotMetadata, SnapshotPolicy, SqliteSnapshotStore};

/// Repository over one aggregate type.
pub struct Repository<A> {
    store: SqliteEventStore,
    snapshots: SqliteSnapshotStore,
    policy: SnapshotPolicy,
    event_bus: Option<Arc<dyn EventBus>>,
    metrics: Metrics,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A> Clone for Repository<A> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            snapshots: self.snapshots.clone(),
            policy: self.policy,
            event_bus: self.event_bus.clone(),
            metrics: self.metrics.clone(),
            _aggregate: PhantomData,
        }
    }
}

impl<A> Repository<A>
where
    A: Aggregate + Serialize + DeserializeOwned,
{
    pub fn new(store: SqliteEventStore) -> Self {
        let snapshots = SqliteSnapshotStore::new(store.pool().clone());
        Self {
            store,
            snapshots,
            policy: SnapshotPolicy::default(),
            event_bus: None,
            metrics: noop_metrics(),
            _aggregate: PhantomData,
        }
    }

    pub fn with_snapshot_policy(mut self, policy: SnapshotPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Forward persisted events to `bus` after each successful save.
    pub fn with_event_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn event_store(&self) -> &SqliteEventStore {
        &self.store
    }

    // =========================================================================
    // Load
    // =========================================================================

    /// Restore an aggregate from its latest snapshot plus the event tail.
    ///
    /// A missing snapshot falls back to full replay; a missing history is
    /// [`EventStoreError::AggregateNotFound`].
    pub async fn load(&self, aggregate_id: &str) -> Result<AggregateRoot<A>, EventStoreError> {
        let mut root = AggregateRoot::<A>::new(aggregate_id);

        let snapshot = self.snapshots.load_latest(aggregate_id).await?;
        let had_snapshot = snapshot.is_some();
        if let Some(snapshot) = snapshot {
            self.metrics.incr(metric::SNAPSHOT_HITS, &[], 1);
            let data = A::upcast_snapshot(snapshot.metadata.schema_version, snapshot.data);
            let state: A = serde_json::from_slice(&data)?;
            root.restore_from_snapshot(snapshot.version, state);
        } else {
            self.metrics.incr(metric::SNAPSHOT_MISSES, &[], 1);
        }

        let events = self.store.load_events(aggregate_id, root.version()).await?;
        if !had_snapshot && events.is_empty() {
            return Err(EventStoreError::AggregateNotFound(aggregate_id.to_string()));
        }

        root.load_from_history(events)
            .map_err(|e| EventStoreError::InvalidEventData(e.message))?;
        Ok(root)
    }

    pub async fn exists(&self, aggregate_id: &str) -> Result<bool, EventStoreError> {
        Ok(self.store.get_aggregate_version(aggregate_id).await? > 0)
    }

    // =========================================================================
    // Save
    // =========================================================================

    /// Append the uncommitted events, expecting the stored version to be the
    /// aggregate's committed version. The buffer is cleared only on success.
    pub async fn save(
        &self,
        root: &mut AggregateRoot<A>,
    ) -> Result<Vec<Event>, EventStoreError> {
        if root.uncommitted_events().is_empty() {
            return Ok(Vec::new());
        }

        let expected_version = root.committed_version();
        let events = root.uncommitted_events().to_vec();
        let persisted = self
            .store
            .append_events(root.id(), expected_version, events)
            .await?;
        root.clear_uncommitted();

        self.maybe_snapshot(root).await;
        self.publish(&persisted).await;
        Ok(persisted)
    }

    /// [`save`](Self::save) through the idempotent append. When the command
    /// was already processed the uncommitted buffer is left untouched: those
    /// events are duplicates of persisted history and must be discarded by
    /// the caller.
    pub async fn save_with_command(
        &self,
        root: &mut AggregateRoot<A>,
        command_id: &str,
        payload_hash: Option<&str>,
    ) -> Result<CommandResult, EventStoreError> {
        let expected_version = root.committed_version();
        let events = root.uncommitted_events().to_vec();
        let result = self
            .store
            .append_events_idempotent(
                root.id(),
                expected_version,
                events,
                command_id,
                None,
                payload_hash,
            )
            .await?;

        if result.already_processed {
            return Ok(result);
        }

        root.clear_uncommitted();
        self.maybe_snapshot(root).await;
        self.publish(&result.events).await;
        Ok(result)
    }

    // =========================================================================
    // Conflict retry
    // =========================================================================

    /// Load, mutate and save, retrying on optimistic conflicts with
    /// exponential backoff (`10·2^attempt ms`). Non-conflict errors and
    /// `mutate` failures return immediately; exhaustion returns the last
    /// conflict.
    pub async fn retry_on_conflict<F>(
        &self,
        aggregate_id: &str,
        max_retries: u32,
        mut mutate: F,
    ) -> AppResult<AggregateRoot<A>>
    where
        F: FnMut(&mut AggregateRoot<A>) -> AppResult<()>,
    {
        let mut attempt = 0u32;
        loop {
            let mut root = self.load(aggregate_id).await.map_err(AppError::from)?;
            mutate(&mut root)?;

            match self.save(&mut root).await {
                Ok(_) => return Ok(root),
                Err(error) if error.is_concurrency_conflict() && attempt < max_retries => {
                    let delay = Duration::from_millis(10 * (1 << attempt));
                    tracing::warn!(
                        aggregate_id,
                        attempt = attempt + 1,
                        max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "concurrency conflict, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    // =========================================================================
    // Snapshots & publishing
    // =========================================================================

    async fn maybe_snapshot(&self, root: &AggregateRoot<A>) {
        let last_version = match self.snapshots.load_latest(root.id()).await {
            Ok(snapshot) => snapshot.map(|s| s.version).unwrap_or(0),
            Err(error) => {
                tracing::warn!(aggregate_id = root.id(), %error, "snapshot lookup failed");
                return;
            }
        };

        if !self.policy.should_snapshot(root.version(), last_version) {
            return;
        }

        let data = match serde_json::to_vec(root.state()) {
            Ok(data) => data,
            Err(error) => {
                tracing::warn!(aggregate_id = root.id(), %error, "snapshot serialization failed");
                return;
            }
        };

        let snapshot = Snapshot {
            aggregate_id: root.id().to_string(),
            aggregate_type: A::aggregate_type().to_string(),
            version: root.version(),
            metadata: SnapshotMetadata {
                size: data.len() as i64,
                event_count: root.version(),
                schema_version: A::SCHEMA_VERSION,
            },
            data,
            created_at: Utc::now(),
        };

        // Snapshots are an acceleration; failures never fail the save.
        if let Err(error) = self.snapshots.save(&snapshot).await {
            tracing::warn!(aggregate_id = root.id(), %error, "snapshot save failed");
            return;
        }
        if let Err(error) = self
            .snapshots
            .prune(root.id(), self.policy.retention_count)
            .await
        {
            tracing::warn!(aggregate_id = root.id(), %error, "snapshot prune failed");
        }
    }

    async fn publish(&self, events: &[Event]) {
        let Some(bus) = &self.event_bus else {
            return;
        };
        if events.is_empty() {
            return;
        }
        // The store is the source of truth; projections can rebuild, so a
        // publish failure does not undo the append.
        if let Err(error) = bus.publish(events).await {
            tracing::error!(count = events.len(), %error, "event publish failed");
        }
    }
}
