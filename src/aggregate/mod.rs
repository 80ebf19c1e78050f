//! Aggregate module
//!
//! Aggregate Root pattern for event sourcing: domain state types implement
//! [`Aggregate`], and [`AggregateRoot`] wraps them with the version counter,
//! the uncommitted-event buffer and deterministic event ids.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::domain::{
    deterministic_event_id, random_event_id, Event, EventMetadata, OperationContext,
    UniqueConstraint,
};
use crate::error::{AppError, AppResult};

/// Trait that all aggregate state types must implement.
///
/// State is derived from events, never directly mutated: `apply` folds one
/// event into the state and is the only place state changes.
pub trait Aggregate: Sized + Default + Send + Sync {
    /// The type of events this aggregate emits and applies.
    type Event: Serialize + DeserializeOwned + Send;

    /// Schema version recorded with snapshots of this aggregate.
    const SCHEMA_VERSION: i32 = 1;

    /// Get the aggregate type name (for storage and routing)
    fn aggregate_type() -> &'static str;

    /// Fully qualified event type name for a domain event.
    fn event_type(event: &Self::Event) -> &'static str;

    /// Apply an event to update the aggregate state
    fn apply(self, event: Self::Event) -> Self;

    /// Pre-apply hook converting an old payload version to the current one.
    ///
    /// Called on each event immediately after it is read back, before
    /// deserialization. Must be pure; no I/O.
    fn upcast(event_type: &str, data: Vec<u8>) -> (String, Vec<u8>) {
        (event_type.to_string(), data)
    }

    /// Like [`Aggregate::upcast`], for snapshot payloads.
    fn upcast_snapshot(schema_version: i32, data: Vec<u8>) -> Vec<u8> {
        let _ = schema_version;
        data
    }
}

/// In-memory accumulator around an [`Aggregate`] state value.
///
/// Owns the uncommitted-event buffer exclusively; the repository takes the
/// buffer on save and hands ownership of the events to the event store.
#[derive(Debug)]
pub struct AggregateRoot<A: Aggregate> {
    id: String,
    state: A,
    version: i64,
    uncommitted: Vec<Event>,
    command_id: Option<String>,
}

impl<A: Aggregate> AggregateRoot<A> {
    /// A fresh aggregate with no history, version 0.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: A::default(),
            version: 0,
            uncommitted: Vec::new(),
            command_id: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> &A {
        &self.state
    }

    /// Current version including uncommitted events; 0 until first
    /// load or append.
    pub fn version(&self) -> i64 {
        self.version
    }

    /// Version already persisted in the store (excludes uncommitted events).
    pub fn committed_version(&self) -> i64 {
        self.version - self.uncommitted.len() as i64
    }

    /// Record the command currently being processed; consumed when
    /// assigning deterministic event ids.
    pub fn set_command_id(&mut self, command_id: impl Into<String>) {
        self.command_id = Some(command_id.into());
    }

    pub fn command_id(&self) -> Option<&str> {
        self.command_id.as_deref()
    }

    /// Validate-free emit: serialize the payload, assign the next version
    /// and a deterministic id, buffer the record and fold it into state.
    ///
    /// Replaying the same command on a fresh aggregate with identical
    /// inputs produces identical event ids.
    pub fn apply_change(
        &mut self,
        ctx: &OperationContext,
        event: A::Event,
        constraints: Vec<UniqueConstraint>,
    ) -> AppResult<&Event> {
        let event_type = A::event_type(&event);
        let data = serde_json::to_vec(&event)
            .map_err(|e| AppError::internal(format!("event serialization failed: {e}")))?;

        let id = match &self.command_id {
            Some(command_id) => deterministic_event_id(command_id, &self.id, self.uncommitted.len()),
            None => random_event_id(),
        };

        let metadata = EventMetadata {
            causation_id: self.command_id.clone().or_else(|| ctx.causation_id.clone()),
            correlation_id: ctx.correlation_id.clone(),
            principal_id: ctx.principal_id.clone(),
            tenant_id: ctx.tenant_id.clone(),
            custom: ctx.custom.clone(),
        };

        let record = Event {
            id,
            aggregate_id: self.id.clone(),
            aggregate_type: A::aggregate_type().to_string(),
            event_type: event_type.to_string(),
            version: self.version + 1,
            timestamp: chrono::Utc::now(),
            data,
            metadata,
            unique_constraints: constraints,
            position: 0,
        };

        self.uncommitted.push(record);
        self.version += 1;
        let state = std::mem::take(&mut self.state);
        self.state = state.apply(event);

        Ok(self.uncommitted.last().expect("event was just pushed"))
    }

    pub fn uncommitted_events(&self) -> &[Event] {
        &self.uncommitted
    }

    /// Transfer ownership of the uncommitted buffer to the caller.
    pub fn take_uncommitted(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.uncommitted)
    }

    pub fn clear_uncommitted(&mut self) {
        self.uncommitted.clear();
    }

    /// Replay persisted history into the state, setting the version to the
    /// highest replayed event version. Upcasting runs before each apply.
    pub fn load_from_history(&mut self, events: Vec<Event>) -> AppResult<()> {
        for record in events {
            let (_, data) = A::upcast(&record.event_type, record.data);
            let event: A::Event = serde_json::from_slice(&data).map_err(|e| {
                AppError::internal(format!(
                    "cannot replay {} v{} for {}: {e}",
                    record.event_type, record.version, record.aggregate_id
                ))
            })?;
            let state = std::mem::take(&mut self.state);
            self.state = state.apply(event);
            self.version = record.version;
        }
        Ok(())
    }

    /// Restore state from a snapshot taken at `version`.
    pub fn restore_from_snapshot(&mut self, version: i64, state: A) {
        self.state = state;
        self.version = version;
        self.uncommitted.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Counter {
        total: i64,
    }

    #[derive(Debug, Serialize, Deserialize)]
    enum CounterEvent {
        Incremented { by: i64 },
        Reset,
    }

    impl Aggregate for Counter {
        type Event = CounterEvent;

        fn aggregate_type() -> &'static str {
            "Counter"
        }

        fn event_type(event: &Self::Event) -> &'static str {
            match event {
                CounterEvent::Incremented { .. } => "counters.v1.Incremented",
                CounterEvent::Reset => "counters.v1.Reset",
            }
        }

        fn apply(mut self, event: Self::Event) -> Self {
            match event {
                CounterEvent::Incremented { by } => self.total += by,
                CounterEvent::Reset => self.total = 0,
            }
            self
        }
    }

    fn ctx() -> OperationContext {
        OperationContext::new()
            .with_principal("alice")
            .with_correlation_id("corr-1")
    }

    #[test]
    fn test_apply_change_assigns_dense_versions() {
        let mut root = AggregateRoot::<Counter>::new("cnt-1");
        root.apply_change(&ctx(), CounterEvent::Incremented { by: 2 }, vec![]).unwrap();
        root.apply_change(&ctx(), CounterEvent::Incremented { by: 3 }, vec![]).unwrap();

        assert_eq!(root.version(), 2);
        assert_eq!(root.committed_version(), 0);
        assert_eq!(root.state().total, 5);

        let versions: Vec<i64> = root.uncommitted_events().iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![1, 2]);
    }

    #[test]
    fn test_deterministic_event_ids_with_command() {
        let mut a = AggregateRoot::<Counter>::new("cnt-1");
        a.set_command_id("c1");
        a.apply_change(&ctx(), CounterEvent::Incremented { by: 1 }, vec![]).unwrap();
        a.apply_change(&ctx(), CounterEvent::Reset, vec![]).unwrap();

        let mut b = AggregateRoot::<Counter>::new("cnt-1");
        b.set_command_id("c1");
        b.apply_change(&ctx(), CounterEvent::Incremented { by: 1 }, vec![]).unwrap();
        b.apply_change(&ctx(), CounterEvent::Reset, vec![]).unwrap();

        let ids_a: Vec<_> = a.uncommitted_events().iter().map(|e| e.id.clone()).collect();
        let ids_b: Vec<_> = b.uncommitted_events().iter().map(|e| e.id.clone()).collect();
        assert_eq!(ids_a, ids_b);
        assert_ne!(ids_a[0], ids_a[1]);
    }

    #[test]
    fn test_random_event_ids_without_command() {
        let mut a = AggregateRoot::<Counter>::new("cnt-1");
        let mut b = AggregateRoot::<Counter>::new("cnt-1");
        a.apply_change(&ctx(), CounterEvent::Reset, vec![]).unwrap();
        b.apply_change(&ctx(), CounterEvent::Reset, vec![]).unwrap();
        assert_ne!(a.uncommitted_events()[0].id, b.uncommitted_events()[0].id);
    }

    #[test]
    fn test_metadata_from_context_and_command() {
        let mut root = AggregateRoot::<Counter>::new("cnt-1");
        root.set_command_id("c9");
        let event = root
            .apply_change(&ctx(), CounterEvent::Incremented { by: 1 }, vec![])
            .unwrap();

        assert_eq!(event.metadata.causation_id.as_deref(), Some("c9"));
        assert_eq!(event.metadata.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(event.metadata.principal_id.as_deref(), Some("alice"));
    }

    #[test]
    fn test_load_from_history() {
        let mut writer = AggregateRoot::<Counter>::new("cnt-1");
        writer.apply_change(&ctx(), CounterEvent::Incremented { by: 4 }, vec![]).unwrap();
        writer.apply_change(&ctx(), CounterEvent::Incremented { by: 6 }, vec![]).unwrap();
        let history = writer.take_uncommitted();

        let mut reader = AggregateRoot::<Counter>::new("cnt-1");
        reader.load_from_history(history).unwrap();
        assert_eq!(reader.version(), 2);
        assert_eq!(reader.state().total, 10);
        assert!(reader.uncommitted_events().is_empty());
    }

    #[test]
    fn test_take_uncommitted_transfers_buffer() {
        let mut root = AggregateRoot::<Counter>::new("cnt-1");
        root.apply_change(&ctx(), CounterEvent::Reset, vec![]).unwrap();
        let events = root.take_uncommitted();
        assert_eq!(events.len(), 1);
        assert!(root.uncommitted_events().is_empty());
        // Version does not roll back; the events are expected to be persisted
        assert_eq!(root.version(), 1);
    }
}
