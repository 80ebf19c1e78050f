//! eventum
//!
//! An event-sourcing / CQRS runtime: ordered event streams per aggregate
//! with optimistic concurrency and unique-value constraints in an embedded
//! SQLite store, command dispatch locally or over NATS with command-level
//! idempotency, and read-model projections with transactional checkpoints
//! and full rebuild from the log.

pub mod aggregate;
pub mod command;
pub mod config;
pub mod db;
pub mod domain;
pub mod error;
pub mod event_bus;
pub mod event_store;
pub mod observability;
pub mod projection;
pub mod repository;
pub mod snapshot;

pub use aggregate::{Aggregate, AggregateRoot};
pub use command::{
    handler_fn, CommandBus, CommandHandler, LocalCommandBus, Middleware, NatsCommandBus,
    NatsCredentials,
};
pub use config::Config;
pub use domain::{
    CommandEnvelope, CommandMetadata, CommandResult, ConstraintOp, Event, EventMetadata,
    OperationContext, UniqueConstraint,
};
pub use error::{AppError, AppResult, Response};
pub use event_bus::{EventBus, EventFilter, InMemoryEventBus, NatsEventBus, Subscription};
pub use event_store::{EventStoreError, SqliteEventStore};
pub use projection::{
    Checkpoint, CheckpointStore, Projection, ProjectionBuilder, ProjectionManager,
    SqliteCheckpointStore, SqliteProjectionBuilder,
};
pub use repository::Repository;
pub use snapshot::{Snapshot, SnapshotPolicy, SqliteSnapshotStore};
