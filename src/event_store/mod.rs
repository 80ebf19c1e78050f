//! Event Store module
//!
//! Persistence layer for event sourcing: the append protocol with
//! optimistic concurrency, unique-value constraints and command
//! idempotency, plus the global read API used for projection rebuild.

mod error;
pub mod schema;
mod store;

pub use error::EventStoreError;
pub use store::{ConstraintRebuild, SqliteEventStore};
