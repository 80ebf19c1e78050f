//! Domain module
//!
//! Core value types shared by every layer: events, command envelopes,
//! operation context and identifier rules.

pub mod command;
pub mod context;
pub mod event;
pub mod identity;

pub use command::{CommandEnvelope, CommandMetadata, CommandResult};
pub use context::OperationContext;
pub use event::{ConstraintOp, Event, EventMetadata, UniqueConstraint};
pub use identity::{compose_aggregate_id, deterministic_event_id, random_event_id, split_tenant};
