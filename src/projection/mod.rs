//! Projection engine
//!
//! Read models folded from events, maintained in real time from the event
//! bus and rebuildable from the event log. Checkpoints record how far each
//! projection has consumed; store-backed projections advance them inside
//! the same transaction as the read-model write.

mod builder;
mod checkpoint;
mod manager;
mod sql;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Sqlite, Transaction};

use crate::domain::{Event, OperationContext};
use crate::error::AppResult;
use crate::event_bus::EventFilter;

pub use builder::ProjectionBuilder;
pub use checkpoint::SqliteCheckpointStore;
pub use manager::ProjectionManager;
pub use sql::{SqliteProjection, SqliteProjectionBuilder};

/// A read model fed by events.
#[async_trait]
pub trait Projection: Send + Sync {
    fn name(&self) -> &str;

    /// Which events this projection consumes. Defaults to everything.
    fn filter(&self) -> EventFilter {
        EventFilter::all()
    }

    /// Fold one event into the read model. Errors abort processing for this
    /// projection until it is restarted; other projections are unaffected.
    async fn handle(&self, ctx: &OperationContext, event: &Event) -> AppResult<()>;

    /// Clear all read-model state, ahead of a rebuild.
    async fn reset(&self, ctx: &OperationContext) -> AppResult<()>;

    /// True when [`handle`](Projection::handle) persists the checkpoint
    /// itself, transactionally with the read-model write. The manager then
    /// leaves checkpointing to the projection.
    fn manages_checkpoint(&self) -> bool {
        false
    }
}

/// Progress marker of one projection. `position` is monotonic per
/// projection and counts consumed events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub projection_name: String,
    pub position: i64,
    pub last_event_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    /// The implicit checkpoint of a projection that has consumed nothing.
    pub fn start(projection_name: impl Into<String>) -> Self {
        Self {
            projection_name: projection_name.into(),
            position: 0,
            last_event_id: None,
            updated_at: Utc::now(),
        }
    }

    /// The checkpoint after consuming `event`.
    pub fn advanced(&self, event: &Event) -> Self {
        Self {
            projection_name: self.projection_name.clone(),
            position: self.position + 1,
            last_event_id: Some(event.id.clone()),
            updated_at: Utc::now(),
        }
    }
}

/// Persistence for projection checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, projection_name: &str) -> AppResult<Option<Checkpoint>>;

    async fn save(&self, checkpoint: &Checkpoint) -> AppResult<()>;

    /// Read a checkpoint inside an open store transaction, pairing it with
    /// the read-model state it guards.
    async fn load_in_tx(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        projection_name: &str,
    ) -> AppResult<Option<Checkpoint>>;

    /// Write a checkpoint inside an open store transaction, so it commits
    /// together with the read-model write it describes.
    async fn save_in_tx(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        checkpoint: &Checkpoint,
    ) -> AppResult<()>;

    async fn delete(&self, projection_name: &str) -> AppResult<()>;
}
