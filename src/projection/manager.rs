//! Projection manager
//!
//! Owns the registered projections and guarantees at most one active worker
//! per projection. The real-time path consumes from the event bus and
//! advances checkpoints after each handled event; the rebuild path replays
//! the event log in global order in pages.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::config::ProjectionConfig;
use crate::domain::{Event, OperationContext};
use crate::error::{code, AppError, AppResult};
use crate::event_bus::{EventBus, EventHandler, Subscription};
use crate::event_store::SqliteEventStore;
use crate::observability::{metric, noop_metrics, Metrics};

use super::{Checkpoint, CheckpointStore, Projection, SqliteCheckpointStore};

/// Manager for a set of projections over one event store and bus.
pub struct ProjectionManager {
    store: SqliteEventStore,
    bus: Arc<dyn EventBus>,
    checkpoints: Arc<dyn CheckpointStore>,
    batch_size: i64,
    metrics: Metrics,
    projections: std::sync::Mutex<HashMap<String, Arc<dyn Projection>>>,
    running: Mutex<HashMap<String, Subscription>>,
}

impl ProjectionManager {
    pub fn new(store: SqliteEventStore, bus: Arc<dyn EventBus>) -> Self {
        let checkpoints = Arc::new(SqliteCheckpointStore::new(store.pool().clone()));
        Self {
            store,
            bus,
            checkpoints,
            batch_size: ProjectionConfig::default().batch_size,
            metrics: noop_metrics(),
            projections: std::sync::Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_config(mut self, config: &ProjectionConfig) -> Self {
        self.batch_size = config.batch_size;
        self
    }

    pub fn with_checkpoint_store(mut self, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = checkpoints;
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn register(&self, projection: Arc<dyn Projection>) {
        self.projections
            .lock()
            .expect("projection registry poisoned")
            .insert(projection.name().to_string(), projection);
    }

    fn projection(&self, name: &str) -> AppResult<Arc<dyn Projection>> {
        self.projections
            .lock()
            .expect("projection registry poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| {
                AppError::new(code::NOT_FOUND, format!("projection {name} is not registered"))
            })
    }

    // =========================================================================
    // Real-time path
    // =========================================================================

    /// Subscribe the projection to the event bus, resuming from its
    /// checkpoint. At most one worker per projection may run.
    pub async fn start(&self, ctx: &OperationContext, name: &str) -> AppResult<()> {
        let projection = self.projection(name)?;

        let mut running = self.running.lock().await;
        if running.contains_key(name) {
            return Err(AppError::validation(format!("projection {name} is already running")));
        }

        let checkpoint = self
            .checkpoints
            .load(name)
            .await?
            .unwrap_or_else(|| Checkpoint::start(name));

        let filter = {
            let mut filter = projection.filter();
            filter.from_position = Some(checkpoint.position);
            filter
        };

        let worker = Arc::new(ProjectionWorker {
            projection: projection.clone(),
            checkpoints: self.checkpoints.clone(),
            position: AtomicI64::new(checkpoint.position),
            metrics: self.metrics.clone(),
            ctx: ctx.clone(),
        });

        let subscription = self.bus.subscribe(name, filter, worker).await?;
        running.insert(name.to_string(), subscription);

        tracing::info!(projection = name, position = checkpoint.position, "projection started");
        Ok(())
    }

    /// Cancel the projection's subscription. Idempotent.
    pub async fn stop(&self, name: &str) -> AppResult<()> {
        let subscription = self.running.lock().await.remove(name);
        if let Some(mut subscription) = subscription {
            subscription.unsubscribe().await;
            tracing::info!(projection = name, "projection stopped");
        }
        Ok(())
    }

    pub async fn stop_all(&self) -> AppResult<()> {
        let names: Vec<String> = self.running.lock().await.keys().cloned().collect();
        for name in names {
            self.stop(&name).await?;
        }
        Ok(())
    }

    pub async fn get_checkpoint(&self, name: &str) -> AppResult<Option<Checkpoint>> {
        self.checkpoints.load(name).await
    }

    // =========================================================================
    // Rebuild path
    // =========================================================================

    /// Reset the projection and replay the whole event log into it in
    /// global order, checkpointing after every page.
    pub async fn rebuild(&self, ctx: &OperationContext, name: &str) -> AppResult<()> {
        let projection = self.projection(name)?;

        self.stop(name).await?;
        projection.reset(ctx).await?;
        self.checkpoints.delete(name).await?;

        let filter = projection.filter();
        let mut cursor = 0i64;
        let mut checkpoint = Checkpoint::start(name);

        loop {
            let page = self
                .store
                .load_all_events(cursor, self.batch_size)
                .await
                .map_err(AppError::from)?;
            let page_len = page.len() as i64;

            for event in &page {
                cursor = event.position;
                if !filter.matches(event) {
                    continue;
                }
                if let Err(error) = projection.handle(ctx, event).await {
                    self.metrics
                        .incr(metric::PROJECTION_ERRORS, &[("projection", name)], 1);
                    tracing::error!(projection = name, event_id = %event.id, %error, "rebuild aborted");
                    return Err(error);
                }
                checkpoint = checkpoint.advanced(event);
            }

            if !projection.manages_checkpoint() && checkpoint.position > 0 {
                checkpoint.updated_at = Utc::now();
                self.checkpoints.save(&checkpoint).await?;
            }

            if page_len < self.batch_size {
                break;
            }
        }

        tracing::info!(projection = name, position = checkpoint.position, "projection rebuilt");
        Ok(())
    }
}

/// Bus-side worker for one projection; single consumer, ordered delivery.
struct ProjectionWorker {
    projection: Arc<dyn Projection>,
    checkpoints: Arc<dyn CheckpointStore>,
    position: AtomicI64,
    metrics: Metrics,
    ctx: OperationContext,
}

#[async_trait]
impl EventHandler for ProjectionWorker {
    async fn handle(&self, event: &Event) -> AppResult<()> {
        let name = self.projection.name().to_string();

        if let Err(error) = self.projection.handle(&self.ctx, event).await {
            self.metrics
                .incr(metric::PROJECTION_ERRORS, &[("projection", &name)], 1);
            return Err(error);
        }

        // Checkpoint only after a successful handle; a failure above leaves
        // the checkpoint untouched so the event is redelivered.
        if !self.projection.manages_checkpoint() {
            let position = self.position.fetch_add(1, Ordering::SeqCst) + 1;
            self.checkpoints
                .save(&Checkpoint {
                    projection_name: name.clone(),
                    position,
                    last_event_id: Some(event.id.clone()),
                    updated_at: Utc::now(),
                })
                .await?;
        }

        let lag = (Utc::now() - event.timestamp).num_milliseconds() as f64 / 1000.0;
        self.metrics
            .gauge(metric::PROJECTION_LAG, &[("projection", &name)], lag.max(0.0));
        Ok(())
    }
}
