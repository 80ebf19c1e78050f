//! Store-backed projection builder
//!
//! Projections whose read model lives in the same SQLite database as the
//! event log. Every event is processed in its own transaction, and the
//! checkpoint advances inside that transaction: after a crash the read
//! model always equals the state as of the last committed checkpoint.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::domain::{Event, OperationContext};
use crate::error::{AppError, AppResult};
use crate::event_bus::EventFilter;

use super::{Checkpoint, CheckpointStore, Projection, SqliteCheckpointStore};

fn db_error(context: &str, error: sqlx::Error) -> AppError {
    AppError::internal(format!("{context}: {error}"))
}

/// Object-safe seam for per-event transactional handlers.
#[async_trait]
trait TxEventHandler: Send + Sync {
    async fn call(&self, tx: &mut Transaction<'static, Sqlite>, event: Event) -> AppResult<()>;
}

struct TypedTxHandler<T, F> {
    event_type: String,
    handler: F,
    _payload: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T, F> TxEventHandler for TypedTxHandler<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: for<'a> Fn(&'a mut Transaction<'static, Sqlite>, Event, T) -> BoxFuture<'a, AppResult<()>>
        + Send
        + Sync,
{
    async fn call(&self, tx: &mut Transaction<'static, Sqlite>, event: Event) -> AppResult<()> {
        let payload: T = serde_json::from_slice(&event.data).map_err(|e| {
            AppError::internal(format!("cannot decode {} payload: {e}", self.event_type))
        })?;
        (self.handler)(tx, event, payload).await
    }
}

#[async_trait]
trait TxResetHandler: Send + Sync {
    async fn call(&self, tx: &mut Transaction<'static, Sqlite>) -> AppResult<()>;
}

struct ResetFnHandler<F>(F);

#[async_trait]
impl<F> TxResetHandler for ResetFnHandler<F>
where
    F: for<'a> Fn(&'a mut Transaction<'static, Sqlite>) -> BoxFuture<'a, AppResult<()>>
        + Send
        + Sync,
{
    async fn call(&self, tx: &mut Transaction<'static, Sqlite>) -> AppResult<()> {
        (self.0)(tx).await
    }
}

/// A versioned DDL step for a projection's read-model tables.
#[derive(Debug, Clone)]
struct Migration {
    version: i64,
    name: String,
    sql: String,
}

/// Builder for SQLite-backed projections.
pub struct SqliteProjectionBuilder {
    name: String,
    pool: SqlitePool,
    handlers: HashMap<String, Arc<dyn TxEventHandler>>,
    on_reset: Option<Arc<dyn TxResetHandler>>,
    migrations: Vec<Migration>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
}

impl SqliteProjectionBuilder {
    pub fn new(name: impl Into<String>, pool: SqlitePool) -> Self {
        Self {
            name: name.into(),
            pool,
            handlers: HashMap::new(),
            on_reset: None,
            migrations: Vec::new(),
            checkpoints: None,
        }
    }

    /// Use a custom checkpoint store; defaults to the SQLite store over the
    /// projection's own pool. The store's `save_in_tx` runs inside the
    /// per-event transaction.
    pub fn with_checkpoint_store(mut self, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    /// Register a typed handler for one event type. The handler receives the
    /// open per-event transaction; its writes commit together with the
    /// checkpoint.
    pub fn on<T, F>(mut self, event_type: impl Into<String>, handler: F) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        F: for<'a> Fn(
                &'a mut Transaction<'static, Sqlite>,
                Event,
                T,
            ) -> BoxFuture<'a, AppResult<()>>
            + Send
            + Sync
            + 'static,
    {
        let event_type = event_type.into();
        self.handlers.insert(
            event_type.clone(),
            Arc::new(TypedTxHandler {
                event_type,
                handler,
                _payload: PhantomData,
            }),
        );
        self
    }

    /// Transactional callback that clears the read model on reset.
    pub fn on_reset<F>(mut self, callback: F) -> Self
    where
        F: for<'a> Fn(&'a mut Transaction<'static, Sqlite>) -> BoxFuture<'a, AppResult<()>>
            + Send
            + Sync
            + 'static,
    {
        self.on_reset = Some(Arc::new(ResetFnHandler(callback)));
        self
    }

    /// Declare the read-model schema as a single versioned step.
    pub fn with_schema(self, sql: impl Into<String>) -> Self {
        self.with_migration(1, "schema", sql)
    }

    /// Declare one versioned migration step. Steps apply in version order,
    /// once each, tracked per projection.
    pub fn with_migration(
        mut self,
        version: i64,
        name: impl Into<String>,
        sql: impl Into<String>,
    ) -> Self {
        self.migrations.push(Migration {
            version,
            name: name.into(),
            sql: sql.into(),
        });
        self
    }

    fn migrations_table(name: &str) -> String {
        let safe: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        format!("projection_{safe}_schema_migrations")
    }

    /// Apply pending migrations and produce the projection.
    pub async fn build(mut self) -> AppResult<Arc<SqliteProjection>> {
        self.migrations.sort_by_key(|m| m.version);

        if !self.migrations.is_empty() {
            let table = Self::migrations_table(&self.name);
            sqlx::query(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (version INTEGER PRIMARY KEY, name TEXT NOT NULL, applied_at TEXT NOT NULL)"
            ))
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("migrations table setup failed", e))?;

            for migration in &self.migrations {
                let applied: bool = sqlx::query_scalar(&format!(
                    "SELECT EXISTS (SELECT 1 FROM {table} WHERE version = ?)"
                ))
                .bind(migration.version)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| db_error("migration lookup failed", e))?;
                if applied {
                    continue;
                }

                let mut tx = self
                    .pool
                    .begin()
                    .await
                    .map_err(|e| db_error("migration begin failed", e))?;
                for statement in migration.sql.split(';') {
                    let statement = statement.trim();
                    if statement.is_empty() {
                        continue;
                    }
                    sqlx::query(statement)
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| {
                            db_error(&format!("migration {} failed", migration.version), e)
                        })?;
                }
                sqlx::query(&format!(
                    "INSERT INTO {table} (version, name, applied_at) VALUES (?, ?, ?)"
                ))
                .bind(migration.version)
                .bind(&migration.name)
                .bind(Utc::now())
                .execute(&mut *tx)
                .await
                .map_err(|e| db_error("migration record failed", e))?;
                tx.commit()
                    .await
                    .map_err(|e| db_error("migration commit failed", e))?;

                tracing::info!(
                    projection = %self.name,
                    version = migration.version,
                    name = %migration.name,
                    "projection migration applied"
                );
            }
        }

        let filter = EventFilter::all().with_event_types(self.handlers.keys().cloned());
        let checkpoints = match self.checkpoints.take() {
            Some(checkpoints) => checkpoints,
            None => Arc::new(SqliteCheckpointStore::new(self.pool.clone())),
        };
        Ok(Arc::new(SqliteProjection {
            name: self.name,
            pool: self.pool,
            handlers: self.handlers,
            on_reset: self.on_reset,
            filter,
            checkpoints,
        }))
    }
}

/// Projection produced by [`SqliteProjectionBuilder`]; checkpoints advance
/// inside the per-event transaction.
pub struct SqliteProjection {
    name: String,
    pool: SqlitePool,
    handlers: HashMap<String, Arc<dyn TxEventHandler>>,
    on_reset: Option<Arc<dyn TxResetHandler>>,
    filter: EventFilter,
    checkpoints: Arc<dyn CheckpointStore>,
}

#[async_trait]
impl Projection for SqliteProjection {
    fn name(&self) -> &str {
        &self.name
    }

    fn filter(&self) -> EventFilter {
        self.filter.clone()
    }

    fn manages_checkpoint(&self) -> bool {
        true
    }

    async fn handle(&self, _ctx: &OperationContext, event: &Event) -> AppResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("projection begin failed", e))?;

        let current = self
            .checkpoints
            .load_in_tx(&mut tx, &self.name)
            .await?
            .unwrap_or_else(|| Checkpoint::start(&self.name));

        if let Some(handler) = self.handlers.get(&event.event_type) {
            handler.call(&mut tx, event.clone()).await?;
        }

        // Checkpoint and read-model write commit or roll back together
        self.checkpoints
            .save_in_tx(&mut tx, &current.advanced(event))
            .await?;
        tx.commit()
            .await
            .map_err(|e| db_error("projection commit failed", e))?;
        Ok(())
    }

    async fn reset(&self, _ctx: &OperationContext) -> AppResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("reset begin failed", e))?;

        if let Some(callback) = &self.on_reset {
            callback.call(&mut tx).await?;
        }
        tx.commit()
            .await
            .map_err(|e| db_error("reset commit failed", e))?;

        self.checkpoints.delete(&self.name).await?;
        Ok(())
    }
}
