//! Snapshot Store
//!
//! Versioned aggregate snapshots for load acceleration. A snapshot encodes
//! the state after applying all events up to its version; readers fall back
//! to full replay when none exists.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::config::SnapshotConfig;
use crate::event_store::EventStoreError;

/// Bookkeeping stored with every snapshot row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Serialized state size in bytes.
    pub size: i64,

    /// Events folded into this snapshot (equals the snapshot version).
    pub event_count: i64,

    /// Aggregate schema version, consumed by the snapshot upcast hook.
    pub schema_version: i32,
}

/// A stored aggregate snapshot.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub version: i64,
    pub data: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub metadata: SnapshotMetadata,
}

/// Interval-based snapshot policy with bounded retention.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotPolicy {
    /// Snapshot every `interval` events; 0 disables snapshotting.
    pub interval: i64,

    /// Snapshots retained per aggregate after a new one is stored.
    pub retention_count: i64,
}

impl SnapshotPolicy {
    pub fn disabled() -> Self {
        Self {
            interval: 0,
            retention_count: 0,
        }
    }

    pub fn should_snapshot(&self, current_version: i64, last_snapshot_version: i64) -> bool {
        self.interval > 0 && current_version - last_snapshot_version >= self.interval
    }
}

impl From<SnapshotConfig> for SnapshotPolicy {
    fn from(config: SnapshotConfig) -> Self {
        Self {
            interval: config.interval,
            retention_count: config.retention_count,
        }
    }
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        SnapshotConfig::default().into()
    }
}

/// SQLite-backed snapshot store.
#[derive(Clone)]
pub struct SqliteSnapshotStore {
    pool: SqlitePool,
}

impl SqliteSnapshotStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Store a snapshot, replacing any existing row at the same version.
    pub async fn save(&self, snapshot: &Snapshot) -> Result<(), EventStoreError> {
        let metadata = serde_json::to_string(&snapshot.metadata)?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO snapshots (aggregate_id, version, aggregate_type, data, created_at, metadata)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&snapshot.aggregate_id)
        .bind(snapshot.version)
        .bind(&snapshot.aggregate_type)
        .bind(&snapshot.data)
        .bind(snapshot.created_at)
        .bind(&metadata)
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            aggregate_id = %snapshot.aggregate_id,
            version = snapshot.version,
            "snapshot saved"
        );
        Ok(())
    }

    /// Latest snapshot for an aggregate, if any.
    pub async fn load_latest(
        &self,
        aggregate_id: &str,
    ) -> Result<Option<Snapshot>, EventStoreError> {
        let row: Option<(String, i64, String, Vec<u8>, DateTime<Utc>, String)> = sqlx::query_as(
            r#"
            SELECT aggregate_id, version, aggregate_type, data, created_at, metadata
            FROM snapshots
            WHERE aggregate_id = ?
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(aggregate_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((aggregate_id, version, aggregate_type, data, created_at, metadata)) => {
                Ok(Some(Snapshot {
                    aggregate_id,
                    aggregate_type,
                    version,
                    data,
                    created_at,
                    metadata: serde_json::from_str(&metadata)?,
                }))
            }
            None => Ok(None),
        }
    }

    /// Keep the newest `retention_count` snapshots for an aggregate, delete
    /// the rest.
    pub async fn prune(
        &self,
        aggregate_id: &str,
        retention_count: i64,
    ) -> Result<u64, EventStoreError> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM snapshots
            WHERE aggregate_id = ?
              AND version NOT IN (
                  SELECT version FROM snapshots
                  WHERE aggregate_id = ?
                  ORDER BY version DESC
                  LIMIT ?
              )
            "#,
        )
        .bind(aggregate_id)
        .bind(aggregate_id)
        .bind(retention_count)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(deleted)
    }

    pub async fn delete_all(&self, aggregate_id: &str) -> Result<u64, EventStoreError> {
        let deleted = sqlx::query("DELETE FROM snapshots WHERE aggregate_id = ?")
            .bind(aggregate_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted)
    }
}
