//! SQLite checkpoint store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::error::{AppError, AppResult};

use super::{Checkpoint, CheckpointStore};

type CheckpointRow = (i64, Option<String>, DateTime<Utc>);

fn checkpoint_from_row(projection_name: &str, row: CheckpointRow) -> Checkpoint {
    let (position, last_event_id, updated_at) = row;
    Checkpoint {
        projection_name: projection_name.to_string(),
        position,
        last_event_id,
        updated_at,
    }
}

/// Checkpoints persisted in the `projection_checkpoints` table, next to the
/// event log.
#[derive(Clone)]
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

impl SqliteCheckpointStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn db_error(context: &str, error: sqlx::Error) -> AppError {
        AppError::internal(format!("{context}: {error}"))
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn load(&self, projection_name: &str) -> AppResult<Option<Checkpoint>> {
        let row: Option<CheckpointRow> = sqlx::query_as(
            "SELECT position, last_event_id, updated_at FROM projection_checkpoints WHERE projection_name = ?",
        )
        .bind(projection_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Self::db_error("checkpoint load failed", e))?;

        Ok(row.map(|row| checkpoint_from_row(projection_name, row)))
    }

    async fn save(&self, checkpoint: &Checkpoint) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO projection_checkpoints (projection_name, position, last_event_id, updated_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&checkpoint.projection_name)
        .bind(checkpoint.position)
        .bind(&checkpoint.last_event_id)
        .bind(checkpoint.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::db_error("checkpoint save failed", e))?;
        Ok(())
    }

    async fn load_in_tx(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        projection_name: &str,
    ) -> AppResult<Option<Checkpoint>> {
        let row: Option<CheckpointRow> = sqlx::query_as(
            "SELECT position, last_event_id, updated_at FROM projection_checkpoints WHERE projection_name = ?",
        )
        .bind(projection_name)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| Self::db_error("checkpoint load failed", e))?;

        Ok(row.map(|row| checkpoint_from_row(projection_name, row)))
    }

    async fn save_in_tx(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        checkpoint: &Checkpoint,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO projection_checkpoints (projection_name, position, last_event_id, updated_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&checkpoint.projection_name)
        .bind(checkpoint.position)
        .bind(&checkpoint.last_event_id)
        .bind(checkpoint.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| Self::db_error("checkpoint save failed", e))?;
        Ok(())
    }

    async fn delete(&self, projection_name: &str) -> AppResult<()> {
        sqlx::query("DELETE FROM projection_checkpoints WHERE projection_name = ?")
            .bind(projection_name)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::db_error("checkpoint delete failed", e))?;
        Ok(())
    }
}
