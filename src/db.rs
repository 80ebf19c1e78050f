//! Database module
//!
//! SQLite pool construction and schema presence checks.

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::config::EventStoreConfig;
use crate::event_store::schema::REQUIRED_TABLES;

/// Open a pool for the configured DSN, applying WAL mode when requested.
///
/// In-memory DSNs get a single connection: each SQLite `:memory:`
/// connection is its own database.
pub async fn connect(config: &EventStoreConfig) -> Result<SqlitePool, sqlx::Error> {
    let mut options = SqliteConnectOptions::from_str(&config.dsn)?
        .create_if_missing(true)
        .foreign_keys(true);
    if config.wal_mode && !config.dsn.contains(":memory:") {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    let max_connections = if config.dsn.contains(":memory:") { 1 } else { 10 };
    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
}

/// Open an in-memory database, mostly for tests and examples.
pub async fn connect_memory() -> Result<SqlitePool, sqlx::Error> {
    connect(&EventStoreConfig {
        dsn: "sqlite::memory:".to_string(),
        ..Default::default()
    })
    .await
}

/// Simple connectivity check
pub async fn verify_connection(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Check if required tables exist
pub async fn check_schema(pool: &SqlitePool) -> Result<bool, sqlx::Error> {
    for table in REQUIRED_TABLES {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?)",
        )
        .bind(table)
        .fetch_one(pool)
        .await?;

        if !exists {
            tracing::error!("required table '{}' does not exist", table);
            return Ok(false);
        }
    }

    Ok(true)
}
