//! Event store schema
//!
//! DDL for the event log and its side tables, applied idempotently at
//! startup. `position` is an AUTOINCREMENT rowid, so the global sequence is
//! strictly increasing and never reused.

use sqlx::SqlitePool;

const DDL: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS events (
        position            INTEGER PRIMARY KEY AUTOINCREMENT,
        id                  TEXT NOT NULL UNIQUE,
        aggregate_id        TEXT NOT NULL,
        aggregate_type      TEXT NOT NULL,
        event_type          TEXT NOT NULL,
        version             INTEGER NOT NULL,
        timestamp           TEXT NOT NULL,
        data                BLOB NOT NULL,
        metadata            TEXT NOT NULL,
        unique_constraints  TEXT NOT NULL DEFAULT '[]',
        UNIQUE (aggregate_id, version)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS command_results (
        command_id    TEXT PRIMARY KEY,
        aggregate_id  TEXT NOT NULL,
        event_ids     TEXT NOT NULL,
        payload_hash  TEXT,
        processed_at  TEXT NOT NULL,
        expires_at    TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_command_results_expires ON command_results (expires_at)",
    r#"
    CREATE TABLE IF NOT EXISTS unique_constraints (
        index_name  TEXT NOT NULL,
        value       TEXT NOT NULL,
        owner_id    TEXT NOT NULL,
        PRIMARY KEY (index_name, value)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS snapshots (
        aggregate_id    TEXT NOT NULL,
        version         INTEGER NOT NULL,
        aggregate_type  TEXT NOT NULL,
        data            BLOB NOT NULL,
        created_at      TEXT NOT NULL,
        metadata        TEXT NOT NULL,
        PRIMARY KEY (aggregate_id, version)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS projection_checkpoints (
        projection_name  TEXT PRIMARY KEY,
        position         INTEGER NOT NULL,
        last_event_id    TEXT,
        updated_at       TEXT NOT NULL
    )
    "#,
];

/// Tables the runtime requires.
pub const REQUIRED_TABLES: &[&str] = &[
    "events",
    "command_results",
    "unique_constraints",
    "snapshots",
    "projection_checkpoints",
];

/// Create all core tables if they do not exist.
pub async fn apply(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for statement in DDL {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
