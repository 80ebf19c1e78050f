//! Event Store
//!
//! The sole writer of the event log. Appends run in a single transaction
//! covering the version check, the event rows, the unique-constraint index
//! and the command idempotency record, so either everything becomes visible
//! or nothing does. SQLite transactions are serializable, and the unique
//! index on `(aggregate_id, version)` is the write barrier against
//! interleaved appenders.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tokio::task::JoinHandle;

use crate::config::EventStoreConfig;
use crate::domain::{CommandResult, ConstraintOp, Event};
use crate::observability::{metric, noop_metrics, Metrics};

use super::{schema, EventStoreError};

type EventRow = (
    i64,
    String,
    String,
    String,
    String,
    i64,
    DateTime<Utc>,
    Vec<u8>,
    String,
    String,
);

const SELECT_EVENT_COLUMNS: &str =
    "position, id, aggregate_id, aggregate_type, event_type, version, timestamp, data, metadata, unique_constraints";

fn event_from_row(row: EventRow) -> Result<Event, EventStoreError> {
    let (position, id, aggregate_id, aggregate_type, event_type, version, timestamp, data, metadata, constraints) =
        row;
    Ok(Event {
        id,
        aggregate_id,
        aggregate_type,
        event_type,
        version,
        timestamp,
        data,
        metadata: serde_json::from_str(&metadata)?,
        unique_constraints: serde_json::from_str(&constraints)?,
        position,
    })
}

fn is_unique_violation(err: &sqlx::Error, needle: &str) -> bool {
    matches!(err, sqlx::Error::Database(db)
        if db.message().contains("UNIQUE constraint failed") && db.message().contains(needle))
}

/// A live row of the command idempotency table.
struct CommandRow {
    aggregate_id: String,
    event_ids: Vec<String>,
    processed_at: DateTime<Utc>,
    payload_hash: Option<String>,
    expires_at: DateTime<Utc>,
}

/// Summary of a constraint-index rebuild from the event log.
#[derive(Debug, Default)]
pub struct ConstraintRebuild {
    /// Live `(index, value) → owner` entries after the rebuild.
    pub entries: usize,

    /// Inconsistencies observed while replaying claim/release operations.
    /// These are reported, not fatal.
    pub diagnostics: Vec<String>,
}

/// Event Store for persisting and retrieving events
#[derive(Clone)]
pub struct SqliteEventStore {
    pool: SqlitePool,
    command_ttl: Duration,
    metrics: Metrics,
}

impl SqliteEventStore {
    /// Wrap an existing pool. The schema must already be applied (see
    /// [`SqliteEventStore::migrate`] or [`SqliteEventStore::connect`]).
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            command_ttl: EventStoreConfig::default().command_ttl,
            metrics: noop_metrics(),
        }
    }

    /// Open the store described by `config` and apply the schema.
    pub async fn connect(config: &EventStoreConfig) -> Result<Self, EventStoreError> {
        let pool = crate::db::connect(config).await?;
        let store = Self::new(pool).with_command_ttl(config.command_ttl);
        store.migrate().await?;
        Ok(store)
    }

    pub fn with_command_ttl(mut self, ttl: Duration) -> Self {
        self.command_ttl = ttl;
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Apply the event-log DDL idempotently.
    pub async fn migrate(&self) -> Result<(), EventStoreError> {
        schema::apply(&self.pool).await?;
        Ok(())
    }

    /// The underlying pool, shared with snapshot and checkpoint stores.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // =========================================================================
    // Append protocol
    // =========================================================================

    /// Append `events` to `aggregate_id`, requiring the stored version to
    /// equal `expected_version`. Versions `expected+1..` are assigned in
    /// order. Constraint claims/releases carried by the events apply in the
    /// same transaction. Returns the persisted events with their global
    /// positions filled in.
    pub async fn append_events(
        &self,
        aggregate_id: &str,
        expected_version: i64,
        events: Vec<Event>,
    ) -> Result<Vec<Event>, EventStoreError> {
        let started = std::time::Instant::now();
        let mut tx = self.pool.begin().await?;
        let events = Self::append_in_tx(&mut tx, aggregate_id, expected_version, events).await?;
        tx.commit().await?;

        self.metrics.incr(metric::EVENTS_APPENDED, &[], events.len() as u64);
        self.metrics.observe(
            metric::EVENTSTORE_LATENCY,
            &[("op", "append")],
            started.elapsed().as_secs_f64(),
        );
        tracing::debug!(
            aggregate_id,
            expected_version,
            count = events.len(),
            "events appended"
        );
        Ok(events)
    }

    /// [`append_events`](Self::append_events) with command-level idempotency.
    ///
    /// If `command_id` was already processed (and the record has not
    /// expired), the cached outcome is returned with
    /// `already_processed = true` and nothing is written. Otherwise the
    /// append and the idempotency record commit together.
    pub async fn append_events_idempotent(
        &self,
        aggregate_id: &str,
        expected_version: i64,
        events: Vec<Event>,
        command_id: &str,
        ttl: Option<Duration>,
        payload_hash: Option<&str>,
    ) -> Result<CommandResult, EventStoreError> {
        let started = std::time::Instant::now();
        let now = Utc::now();
        let ttl = ttl.unwrap_or(self.command_ttl);

        let mut tx = self.pool.begin().await?;

        if let Some(cached) = Self::lookup_command_in_tx(&mut tx, command_id, now).await? {
            if let (Some(submitted), Some(stored)) = (payload_hash, cached.payload_hash.as_deref())
            {
                if submitted != stored {
                    tracing::warn!(
                        command_id,
                        "command id reused with a different payload; returning cached outcome"
                    );
                }
            }
            let events = Self::load_events_by_ids_in_tx(&mut tx, &cached.event_ids).await?;
            tx.commit().await?;
            return Ok(CommandResult {
                command_id: command_id.to_string(),
                aggregate_id: cached.aggregate_id,
                events,
                already_processed: true,
                processed_at: cached.processed_at,
                expires_at: cached.expires_at,
            });
        }

        let events = Self::append_in_tx(&mut tx, aggregate_id, expected_version, events).await?;

        // Lazy expiry: an expired record for this command id would collide
        // with the fresh insert.
        sqlx::query("DELETE FROM command_results WHERE command_id = ? AND expires_at <= ?")
            .bind(command_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        let event_ids: Vec<&str> = events.iter().map(|e| e.id.as_str()).collect();
        let event_ids_json = serde_json::to_string(&event_ids)?;
        let expires_at = now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::days(7));
        let insert = sqlx::query(
            r#"
            INSERT INTO command_results (command_id, aggregate_id, event_ids, payload_hash, processed_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(command_id)
        .bind(aggregate_id)
        .bind(&event_ids_json)
        .bind(payload_hash)
        .bind(now)
        .bind(expires_at)
        .execute(&mut *tx)
        .await;

        if let Err(err) = insert {
            if is_unique_violation(&err, "command_results") {
                // A concurrent submission of the same command won the race;
                // abandon our transaction and return its outcome.
                drop(tx);
                if let Some(cached) = self.get_command_result(command_id).await? {
                    return Ok(cached);
                }
            }
            return Err(err.into());
        }

        tx.commit().await?;

        self.metrics.incr(metric::EVENTS_APPENDED, &[], events.len() as u64);
        self.metrics.observe(
            metric::EVENTSTORE_LATENCY,
            &[("op", "append_idempotent")],
            started.elapsed().as_secs_f64(),
        );

        Ok(CommandResult {
            command_id: command_id.to_string(),
            aggregate_id: aggregate_id.to_string(),
            events,
            already_processed: false,
            processed_at: now,
            expires_at,
        })
    }

    async fn append_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        aggregate_id: &str,
        expected_version: i64,
        mut events: Vec<Event>,
    ) -> Result<Vec<Event>, EventStoreError> {
        let current = Self::current_version_in_tx(tx, aggregate_id).await?;
        if current != expected_version {
            return Err(EventStoreError::ConcurrencyConflict {
                aggregate_id: aggregate_id.to_string(),
                expected: expected_version,
                actual: current,
            });
        }

        for (index, event) in events.iter_mut().enumerate() {
            if event.aggregate_id != aggregate_id {
                return Err(EventStoreError::InvalidEventData(format!(
                    "event {} targets aggregate {}, append is for {}",
                    event.id, event.aggregate_id, aggregate_id
                )));
            }

            event.version = expected_version + index as i64 + 1;
            let metadata = serde_json::to_string(&event.metadata)?;
            let constraints = serde_json::to_string(&event.unique_constraints)?;

            let inserted: Result<i64, sqlx::Error> = sqlx::query_scalar(
                r#"
                INSERT INTO events (
                    id, aggregate_id, aggregate_type, event_type,
                    version, timestamp, data, metadata, unique_constraints
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                RETURNING position
                "#,
            )
            .bind(&event.id)
            .bind(&event.aggregate_id)
            .bind(&event.aggregate_type)
            .bind(&event.event_type)
            .bind(event.version)
            .bind(event.timestamp)
            .bind(&event.data)
            .bind(&metadata)
            .bind(&constraints)
            .fetch_one(&mut **tx)
            .await;

            match inserted {
                Ok(position) => event.position = position,
                Err(err) if is_unique_violation(&err, "events.aggregate_id") => {
                    // Raced by another appender between our version check
                    // and the insert.
                    let actual = Self::current_version_in_tx(tx, aggregate_id)
                        .await
                        .unwrap_or(expected_version);
                    return Err(EventStoreError::ConcurrencyConflict {
                        aggregate_id: aggregate_id.to_string(),
                        expected: expected_version,
                        actual,
                    });
                }
                Err(err) if is_unique_violation(&err, "events.id") => {
                    return Err(EventStoreError::InvalidEventData(format!(
                        "event id {} already exists",
                        event.id
                    )));
                }
                Err(err) => return Err(err.into()),
            }

            for constraint in &event.unique_constraints {
                Self::apply_constraint_in_tx(tx, aggregate_id, constraint).await?;
            }
        }

        Ok(events)
    }

    async fn apply_constraint_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        aggregate_id: &str,
        constraint: &crate::domain::UniqueConstraint,
    ) -> Result<(), EventStoreError> {
        match constraint.op {
            ConstraintOp::Claim => {
                let owner: Option<String> = sqlx::query_scalar(
                    "SELECT owner_id FROM unique_constraints WHERE index_name = ? AND value = ?",
                )
                .bind(&constraint.index_name)
                .bind(&constraint.value)
                .fetch_optional(&mut **tx)
                .await?;

                if let Some(current_owner) = owner {
                    return Err(EventStoreError::UniqueConstraintViolation {
                        index_name: constraint.index_name.clone(),
                        value: constraint.value.clone(),
                        current_owner,
                    });
                }

                sqlx::query(
                    "INSERT INTO unique_constraints (index_name, value, owner_id) VALUES (?, ?, ?)",
                )
                .bind(&constraint.index_name)
                .bind(&constraint.value)
                .bind(aggregate_id)
                .execute(&mut **tx)
                .await?;
            }
            ConstraintOp::Release => {
                // Owner-checked delete; releasing an absent or foreign entry
                // is a no-op so compensations stay idempotent.
                sqlx::query(
                    "DELETE FROM unique_constraints WHERE index_name = ? AND value = ? AND owner_id = ?",
                )
                .bind(&constraint.index_name)
                .bind(&constraint.value)
                .bind(aggregate_id)
                .execute(&mut **tx)
                .await?;
            }
        }
        Ok(())
    }

    async fn current_version_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        aggregate_id: &str,
    ) -> Result<i64, EventStoreError> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM events WHERE aggregate_id = ?")
                .bind(aggregate_id)
                .fetch_optional(&mut **tx)
                .await?
                .flatten();
        Ok(version.unwrap_or(0))
    }

    // =========================================================================
    // Idempotency records
    // =========================================================================

    async fn lookup_command_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        command_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CommandRow>, EventStoreError> {
        let row: Option<(String, String, DateTime<Utc>, Option<String>, DateTime<Utc>)> =
            sqlx::query_as(
                r#"
                SELECT aggregate_id, event_ids, processed_at, payload_hash, expires_at
                FROM command_results
                WHERE command_id = ? AND expires_at > ?
                "#,
            )
            .bind(command_id)
            .bind(now)
            .fetch_optional(&mut **tx)
            .await?;

        match row {
            Some((aggregate_id, event_ids, processed_at, payload_hash, expires_at)) => {
                let event_ids: Vec<String> = serde_json::from_str(&event_ids)?;
                Ok(Some(CommandRow {
                    aggregate_id,
                    event_ids,
                    processed_at,
                    payload_hash,
                    expires_at,
                }))
            }
            None => Ok(None),
        }
    }

    async fn load_events_by_ids_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        ids: &[String],
    ) -> Result<Vec<Event>, EventStoreError> {
        let mut events = Vec::with_capacity(ids.len());
        for id in ids {
            let row: EventRow = sqlx::query_as(&format!(
                "SELECT {SELECT_EVENT_COLUMNS} FROM events WHERE id = ?"
            ))
            .bind(id)
            .fetch_one(&mut **tx)
            .await?;
            events.push(event_from_row(row)?);
        }
        Ok(events)
    }

    /// Look up the cached outcome of `command_id`, ignoring expired rows.
    pub async fn get_command_result(
        &self,
        command_id: &str,
    ) -> Result<Option<CommandResult>, EventStoreError> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();
        let Some(cached) = Self::lookup_command_in_tx(&mut tx, command_id, now).await? else {
            return Ok(None);
        };
        let events = Self::load_events_by_ids_in_tx(&mut tx, &cached.event_ids).await?;
        tx.commit().await?;
        Ok(Some(CommandResult {
            command_id: command_id.to_string(),
            aggregate_id: cached.aggregate_id,
            events,
            already_processed: true,
            processed_at: cached.processed_at,
            expires_at: cached.expires_at,
        }))
    }

    /// Delete expired command records. Correctness does not depend on this
    /// running; lookups ignore expired rows regardless.
    pub async fn sweep_expired_command_results(&self) -> Result<u64, EventStoreError> {
        let swept = sqlx::query("DELETE FROM command_results WHERE expires_at <= ?")
            .bind(Utc::now())
            .execute(&self.pool)
            .await?
            .rows_affected();
        if swept > 0 {
            tracing::debug!(swept, "expired command results removed");
        }
        Ok(swept)
    }

    /// Spawn a background sweep of expired command records.
    pub fn spawn_command_ttl_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(error) = store.sweep_expired_command_results().await {
                    tracing::warn!(%error, "command ttl sweep failed");
                }
            }
        })
    }

    // =========================================================================
    // Read API
    // =========================================================================

    /// Events for one aggregate strictly after `after_version`, ascending.
    pub async fn load_events(
        &self,
        aggregate_id: &str,
        after_version: i64,
    ) -> Result<Vec<Event>, EventStoreError> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            r#"
            SELECT {SELECT_EVENT_COLUMNS}
            FROM events
            WHERE aggregate_id = ? AND version > ?
            ORDER BY version ASC
            "#
        ))
        .bind(aggregate_id)
        .bind(after_version)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(event_from_row).collect()
    }

    /// Page the whole log in global order, for projection rebuild.
    pub async fn load_all_events(
        &self,
        from_position: i64,
        limit: i64,
    ) -> Result<Vec<Event>, EventStoreError> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            r#"
            SELECT {SELECT_EVENT_COLUMNS}
            FROM events
            WHERE position > ?
            ORDER BY position ASC
            LIMIT ?
            "#
        ))
        .bind(from_position)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(event_from_row).collect()
    }

    /// Current stored version of an aggregate; 0 if unknown.
    pub async fn get_aggregate_version(
        &self,
        aggregate_id: &str,
    ) -> Result<i64, EventStoreError> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM events WHERE aggregate_id = ?")
                .bind(aggregate_id)
                .fetch_optional(&self.pool)
                .await?
                .flatten();
        Ok(version.unwrap_or(0))
    }

    // =========================================================================
    // Unique-constraint index
    // =========================================================================

    /// Whether `(index, value)` is free to claim, with the current owner if
    /// not.
    pub async fn check_uniqueness(
        &self,
        index_name: &str,
        value: &str,
    ) -> Result<(bool, Option<String>), EventStoreError> {
        let owner = self.get_constraint_owner(index_name, value).await?;
        Ok((owner.is_none(), owner))
    }

    pub async fn get_constraint_owner(
        &self,
        index_name: &str,
        value: &str,
    ) -> Result<Option<String>, EventStoreError> {
        let owner: Option<String> = sqlx::query_scalar(
            "SELECT owner_id FROM unique_constraints WHERE index_name = ? AND value = ?",
        )
        .bind(index_name)
        .bind(value)
        .fetch_optional(&self.pool)
        .await?;
        Ok(owner)
    }

    /// Derive the constraint index from scratch by replaying claim/release
    /// operations in global order. Inconsistencies become diagnostics in the
    /// report; the rebuild itself always completes.
    pub async fn rebuild_constraints(&self) -> Result<ConstraintRebuild, EventStoreError> {
        let mut tx = self.pool.begin().await?;
        let mut owners: HashMap<(String, String), String> = HashMap::new();
        let mut report = ConstraintRebuild::default();

        let mut position = 0i64;
        loop {
            let rows: Vec<(i64, String, String)> = sqlx::query_as(
                r#"
                SELECT position, aggregate_id, unique_constraints
                FROM events
                WHERE position > ? AND unique_constraints != '[]'
                ORDER BY position ASC
                LIMIT 1000
                "#,
            )
            .bind(position)
            .fetch_all(&mut *tx)
            .await?;

            let page_len = rows.len();
            for (pos, aggregate_id, constraints_json) in rows {
                position = pos;
                let constraints: Vec<crate::domain::UniqueConstraint> =
                    serde_json::from_str(&constraints_json)?;
                for constraint in constraints {
                    let key = (constraint.index_name.clone(), constraint.value.clone());
                    match constraint.op {
                        ConstraintOp::Claim => {
                            if let Some(existing) = owners.get(&key) {
                                report.diagnostics.push(format!(
                                    "claim of ({}, {}) by {aggregate_id} at position {pos} while owned by {existing}",
                                    key.0, key.1
                                ));
                            } else {
                                owners.insert(key, aggregate_id.clone());
                            }
                        }
                        ConstraintOp::Release => match owners.get(&key) {
                            Some(owner) if owner == &aggregate_id => {
                                owners.remove(&key);
                            }
                            Some(owner) => report.diagnostics.push(format!(
                                "release of ({}, {}) by {aggregate_id} at position {pos} owned by {owner}",
                                key.0, key.1
                            )),
                            None => report.diagnostics.push(format!(
                                "release of ({}, {}) by {aggregate_id} at position {pos} without a prior claim",
                                key.0, key.1
                            )),
                        },
                    }
                }
            }

            if page_len < 1000 {
                break;
            }
        }

        sqlx::query("DELETE FROM unique_constraints")
            .execute(&mut *tx)
            .await?;
        for ((index_name, value), owner_id) in &owners {
            sqlx::query(
                "INSERT INTO unique_constraints (index_name, value, owner_id) VALUES (?, ?, ?)",
            )
            .bind(index_name)
            .bind(value)
            .bind(owner_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        report.entries = owners.len();
        tracing::info!(
            entries = report.entries,
            diagnostics = report.diagnostics.len(),
            "constraint index rebuilt"
        );
        Ok(report)
    }
}
