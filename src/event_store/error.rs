//! Event Store Errors

use crate::error::{code, AppError, DETAIL_KIND, KIND_CONCURRENCY_CONFLICT};

/// Errors that can occur in the event store
#[derive(Debug, thiserror::Error)]
pub enum EventStoreError {
    /// Optimistic concurrency conflict
    #[error("concurrency conflict for aggregate {aggregate_id}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        aggregate_id: String,
        expected: i64,
        actual: i64,
    },

    /// A claim on a value already held by another aggregate
    #[error("unique constraint violation on ({index_name}, {value}): owned by {current_owner}")]
    UniqueConstraintViolation {
        index_name: String,
        value: String,
        current_owner: String,
    },

    /// Load target has no snapshot and no events
    #[error("aggregate not found: {0}")]
    AggregateNotFound(String),

    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid event data
    #[error("invalid event data: {0}")]
    InvalidEventData(String),
}

impl EventStoreError {
    /// Check if this error is a concurrency conflict
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, EventStoreError::ConcurrencyConflict { .. })
    }

    /// Check if this error is retryable by reloading the aggregate
    pub fn is_retryable(&self) -> bool {
        self.is_concurrency_conflict()
    }
}

impl From<EventStoreError> for AppError {
    fn from(err: EventStoreError) -> Self {
        match &err {
            EventStoreError::ConcurrencyConflict { .. } => {
                AppError::new(code::SAVE_FAILED, err.to_string())
                    .with_detail(DETAIL_KIND, KIND_CONCURRENCY_CONFLICT)
                    .with_solution("reload the aggregate and retry the command")
            }
            EventStoreError::UniqueConstraintViolation {
                index_name,
                value,
                current_owner,
            } => AppError::new(code::UNIQUE_CONSTRAINT_VIOLATION, err.to_string())
                .with_detail("index_name", index_name)
                .with_detail("value", value)
                .with_detail("current_owner", current_owner),
            EventStoreError::AggregateNotFound(id) => {
                AppError::new(code::NOT_FOUND, err.to_string()).with_detail("aggregate_id", id)
            }
            _ => AppError::internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_is_retryable() {
        let conflict = EventStoreError::ConcurrencyConflict {
            aggregate_id: "acc-1".to_string(),
            expected: 1,
            actual: 2,
        };
        assert!(conflict.is_retryable());
        assert!(conflict.is_concurrency_conflict());

        let not_found = EventStoreError::AggregateNotFound("acc-1".to_string());
        assert!(!not_found.is_retryable());
    }

    #[test]
    fn test_conflict_maps_to_retryable_app_error() {
        let conflict = EventStoreError::ConcurrencyConflict {
            aggregate_id: "acc-1".to_string(),
            expected: 3,
            actual: 4,
        };
        let app: AppError = conflict.into();
        assert_eq!(app.code, code::SAVE_FAILED);
        assert!(app.is_retryable_conflict());
    }

    #[test]
    fn test_constraint_violation_maps_details() {
        let violation = EventStoreError::UniqueConstraintViolation {
            index_name: "email".to_string(),
            value: "x@y".to_string(),
            current_owner: "acc-1".to_string(),
        };
        let app: AppError = violation.into();
        assert_eq!(app.code, code::UNIQUE_CONSTRAINT_VIOLATION);
        assert_eq!(app.detail("current_owner"), Some("acc-1"));
        assert!(!app.is_retryable_conflict());
    }
}
