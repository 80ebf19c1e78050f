//! Error handling module
//!
//! Application-level error envelope and the wire response envelope shared by
//! the local and distributed command buses.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Application-wide Result type
pub type AppResult<T> = Result<T, AppError>;

/// Stable application error codes.
///
/// Codes are part of the wire contract: clients and the transport retry
/// filter key on them, so they never change once published.
pub mod code {
    pub const VALIDATION_FAILED: &str = "VALIDATION_FAILED";
    pub const INVALID_COMMAND: &str = "INVALID_COMMAND";
    pub const AUTHORIZATION_DENIED: &str = "AUTHORIZATION_DENIED";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const SAVE_FAILED: &str = "SAVE_FAILED";
    pub const UNIQUE_CONSTRAINT_VIOLATION: &str = "UNIQUE_CONSTRAINT_VIOLATION";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const CANCELLED: &str = "CANCELLED";
    pub const TRANSPORT: &str = "TRANSPORT";
    pub const UNHANDLED_COMMAND: &str = "UNHANDLED_COMMAND";
    pub const INTERNAL: &str = "INTERNAL";
}

/// Detail key marking an error as an optimistic-concurrency conflict.
///
/// Handlers that map a store conflict into a `SAVE_FAILED` response set
/// `details["kind"] = "concurrency_conflict"` so the transport can retry
/// without inspecting the human-readable message.
pub const DETAIL_KIND: &str = "kind";
pub const KIND_CONCURRENCY_CONFLICT: &str = "concurrency_conflict";

/// Message substrings recognized as optimistic-lock conflicts when a peer
/// did not set the kind detail (interoperability path).
const CONFLICT_SUBSTRINGS: [&str; 3] = ["concurrency conflict", "version mismatch", "optimistic lock"];

/// Structured application error returned to callers.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct AppError {
    /// Stable, domain-level identifier (e.g. `SAVE_FAILED`).
    pub code: String,

    /// Human-readable description.
    pub message: String,

    /// Optional hint on how to resolve the failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub solution: Option<String>,

    /// Optional structured context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<BTreeMap<String, String>>,
}

impl AppError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            solution: None,
            details: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(code::INTERNAL, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(code::VALIDATION_FAILED, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(code::TIMEOUT, message)
    }

    pub fn with_solution(mut self, solution: impl Into<String>) -> Self {
        self.solution = Some(solution.into());
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn detail(&self, key: &str) -> Option<&str> {
        self.details.as_ref().and_then(|d| d.get(key)).map(String::as_str)
    }

    /// Whether the transport may retry the command that produced this error.
    ///
    /// The dedicated kind marker is authoritative; the message-substring
    /// match exists for peers that only speak the legacy `SAVE_FAILED`
    /// convention.
    pub fn is_retryable_conflict(&self) -> bool {
        if self.detail(DETAIL_KIND) == Some(KIND_CONCURRENCY_CONFLICT) {
            return true;
        }
        if self.code != code::SAVE_FAILED {
            return false;
        }
        let message = self.message.to_lowercase();
        CONFLICT_SUBSTRINGS.iter().any(|s| message.contains(s))
    }
}

/// Wire-level response envelope for command dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,

    /// Serialized typed payload on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<AppError>,
}

impl Response {
    pub fn ok<T: Serialize>(data: &T) -> AppResult<Self> {
        let data = serde_json::to_value(data)
            .map_err(|e| AppError::internal(format!("response serialization failed: {e}")))?;
        Ok(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }

    pub fn ok_empty() -> Self {
        Self {
            success: true,
            data: None,
            error: None,
        }
    }

    pub fn err(error: AppError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }

    /// Deserialize the success payload into a typed value.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> AppResult<T> {
        let data = self
            .data
            .clone()
            .ok_or_else(|| AppError::internal("response has no data payload"))?;
        serde_json::from_value(data)
            .map_err(|e| AppError::internal(format!("response deserialization failed: {e}")))
    }

    /// Collapse into a `Result`, surfacing the error envelope on failure.
    pub fn into_result(self) -> AppResult<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(self
                .error
                .unwrap_or_else(|| AppError::internal("unsuccessful response without error")))
        }
    }
}
