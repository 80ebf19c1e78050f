//! Event model
//!
//! The immutable record of a state change, plus the metadata and
//! unique-constraint operations persisted alongside it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Operation performed on a unique-constraint index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintOp {
    Claim,
    Release,
}

impl std::fmt::Display for ConstraintOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConstraintOp::Claim => write!(f, "claim"),
            ConstraintOp::Release => write!(f, "release"),
        }
    }
}

/// A claim or release of `(index_name, value)`, applied atomically with the
/// event that carries it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueConstraint {
    pub index_name: String,
    pub value: String,
    pub op: ConstraintOp,
}

impl UniqueConstraint {
    pub fn claim(index_name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            index_name: index_name.into(),
            value: value.into(),
            op: ConstraintOp::Claim,
        }
    }

    pub fn release(index_name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            index_name: index_name.into(),
            value: value.into(),
            op: ConstraintOp::Release,
        }
    }
}

/// Metadata carried by every event, linking it to the command that produced
/// it and the wider business transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Id of the command that caused this event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,

    /// Id shared by everything belonging to one business transaction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Authenticated principal on whose behalf the command ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom: BTreeMap<String, String>,
}

/// An immutable domain event.
///
/// `version` is assigned by the aggregate root when the event is emitted and
/// validated by the event store on append; `position` is the store-wide
/// sequence, 0 until the event has been persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// 128-bit hex id; deterministic when produced from a command.
    pub id: String,

    pub aggregate_id: String,
    pub aggregate_type: String,

    /// Fully qualified domain name, e.g. `accounts.v1.AccountOpened`.
    pub event_type: String,

    /// Per-aggregate version, dense starting at 1.
    pub version: i64,

    pub timestamp: DateTime<Utc>,

    /// Opaque serialized domain payload.
    pub data: Vec<u8>,

    pub metadata: EventMetadata,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unique_constraints: Vec<UniqueConstraint>,

    /// Store-wide sequence assigned on append.
    #[serde(default)]
    pub position: i64,
}

impl Event {
    /// Deserialize the payload into a typed domain event.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.data)
    }
}
