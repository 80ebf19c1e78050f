//! Command envelope and idempotency result types.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::domain::Event;
use crate::error::{AppError, AppResult};

/// Metadata travelling with every command.
///
/// `command_id` is client-supplied and doubles as the idempotency key:
/// resubmitting with the same id returns the original outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandMetadata {
    pub command_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,

    pub timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom: BTreeMap<String, String>,
}

impl CommandMetadata {
    pub fn new(command_id: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            correlation_id: None,
            principal_id: None,
            tenant_id: None,
            timestamp: Utc::now(),
            custom: BTreeMap::new(),
        }
    }

    /// Fresh metadata with a random command id, for callers that do not
    /// need cross-submission idempotency.
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_principal(mut self, principal_id: impl Into<String>) -> Self {
        self.principal_id = Some(principal_id.into());
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }
}

/// A serialized command plus its metadata, as routed by both buses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Fully qualified command type, e.g. `accounts.v1.OpenAccount`.
    pub command_type: String,

    /// Opaque serialized command payload.
    pub payload: Vec<u8>,

    pub metadata: CommandMetadata,
}

impl CommandEnvelope {
    pub fn new<C: Serialize>(
        command_type: impl Into<String>,
        command: &C,
        metadata: CommandMetadata,
    ) -> AppResult<Self> {
        let payload = serde_json::to_vec(command)
            .map_err(|e| AppError::internal(format!("command serialization failed: {e}")))?;
        Ok(Self {
            command_type: command_type.into(),
            payload,
            metadata,
        })
    }

    /// Deserialize the payload into a typed command.
    pub fn decode<C: serde::de::DeserializeOwned>(&self) -> AppResult<C> {
        serde_json::from_slice(&self.payload).map_err(|e| {
            AppError::new(
                crate::error::code::INVALID_COMMAND,
                format!("malformed {} payload: {e}", self.command_type),
            )
        })
    }

    /// SHA-256 of the payload, used to detect a command id reused with a
    /// different request body.
    pub fn payload_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.payload);
        hex::encode(hasher.finalize())
    }
}

/// Outcome of an idempotent append, cached per command id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub command_id: String,
    pub aggregate_id: String,

    /// The events persisted for this command, in version order.
    pub events: Vec<Event>,

    /// True when the command id had already been processed and the cached
    /// outcome is being returned.
    pub already_processed: bool,

    pub processed_at: DateTime<Utc>,

    /// When the cached record for this command id expires; resubmissions
    /// after this instant are treated as new commands.
    pub expires_at: DateTime<Utc>,
}

impl CommandResult {
    pub fn event_ids(&self) -> Vec<&str> {
        self.events.iter().map(|e| e.id.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Deposit {
        account_id: String,
        amount: String,
    }

    #[test]
    fn test_envelope_roundtrip() {
        let command = Deposit {
            account_id: "acc-1".to_string(),
            amount: "500.00".to_string(),
        };
        let envelope = CommandEnvelope::new(
            "accounts.v1.Deposit",
            &command,
            CommandMetadata::new("c2").with_principal("alice"),
        )
        .unwrap();

        assert_eq!(envelope.command_type, "accounts.v1.Deposit");
        assert_eq!(envelope.metadata.command_id, "c2");
        let decoded: Deposit = envelope.decode().unwrap();
        assert_eq!(decoded, command);
    }

    #[test]
    fn test_payload_hash_tracks_body() {
        let meta = CommandMetadata::new("c1");
        let a = CommandEnvelope::new("t", &Deposit { account_id: "a".into(), amount: "1".into() }, meta.clone()).unwrap();
        let b = CommandEnvelope::new("t", &Deposit { account_id: "a".into(), amount: "1".into() }, meta.clone()).unwrap();
        let c = CommandEnvelope::new("t", &Deposit { account_id: "a".into(), amount: "2".into() }, meta).unwrap();

        assert_eq!(a.payload_hash(), b.payload_hash());
        assert_ne!(a.payload_hash(), c.payload_hash());
    }

    #[test]
    fn test_decode_malformed_payload() {
        let mut envelope = CommandEnvelope::new(
            "accounts.v1.Deposit",
            &Deposit { account_id: "a".into(), amount: "1".into() },
            CommandMetadata::generate(),
        )
        .unwrap();
        envelope.payload = b"not json".to_vec();

        let err = envelope.decode::<Deposit>().unwrap_err();
        assert_eq!(err.code, crate::error::code::INVALID_COMMAND);
    }
}
