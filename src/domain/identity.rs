//! Identifier rules
//!
//! Tenant-composite aggregate ids and event id derivation. Event ids are
//! deterministic when produced from a command so that replaying the same
//! command yields byte-identical events.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Separator between the tenant prefix and the local id.
pub const TENANT_SEPARATOR: &str = "::";

/// Compose a tenant-scoped aggregate id.
pub fn compose_aggregate_id(tenant_id: &str, local_id: &str) -> String {
    format!("{tenant_id}{TENANT_SEPARATOR}{local_id}")
}

/// Split an aggregate id into `(tenant, local)`; the tenant is `None` for
/// ids without a prefix. The store always keeps ids verbatim.
pub fn split_tenant(aggregate_id: &str) -> (Option<&str>, &str) {
    match aggregate_id.split_once(TENANT_SEPARATOR) {
        Some((tenant, local)) if !tenant.is_empty() => (Some(tenant), local),
        _ => (None, aggregate_id),
    }
}

/// Derive a deterministic 128-bit hex event id from the emitting command,
/// the target aggregate and the event's index within the command.
pub fn deterministic_event_id(command_id: &str, aggregate_id: &str, sequence: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(command_id.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(aggregate_id.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(sequence.to_be_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

/// Random 128-bit hex event id, for events emitted outside a command.
pub fn random_event_id() -> String {
    Uuid::new_v4().simple().to_string()
}
