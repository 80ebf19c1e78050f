//! Operation Context
//!
//! Per-call metadata threaded through handlers, stores and transports:
//! principal, tenant, correlation, cancellation deadline and trace context.
//! No globals; the context is an explicit value.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::observability::TraceContext;

/// Context for an operation, used for auditing, tracing and cancellation.
#[derive(Debug, Clone, Default)]
pub struct OperationContext {
    /// Authenticated principal executing the operation.
    pub principal_id: Option<String>,

    pub tenant_id: Option<String>,

    /// Correlation id for the wider business transaction.
    pub correlation_id: Option<String>,

    /// Id of the message that caused this operation.
    pub causation_id: Option<String>,

    /// Absolute deadline; operations and retries consult it before blocking.
    pub deadline: Option<Instant>,

    /// Active trace context, injected into transport headers.
    pub trace: Option<TraceContext>,

    pub custom: BTreeMap<String, String>,
}

impl OperationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_principal(mut self, principal_id: impl Into<String>) -> Self {
        self.principal_id = Some(principal_id.into());
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_causation_id(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set the deadline `timeout` from now.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_trace(mut self, trace: TraceContext) -> Self {
        self.trace = Some(trace);
        self
    }

    /// Generate a correlation id if not present, returning it.
    pub fn ensure_correlation_id(&mut self) -> String {
        self.correlation_id
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone()
    }

    /// Time left until the deadline; `None` when no deadline is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        matches!(self.remaining(), Some(d) if d.is_zero())
    }

    /// The effective timeout of a blocking call: the smaller of the caller's
    /// remaining budget and the given default.
    pub fn effective_timeout(&self, default: Duration) -> Duration {
        match self.remaining() {
            Some(remaining) => remaining.min(default),
            None => default,
        }
    }
}
