//! Observability hooks
//!
//! The only boundary the runtime exposes to telemetry backends: a metric
//! sink trait with named instruments, W3C trace-context propagation for the
//! transports, and a tracing-subscriber bootstrap. Exporters live outside
//! the crate.

use std::sync::Arc;

use rand::RngCore;

use crate::config::ObservabilityConfig;

/// Instrument names emitted through [`MetricSink`].
pub mod metric {
    pub const COMMAND_TOTAL: &str = "command.total";
    pub const COMMAND_ERRORS: &str = "command.errors";
    pub const COMMAND_DURATION: &str = "command.duration";
    pub const EVENTSTORE_LATENCY: &str = "eventstore.latency";
    pub const EVENTS_APPENDED: &str = "events.appended";
    pub const SNAPSHOT_HITS: &str = "eventstore.snapshot.hits";
    pub const SNAPSHOT_MISSES: &str = "eventstore.snapshot.misses";
    pub const PROJECTION_LAG: &str = "projection.lag";
    pub const PROJECTION_ERRORS: &str = "projection.errors";
}

/// Sink for the runtime's counters, histograms and gauges.
///
/// Implementations bridge to the host's metrics backend; the runtime only
/// ever calls these three methods.
pub trait MetricSink: Send + Sync {
    fn incr(&self, name: &'static str, labels: &[(&str, &str)], value: u64);
    fn observe(&self, name: &'static str, labels: &[(&str, &str)], seconds: f64);
    fn gauge(&self, name: &'static str, labels: &[(&str, &str)], value: f64);
}

/// Shared handle to a metric sink.
pub type Metrics = Arc<dyn MetricSink>;

/// Sink that drops every measurement; the default wiring.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricSink for NoopMetrics {
    fn incr(&self, _name: &'static str, _labels: &[(&str, &str)], _value: u64) {}
    fn observe(&self, _name: &'static str, _labels: &[(&str, &str)], _seconds: f64) {}
    fn gauge(&self, _name: &'static str, _labels: &[(&str, &str)], _value: f64) {}
}

pub fn noop_metrics() -> Metrics {
    Arc::new(NoopMetrics)
}

/// W3C trace context, carried across the command transport in message
/// headers (`traceparent`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    /// 16-byte trace id, lowercase hex.
    pub trace_id: String,

    /// 8-byte span id, lowercase hex.
    pub span_id: String,

    pub sampled: bool,
}

impl TraceContext {
    /// Start a new root trace.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut trace = [0u8; 16];
        let mut span = [0u8; 8];
        rng.fill_bytes(&mut trace);
        rng.fill_bytes(&mut span);
        Self {
            trace_id: hex::encode(trace),
            span_id: hex::encode(span),
            sampled: true,
        }
    }

    /// Derive a child context: same trace, fresh span id.
    pub fn child(&self) -> Self {
        let mut span = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut span);
        Self {
            trace_id: self.trace_id.clone(),
            span_id: hex::encode(span),
            sampled: self.sampled,
        }
    }

    /// Render as a `traceparent` header value (version 00).
    pub fn to_traceparent(&self) -> String {
        let flags = if self.sampled { "01" } else { "00" };
        format!("00-{}-{}-{}", self.trace_id, self.span_id, flags)
    }

    /// Parse a `traceparent` header value; `None` on malformed input.
    pub fn from_traceparent(value: &str) -> Option<Self> {
        let mut parts = value.split('-');
        let version = parts.next()?;
        let trace_id = parts.next()?;
        let span_id = parts.next()?;
        let flags = parts.next()?;
        if version != "00" || trace_id.len() != 32 || span_id.len() != 16 || flags.len() != 2 {
            return None;
        }
        if !trace_id.chars().all(|c| c.is_ascii_hexdigit())
            || !span_id.chars().all(|c| c.is_ascii_hexdigit())
        {
            return None;
        }
        // W3C trace context forbids all-zero trace and span ids
        if trace_id.bytes().all(|b| b == b'0') || span_id.bytes().all(|b| b == b'0') {
            return None;
        }
        let sampled = u8::from_str_radix(flags, 16).ok()? & 0x01 == 0x01;
        Some(Self {
            trace_id: trace_id.to_string(),
            span_id: span_id.to_string(),
            sampled,
        })
    }
}

/// Install the global tracing subscriber.
///
/// Human-readable output in development, JSON lines in production. Honors
/// `RUST_LOG`; safe to call more than once (subsequent calls are no-ops).
pub fn init_tracing(config: &ObservabilityConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if config.environment == "production" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init()
            .ok();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init()
            .ok();
    }

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = %config.environment,
        "tracing initialized"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_traceparent_roundtrip() {
        let ctx = TraceContext::generate();
        let header = ctx.to_traceparent();
        let back = TraceContext::from_traceparent(&header).unwrap();
        assert_eq!(back, ctx);
    }

    #[test]
    fn test_child_keeps_trace_id() {
        let parent = TraceContext::generate();
        let child = parent.child();
        assert_eq!(child.trace_id, parent.trace_id);
        assert_ne!(child.span_id, parent.span_id);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(TraceContext::from_traceparent("").is_none());
        assert!(TraceContext::from_traceparent("00-abc-def-01").is_none());
        assert!(TraceContext::from_traceparent(&format!("99-{}-{}-01", "a".repeat(32), "b".repeat(16))).is_none());
        assert!(TraceContext::from_traceparent(&format!("00-{}-{}-01", "0".repeat(32), "b".repeat(16))).is_none());
    }

    #[test]
    fn test_parse_known_vector() {
        let ctx = TraceContext::from_traceparent(
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
        )
        .unwrap();
        assert_eq!(ctx.trace_id, "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_eq!(ctx.span_id, "00f067aa0ba902b7");
        assert!(ctx.sampled);
    }
}
