//! Configuration module
//!
//! Typed configuration for the store, transports and projection engine,
//! loadable from environment variables.

use std::env;
use std::time::Duration;

use crate::command::NatsCredentials;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Event store configuration.
#[derive(Debug, Clone)]
pub struct EventStoreConfig {
    /// SQLite DSN, e.g. `sqlite://events.db` or `sqlite::memory:`.
    pub dsn: String,

    /// Enable WAL journal mode on the connection pool.
    pub wal_mode: bool,

    /// Retention of command idempotency records.
    pub command_ttl: Duration,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            dsn: "sqlite::memory:".to_string(),
            wal_mode: true,
            command_ttl: 7 * DAY,
        }
    }
}

/// Command transport (NATS) configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// NATS server URL.
    pub url: String,

    /// Client connection name.
    pub name: String,

    /// Default request timeout; the effective timeout of a send is the
    /// smaller of this and the caller's deadline.
    pub timeout: Duration,

    /// Queue group used by command subscribers for load balancing.
    pub queue_group: String,

    pub max_reconnect_attempts: usize,
    pub reconnect_wait: Duration,

    /// Maximum retries on optimistic-conflict replies.
    pub max_retries: u32,

    /// Credentials for the connection; `None` connects anonymously.
    pub credentials: Option<NatsCredentials>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            name: "eventum".to_string(),
            timeout: Duration::from_secs(30),
            queue_group: "command-handlers".to_string(),
            max_reconnect_attempts: 10,
            reconnect_wait: Duration::from_secs(2),
            max_retries: 3,
            credentials: None,
        }
    }
}

/// Durable event stream configuration.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// JetStream stream name.
    pub name: String,

    /// Subjects captured by the stream.
    pub subjects: Vec<String>,

    pub max_age: Duration,
    pub max_bytes: i64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            name: "EVENTS".to_string(),
            subjects: vec!["events.>".to_string()],
            max_age: 7 * DAY,
            max_bytes: 1024 * 1024 * 1024,
        }
    }
}

/// Projection manager configuration.
#[derive(Debug, Clone)]
pub struct ProjectionConfig {
    /// Page size used when rebuilding from the event log.
    pub batch_size: i64,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self { batch_size: 1000 }
    }
}

/// Snapshot strategy configuration.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotConfig {
    /// Take a snapshot every `interval` events.
    pub interval: i64,

    /// Snapshots retained per aggregate; older ones are deleted.
    pub retention_count: i64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            interval: 100,
            retention_count: 3,
        }
    }
}

/// Observability configuration; consumed by the tracing init helper and
/// attached as resource attributes on spans.
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    pub service_name: String,
    pub service_version: String,
    pub environment: String,

    /// Fraction of traces to sample, 0.0..=1.0.
    pub trace_sample_rate: f64,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            service_name: "eventum".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            environment: "development".to_string(),
            trace_sample_rate: 1.0,
        }
    }
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub event_store: EventStoreConfig,
    pub transport: TransportConfig,
    pub stream: StreamConfig,
    pub projections: ProjectionConfig,
    pub snapshots: SnapshotConfig,
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from environment variables, falling back to the
    /// defaults above for anything unset. `.env` files are honored.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut config = Self::default();

        if let Ok(dsn) = env::var("EVENTUM_DSN") {
            config.event_store.dsn = dsn;
        }
        config.event_store.wal_mode = parse_opt("EVENTUM_WAL_MODE")?.unwrap_or(config.event_store.wal_mode);
        if let Some(secs) = parse_opt::<u64>("EVENTUM_COMMAND_TTL_SECS")? {
            config.event_store.command_ttl = Duration::from_secs(secs);
        }

        if let Ok(url) = env::var("EVENTUM_NATS_URL") {
            config.transport.url = url;
        }
        if let Ok(name) = env::var("EVENTUM_CLIENT_NAME") {
            config.transport.name = name;
        }
        if let Some(secs) = parse_opt::<u64>("EVENTUM_REQUEST_TIMEOUT_SECS")? {
            config.transport.timeout = Duration::from_secs(secs);
        }
        if let Ok(group) = env::var("EVENTUM_QUEUE_GROUP") {
            config.transport.queue_group = group;
        }
        config.transport.max_retries =
            parse_opt("EVENTUM_MAX_RETRIES")?.unwrap_or(config.transport.max_retries);

        if let Ok(name) = env::var("EVENTUM_STREAM_NAME") {
            config.stream.name = name;
        }
        config.stream.max_bytes = parse_opt("EVENTUM_STREAM_MAX_BYTES")?.unwrap_or(config.stream.max_bytes);
        if let Some(secs) = parse_opt::<u64>("EVENTUM_STREAM_MAX_AGE_SECS")? {
            config.stream.max_age = Duration::from_secs(secs);
        }

        config.projections.batch_size =
            parse_opt("EVENTUM_PROJECTION_BATCH_SIZE")?.unwrap_or(config.projections.batch_size);

        config.snapshots.interval = parse_opt("EVENTUM_SNAPSHOT_INTERVAL")?.unwrap_or(config.snapshots.interval);
        config.snapshots.retention_count =
            parse_opt("EVENTUM_SNAPSHOT_RETENTION")?.unwrap_or(config.snapshots.retention_count);

        if let Ok(name) = env::var("EVENTUM_SERVICE_NAME") {
            config.observability.service_name = name;
        }
        if let Ok(environment) = env::var("EVENTUM_ENVIRONMENT") {
            config.observability.environment = environment;
        }
        config.observability.trace_sample_rate =
            parse_opt("EVENTUM_TRACE_SAMPLE_RATE")?.unwrap_or(config.observability.trace_sample_rate);
        if !(0.0..=1.0).contains(&config.observability.trace_sample_rate) {
            return Err(ConfigError::InvalidValue("EVENTUM_TRACE_SAMPLE_RATE"));
        }

        Ok(config)
    }

    pub fn is_production(&self) -> bool {
        self.observability.environment == "production"
    }
}

fn parse_opt<T: std::str::FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(key)),
        Err(_) => Ok(None),
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.event_store.command_ttl, Duration::from_secs(7 * 24 * 3600));
        assert_eq!(config.transport.timeout, Duration::from_secs(30));
        assert_eq!(config.transport.max_retries, 3);
        assert_eq!(config.transport.queue_group, "command-handlers");
        assert_eq!(config.stream.name, "EVENTS");
        assert_eq!(config.stream.max_bytes, 1024 * 1024 * 1024);
        assert_eq!(config.projections.batch_size, 1000);
        assert_eq!(config.snapshots.interval, 100);
        assert_eq!(config.snapshots.retention_count, 3);
        assert!(!config.is_production());
    }
}
