//! Application configuration.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::status::Collection;

/// Application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Document store configuration.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Message broker configuration.
    #[serde(default)]
    pub broker: BrokerConfig,
    /// Metrics sink configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Retry scheduler configuration.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Per-collection retry policies.
    #[serde(default)]
    pub retry: RetryPolicyTable,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Document store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// `PostgreSQL` via sea-orm.
    #[default]
    Postgres,
    /// Process-local store, for development and tests.
    Memory,
}

/// Document store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Which store implementation to use.
    #[serde(default)]
    pub backend: StoreBackend,
    /// `PostgreSQL` connection URL.
    #[serde(default = "default_database_url")]
    pub url: String,
    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Per-operation timeout in milliseconds.
    #[serde(default = "default_store_timeout_ms")]
    pub operation_timeout_ms: u64,
}

/// Message broker backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerBackend {
    /// Redis lists via fred.
    #[default]
    Redis,
    /// Process-local queues, for development and tests.
    Memory,
}

/// Message broker configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Which broker implementation to use.
    #[serde(default)]
    pub backend: BrokerBackend,
    /// Redis connection URL.
    #[serde(default = "default_redis_url")]
    pub url: String,
    /// Key prefix for all broker keys.
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Per-operation timeout in milliseconds.
    #[serde(default = "default_broker_timeout_ms")]
    pub operation_timeout_ms: u64,
    /// Attempts made by `publish` before surfacing an error.
    #[serde(default = "default_publish_max_attempts")]
    pub publish_max_attempts: u32,
    /// First delay between publish attempts in milliseconds.
    #[serde(default = "default_publish_initial_delay_ms")]
    pub publish_initial_delay_ms: u64,
    /// Upper bound on the delay between publish attempts in milliseconds.
    #[serde(default = "default_publish_max_delay_ms")]
    pub publish_max_delay_ms: u64,
    /// Deliveries after which a requeued message is dead-lettered.
    #[serde(default = "default_max_redeliveries")]
    pub max_redeliveries: u32,
    /// Idle poll interval for consumers in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Seconds a consumer stays alive without a heartbeat. Messages held by
    /// a consumer whose lease lapsed are put back on the topic.
    #[serde(default = "default_consumer_lease_secs")]
    pub consumer_lease_secs: u64,
}

/// Metrics sink configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Pushgateway base URL. Metrics are not pushed when unset.
    #[serde(default)]
    pub pushgateway_url: Option<String>,
    /// Job name used in the push path.
    #[serde(default = "default_metrics_job")]
    pub job: String,
    /// Push timeout in milliseconds.
    #[serde(default = "default_push_timeout_ms")]
    pub push_timeout_ms: u64,
}

/// Retry scheduler configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Interval between scheduler runs in seconds (default: 15 minutes).
    #[serde(default = "default_scheduler_interval_secs")]
    pub interval_secs: u64,
    /// Pending documents loaded per page; each run pages through the whole collection.
    #[serde(default = "default_scan_batch_size")]
    pub scan_batch_size: u64,
    /// Collections scanned on each run.
    #[serde(default = "default_collections")]
    pub collections: Vec<Collection>,
}

/// Retry policy for a single collection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RetryPolicy {
    /// Scheduler requeues allowed before escalation.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Backoff delay after the first attempt, in seconds.
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
    /// Backoff ceiling, in seconds.
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    /// Age after which a never-attempted document counts as stuck, in hours.
    #[serde(default = "default_stuck_threshold_hours")]
    pub stuck_threshold_hours: u64,
    /// Topic republished on requeue. Defaults to the collection's stage topic.
    #[serde(default)]
    pub topic: Option<String>,
}

/// Static retry policy table, one entry per collection.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryPolicyTable {
    /// Archive policy.
    #[serde(default = "RetryPolicy::with_three_attempts")]
    pub archive: RetryPolicy,
    /// Message policy.
    #[serde(default = "RetryPolicy::with_three_attempts")]
    pub message: RetryPolicy,
    /// Chunk policy.
    #[serde(default = "RetryPolicy::with_five_attempts")]
    pub chunk: RetryPolicy,
    /// Thread policy.
    #[serde(default = "RetryPolicy::with_five_attempts")]
    pub thread: RetryPolicy,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON log lines instead of human-readable ones.
    #[serde(default)]
    pub json: bool,
    /// Default `EnvFilter` directive when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_database_url() -> String {
    "postgres://localhost:5432/mailpipe".to_string()
}

const fn default_max_connections() -> u32 {
    20
}

const fn default_min_connections() -> u32 {
    2
}

const fn default_store_timeout_ms() -> u64 {
    10_000
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_prefix() -> String {
    "mailpipe".to_string()
}

const fn default_broker_timeout_ms() -> u64 {
    5_000
}

const fn default_publish_max_attempts() -> u32 {
    5
}

const fn default_publish_initial_delay_ms() -> u64 {
    200
}

const fn default_publish_max_delay_ms() -> u64 {
    5_000
}

const fn default_max_redeliveries() -> u32 {
    10
}

const fn default_poll_interval_ms() -> u64 {
    500
}

const fn default_consumer_lease_secs() -> u64 {
    30
}

fn default_metrics_job() -> String {
    "mailpipe-retry".to_string()
}

const fn default_push_timeout_ms() -> u64 {
    5_000
}

const fn default_scheduler_interval_secs() -> u64 {
    15 * 60
}

const fn default_scan_batch_size() -> u64 {
    1_000
}

fn default_collections() -> Vec<Collection> {
    Collection::ALL.to_vec()
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_base_delay_secs() -> u64 {
    300
}

const fn default_max_delay_secs() -> u64 {
    3_600
}

const fn default_stuck_threshold_hours() -> u64 {
    24
}

fn default_log_filter() -> String {
    "mailpipe=info".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: default_database_url(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            operation_timeout_ms: default_store_timeout_ms(),
        }
    }
}

impl DatabaseConfig {
    /// Per-operation timeout.
    #[must_use]
    pub const fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: BrokerBackend::default(),
            url: default_redis_url(),
            prefix: default_prefix(),
            operation_timeout_ms: default_broker_timeout_ms(),
            publish_max_attempts: default_publish_max_attempts(),
            publish_initial_delay_ms: default_publish_initial_delay_ms(),
            publish_max_delay_ms: default_publish_max_delay_ms(),
            max_redeliveries: default_max_redeliveries(),
            poll_interval_ms: default_poll_interval_ms(),
            consumer_lease_secs: default_consumer_lease_secs(),
        }
    }
}

impl BrokerConfig {
    /// Per-operation timeout.
    #[must_use]
    pub const fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Idle poll interval for consumers.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Consumer lease length.
    #[must_use]
    pub const fn consumer_lease(&self) -> Duration {
        Duration::from_secs(self.consumer_lease_secs)
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            pushgateway_url: None,
            job: default_metrics_job(),
            push_timeout_ms: default_push_timeout_ms(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_scheduler_interval_secs(),
            scan_batch_size: default_scan_batch_size(),
            collections: default_collections(),
        }
    }
}

impl SchedulerConfig {
    /// Interval between scheduler runs.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            json: false,
            filter: default_log_filter(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::with_three_attempts()
    }
}

impl RetryPolicy {
    /// Default policy for the early pipeline stages.
    #[must_use]
    pub fn with_three_attempts() -> Self {
        Self {
            max_attempts: 3,
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
            stuck_threshold_hours: default_stuck_threshold_hours(),
            topic: None,
        }
    }

    /// Default policy for the embedding and summarization stages.
    #[must_use]
    pub fn with_five_attempts() -> Self {
        Self {
            max_attempts: 5,
            ..Self::with_three_attempts()
        }
    }

    /// Backoff delay before a document with `attempt_count` attempts is
    /// eligible again: `min(base * 2^(attempt_count - 1), max)`, and zero
    /// for a never-attempted document.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt_count: u32) -> Duration {
        if attempt_count == 0 {
            return Duration::ZERO;
        }

        let exponent = attempt_count - 1;
        let factor = 2u64.checked_pow(exponent).unwrap_or(u64::MAX);
        let delay_secs = self
            .base_delay_secs
            .saturating_mul(factor)
            .min(self.max_delay_secs);

        Duration::from_secs(delay_secs)
    }

    /// Age after which a never-attempted document counts as stuck.
    #[must_use]
    pub const fn stuck_threshold(&self) -> Duration {
        Duration::from_secs(self.stuck_threshold_hours.saturating_mul(3_600))
    }

    /// Whether another scheduler requeue is allowed after `attempt_count`.
    #[must_use]
    pub const fn should_retry(&self, attempt_count: u32) -> bool {
        attempt_count < self.max_attempts
    }
}

impl Default for RetryPolicyTable {
    fn default() -> Self {
        Self {
            archive: RetryPolicy::with_three_attempts(),
            message: RetryPolicy::with_three_attempts(),
            chunk: RetryPolicy::with_five_attempts(),
            thread: RetryPolicy::with_five_attempts(),
        }
    }
}

impl RetryPolicyTable {
    /// Policy configured for a collection.
    #[must_use]
    pub const fn policy_for(&self, collection: Collection) -> &RetryPolicy {
        match collection {
            Collection::Archive => &self.archive,
            Collection::Message => &self.message,
            Collection::Chunk => &self.chunk,
            Collection::Thread => &self.thread,
        }
    }

    /// Topic republished when a document of `collection` is requeued.
    #[must_use]
    pub fn topic_for(&self, collection: Collection) -> &str {
        self.policy_for(collection)
            .topic
            .as_deref()
            .unwrap_or_else(|| collection.default_topic())
    }
}

impl Config {
    /// Load configuration from files and environment variables.
    ///
    /// Configuration is loaded in the following order:
    /// 1. `.env` (if present, into the process environment)
    /// 2. `config/default.toml`
    /// 3. `config/{environment}.toml` (based on `MAILPIPE_ENV`)
    /// 4. Environment variables with `MAILPIPE__` prefix
    pub fn load() -> Result<Self, config::ConfigError> {
        let _ = dotenvy::dotenv();
        let env = std::env::var("MAILPIPE_ENV").unwrap_or_else(|_| "development".to_string());

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{env}")).required(false))
            .add_source(
                config::Environment::with_prefix("MAILPIPE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load configuration from a specific file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let _ = dotenvy::dotenv();

        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("MAILPIPE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}
