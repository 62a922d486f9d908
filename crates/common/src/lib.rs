//! Common utilities and shared types for mailpipe.
//!
//! This crate provides foundational components used across all mailpipe crates:
//!
//! - **Configuration**: Application settings via [`Config`]
//! - **Error handling**: Unified error types via [`AppError`] and [`AppResult`]
//! - **Status model**: Per-document lifecycle fields via [`TrackedDocument`]
//! - **Metrics**: Retry/processor counters, gauges and histograms via [`Metrics`]
//! - **Metrics push**: Pushgateway-style sinks via [`MetricsEmitter`]
//!
//! # Example
//!
//! ```no_run
//! use mailpipe_common::{AppResult, Collection, Config};
//!
//! fn example() -> AppResult<()> {
//!     let config = Config::load()?;
//!     let policy = config.retry.policy_for(Collection::Chunk);
//!     println!("chunks retry up to {} times", policy.max_attempts);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod metrics;
pub mod metrics_push;
pub mod status;

pub use config::{
    BrokerBackend, BrokerConfig, Config, DatabaseConfig, LoggingConfig, MetricsConfig,
    RetryPolicy, RetryPolicyTable, SchedulerConfig, StoreBackend,
};
pub use error::{AppError, AppResult, ErrorType};
pub use metrics::{Metrics, MetricsSnapshot, ProcessOutcome, RunStatus, Timer};
pub use metrics_push::{MetricsEmitter, MetricsSink, NoopSink, PushgatewaySink};
pub use status::{Collection, DocumentStatus, TrackedDocument};
