//! Pushing metrics to an external sink.
//!
//! The retry scheduler is a periodic job rather than a long-lived scrape
//! target, so its metrics are pushed after every run. A failing sink is
//! logged and otherwise ignored.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::MetricsConfig;
use crate::error::{AppError, AppResult};
use crate::metrics::Metrics;

/// Destination for rendered metrics.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    /// Push a Prometheus text exposition body.
    async fn push(&self, body: String) -> AppResult<()>;
}

/// Sink used when no pushgateway is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

#[async_trait]
impl MetricsSink for NoopSink {
    async fn push(&self, _body: String) -> AppResult<()> {
        Ok(())
    }
}

/// Pushgateway-style HTTP sink.
#[derive(Debug, Clone)]
pub struct PushgatewaySink {
    client: reqwest::Client,
    endpoint: String,
}

impl PushgatewaySink {
    /// Create a sink pushing to `{base_url}/metrics/job/{job}`.
    pub fn new(base_url: &str, job: &str, timeout: Duration) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Config(format!("Failed to build metrics client: {e}")))?;

        Ok(Self {
            client,
            endpoint: Self::endpoint(base_url, job),
        })
    }

    fn endpoint(base_url: &str, job: &str) -> String {
        format!("{}/metrics/job/{job}", base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl MetricsSink for PushgatewaySink {
    async fn push(&self, body: String) -> AppResult<()> {
        let response = self
            .client
            .put(&self.endpoint)
            .header("Content-Type", "text/plain; version=0.0.4")
            .body(body)
            .send()
            .await
            .map_err(|e| AppError::Metrics(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(AppError::Metrics(format!(
                "pushgateway responded with {status}"
            )))
        }
    }
}

/// Couples the metrics registry with a sink.
#[derive(Clone)]
pub struct MetricsEmitter {
    metrics: Arc<Metrics>,
    sink: Arc<dyn MetricsSink>,
}

impl MetricsEmitter {
    /// Create an emitter over an explicit sink.
    #[must_use]
    pub fn new(metrics: Arc<Metrics>, sink: Arc<dyn MetricsSink>) -> Self {
        Self { metrics, sink }
    }

    /// Create an emitter that never pushes.
    #[must_use]
    pub fn noop(metrics: Arc<Metrics>) -> Self {
        Self::new(metrics, Arc::new(NoopSink))
    }

    /// Create an emitter from configuration.
    pub fn from_config(metrics: Arc<Metrics>, config: &MetricsConfig) -> AppResult<Self> {
        match &config.pushgateway_url {
            Some(url) => {
                let sink = PushgatewaySink::new(
                    url,
                    &config.job,
                    Duration::from_millis(config.push_timeout_ms),
                )?;
                Ok(Self::new(metrics, Arc::new(sink)))
            }
            None => Ok(Self::noop(metrics)),
        }
    }

    /// Metrics registry.
    #[must_use]
    pub const fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Push the current metrics. Sink failures are logged, never returned.
    pub async fn flush(&self) {
        match self.sink.push(self.metrics.to_prometheus()).await {
            Ok(()) => debug!("Pushed retry metrics"),
            Err(e) => warn!(error = %e, "Failed to push metrics, continuing"),
        }
    }
}
