//! Metrics collection for the retry scheduler and stage processors.
//!
//! Counters only ever increase; gauges are overwritten on every scheduler run
//! so a healthy pipeline exports explicit zeros instead of missing series.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::ErrorType;
use crate::status::Collection;

const COLLECTIONS: usize = Collection::ALL.len();
const ERROR_TYPES: usize = ErrorType::ALL.len();
const OUTCOMES: usize = ProcessOutcome::ALL.len();

/// Upper bounds (seconds) of the run duration histogram buckets.
pub const RUN_DURATION_BUCKETS: [f64; 11] =
    [0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0];

/// Result label of a scheduler run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Every collection was scanned.
    Success,
    /// At least one collection scan aborted on an infrastructure error.
    Failure,
}

impl RunStatus {
    /// Label value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

/// Outcome label of a processed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Acknowledged.
    Ack,
    /// Rejected and requeued.
    Requeue,
    /// Routed to the failed queue.
    DeadLetter,
}

impl ProcessOutcome {
    /// All outcomes, in exposition order.
    pub const ALL: [Self; 3] = [Self::Ack, Self::Requeue, Self::DeadLetter];

    /// Label value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::Requeue => "requeue",
            Self::DeadLetter => "dead_letter",
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

/// Fixed-bucket histogram of durations.
#[derive(Debug)]
pub struct Histogram {
    buckets: [AtomicU64; RUN_DURATION_BUCKETS.len()],
    sum_us: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    const fn new() -> Self {
        Self {
            buckets: [const { AtomicU64::new(0) }; RUN_DURATION_BUCKETS.len()],
            sum_us: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record one observation.
    pub fn observe(&self, duration: Duration) {
        let secs = duration.as_secs_f64();
        if let Some(slot) = RUN_DURATION_BUCKETS.iter().position(|bound| secs <= *bound) {
            self.buckets[slot].fetch_add(1, Ordering::Relaxed);
        }
        self.sum_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of observations.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Cumulative counts per bucket bound, Prometheus style.
    fn cumulative(&self) -> Vec<(f64, u64)> {
        let mut running = 0;
        RUN_DURATION_BUCKETS
            .iter()
            .zip(self.buckets.iter())
            .map(|(bound, bucket)| {
                running += bucket.load(Ordering::Relaxed);
                (*bound, running)
            })
            .collect()
    }

    fn sum_secs(&self) -> f64 {
        self.sum_us.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }
}

/// Retry and processing metrics collector.
#[derive(Debug)]
pub struct Metrics {
    // === Scheduler counters (per collection) ===
    requeued_total: [AtomicU64; COLLECTIONS],
    skipped_backoff_total: [AtomicU64; COLLECTIONS],
    max_retries_exceeded_total: [AtomicU64; COLLECTIONS],
    claim_conflicts_total: [AtomicU64; COLLECTIONS],

    // === Scheduler gauges (per collection) ===
    stuck_documents: [AtomicU64; COLLECTIONS],
    failed_documents: [AtomicU64; COLLECTIONS],
    /// Whether the gauges of a collection have been set at least once.
    observed: [AtomicBool; COLLECTIONS],

    // === Run metrics ===
    runs_success_total: AtomicU64,
    runs_failure_total: AtomicU64,
    errors_total: [AtomicU64; ERROR_TYPES],
    run_duration: Histogram,

    // === Processor metrics ===
    processed_total: [[AtomicU64; OUTCOMES]; COLLECTIONS],
}

impl Metrics {
    /// Create a new metrics instance with all counters at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            requeued_total: [const { AtomicU64::new(0) }; COLLECTIONS],
            skipped_backoff_total: [const { AtomicU64::new(0) }; COLLECTIONS],
            max_retries_exceeded_total: [const { AtomicU64::new(0) }; COLLECTIONS],
            claim_conflicts_total: [const { AtomicU64::new(0) }; COLLECTIONS],
            stuck_documents: [const { AtomicU64::new(0) }; COLLECTIONS],
            failed_documents: [const { AtomicU64::new(0) }; COLLECTIONS],
            observed: [const { AtomicBool::new(false) }; COLLECTIONS],
            runs_success_total: AtomicU64::new(0),
            runs_failure_total: AtomicU64::new(0),
            errors_total: [const { AtomicU64::new(0) }; ERROR_TYPES],
            run_duration: Histogram::new(),
            processed_total: [const { [const { AtomicU64::new(0) }; OUTCOMES] }; COLLECTIONS],
        }
    }

    /// Set the stuck/failed gauges of a collection to zero.
    pub fn reset_collection_gauges(&self, collection: Collection) {
        self.set_collection_gauges(collection, 0, 0);
    }

    /// Set the stuck/failed gauges of a collection.
    pub fn set_collection_gauges(&self, collection: Collection, stuck: u64, failed: u64) {
        let i = collection.index();
        self.stuck_documents[i].store(stuck, Ordering::Relaxed);
        self.failed_documents[i].store(failed, Ordering::Relaxed);
        self.observed[i].store(true, Ordering::Relaxed);
    }

    /// Record a document requeued by the scheduler.
    pub fn record_requeued(&self, collection: Collection) {
        self.requeued_total[collection.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Record a document skipped because it is inside its backoff window.
    pub fn record_skipped_backoff(&self, collection: Collection) {
        self.skipped_backoff_total[collection.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Record a document escalated after exhausting its retries.
    pub fn record_max_retries_exceeded(&self, collection: Collection) {
        self.max_retries_exceeded_total[collection.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Record a lost claim (another scheduler replica requeued the document).
    pub fn record_claim_conflict(&self, collection: Collection) {
        self.claim_conflicts_total[collection.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Record a categorized error.
    pub fn record_error(&self, error_type: ErrorType) {
        self.errors_total[error_type.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished scheduler run.
    pub fn record_run(&self, status: RunStatus, duration: Duration) {
        match status {
            RunStatus::Success => self.runs_success_total.fetch_add(1, Ordering::Relaxed),
            RunStatus::Failure => self.runs_failure_total.fetch_add(1, Ordering::Relaxed),
        };
        self.run_duration.observe(duration);
    }

    /// Record a processed message.
    pub fn record_processed(&self, collection: Collection, outcome: ProcessOutcome) {
        self.processed_total[collection.index()][outcome.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Current stuck gauge, or `None` if never set.
    #[must_use]
    pub fn stuck_documents(&self, collection: Collection) -> Option<u64> {
        let i = collection.index();
        self.observed[i]
            .load(Ordering::Relaxed)
            .then(|| self.stuck_documents[i].load(Ordering::Relaxed))
    }

    /// Current failed (exhausted) gauge, or `None` if never set.
    #[must_use]
    pub fn failed_documents(&self, collection: Collection) -> Option<u64> {
        let i = collection.index();
        self.observed[i]
            .load(Ordering::Relaxed)
            .then(|| self.failed_documents[i].load(Ordering::Relaxed))
    }

    /// Total requeues for a collection.
    #[must_use]
    pub fn requeued_total(&self, collection: Collection) -> u64 {
        self.requeued_total[collection.index()].load(Ordering::Relaxed)
    }

    /// Total backoff skips for a collection.
    #[must_use]
    pub fn skipped_backoff_total(&self, collection: Collection) -> u64 {
        self.skipped_backoff_total[collection.index()].load(Ordering::Relaxed)
    }

    /// Total escalations for a collection.
    #[must_use]
    pub fn max_retries_exceeded_total(&self, collection: Collection) -> u64 {
        self.max_retries_exceeded_total[collection.index()].load(Ordering::Relaxed)
    }

    /// Total lost claims for a collection.
    #[must_use]
    pub fn claim_conflicts_total(&self, collection: Collection) -> u64 {
        self.claim_conflicts_total[collection.index()].load(Ordering::Relaxed)
    }

    /// Total runs with the given status.
    #[must_use]
    pub fn runs_total(&self, status: RunStatus) -> u64 {
        match status {
            RunStatus::Success => self.runs_success_total.load(Ordering::Relaxed),
            RunStatus::Failure => self.runs_failure_total.load(Ordering::Relaxed),
        }
    }

    /// Total errors of the given type.
    #[must_use]
    pub fn errors_total(&self, error_type: ErrorType) -> u64 {
        self.errors_total[error_type.index()].load(Ordering::Relaxed)
    }

    /// Total processed messages for a collection and outcome.
    #[must_use]
    pub fn processed_total(&self, collection: Collection, outcome: ProcessOutcome) -> u64 {
        self.processed_total[collection.index()][outcome.index()].load(Ordering::Relaxed)
    }

    /// Run duration histogram.
    #[must_use]
    pub const fn run_duration(&self) -> &Histogram {
        &self.run_duration
    }

    /// Get a snapshot of all metrics.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            collections: Collection::ALL
                .iter()
                .map(|&collection| CollectionSnapshot {
                    collection: collection.as_str(),
                    requeued_total: self.requeued_total(collection),
                    skipped_backoff_total: self.skipped_backoff_total(collection),
                    max_retries_exceeded_total: self.max_retries_exceeded_total(collection),
                    claim_conflicts_total: self.claim_conflicts_total(collection),
                    stuck_documents: self.stuck_documents(collection),
                    failed_documents: self.failed_documents(collection),
                })
                .collect(),
            runs_success_total: self.runs_total(RunStatus::Success),
            runs_failure_total: self.runs_total(RunStatus::Failure),
            run_count: self.run_duration.count(),
            run_duration_avg_ms: self.average_run_duration_ms(),
        }
    }

    /// Calculate average run duration.
    fn average_run_duration_ms(&self) -> u64 {
        let count = self.run_duration.count();
        if count > 0 {
            self.run_duration.sum_us.load(Ordering::Relaxed) / count / 1_000
        } else {
            0
        }
    }

    /// Export metrics in Prometheus text format.
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        counter_family(
            &mut output,
            "mailpipe_retry_requeued_total",
            "Documents requeued by the retry scheduler",
            &self.requeued_total,
        );
        counter_family(
            &mut output,
            "mailpipe_retry_skipped_backoff_total",
            "Documents skipped inside their backoff window",
            &self.skipped_backoff_total,
        );
        counter_family(
            &mut output,
            "mailpipe_retry_max_retries_exceeded_total",
            "Documents escalated after exhausting retries",
            &self.max_retries_exceeded_total,
        );
        counter_family(
            &mut output,
            "mailpipe_retry_claim_conflicts_total",
            "Requeue claims lost to another scheduler",
            &self.claim_conflicts_total,
        );

        for (name, help, values) in [
            (
                "mailpipe_retry_stuck_documents",
                "Pending documents eligible for requeue in the last run",
                &self.stuck_documents,
            ),
            (
                "mailpipe_retry_failed_documents",
                "Pending documents with exhausted retries in the last run",
                &self.failed_documents,
            ),
        ] {
            output.push_str(&format!("# HELP {name} {help}\n"));
            output.push_str(&format!("# TYPE {name} gauge\n"));
            for collection in Collection::ALL {
                let i = collection.index();
                if self.observed[i].load(Ordering::Relaxed) {
                    output.push_str(&format!(
                        "{name}{{collection=\"{collection}\"}} {}\n",
                        values[i].load(Ordering::Relaxed)
                    ));
                }
            }
        }

        output.push_str("# HELP mailpipe_retry_runs_total Retry scheduler runs\n");
        output.push_str("# TYPE mailpipe_retry_runs_total counter\n");
        for status in [RunStatus::Success, RunStatus::Failure] {
            output.push_str(&format!(
                "mailpipe_retry_runs_total{{status=\"{}\"}} {}\n",
                status.as_str(),
                self.runs_total(status)
            ));
        }

        output.push_str("# HELP mailpipe_retry_errors_total Retry scheduler errors\n");
        output.push_str("# TYPE mailpipe_retry_errors_total counter\n");
        for error_type in ErrorType::ALL {
            output.push_str(&format!(
                "mailpipe_retry_errors_total{{error_type=\"{}\"}} {}\n",
                error_type.as_str(),
                self.errors_total(error_type)
            ));
        }

        output.push_str(
            "# HELP mailpipe_retry_run_duration_seconds Retry scheduler run duration\n",
        );
        output.push_str("# TYPE mailpipe_retry_run_duration_seconds histogram\n");
        for (bound, count) in self.run_duration.cumulative() {
            output.push_str(&format!(
                "mailpipe_retry_run_duration_seconds_bucket{{le=\"{bound}\"}} {count}\n"
            ));
        }
        output.push_str(&format!(
            "mailpipe_retry_run_duration_seconds_bucket{{le=\"+Inf\"}} {}\n",
            self.run_duration.count()
        ));
        output.push_str(&format!(
            "mailpipe_retry_run_duration_seconds_sum {}\n",
            self.run_duration.sum_secs()
        ));
        output.push_str(&format!(
            "mailpipe_retry_run_duration_seconds_count {}\n",
            self.run_duration.count()
        ));

        output.push_str("# HELP mailpipe_processor_messages_total Messages handled by stage processors\n");
        output.push_str("# TYPE mailpipe_processor_messages_total counter\n");
        for collection in Collection::ALL {
            for outcome in ProcessOutcome::ALL {
                output.push_str(&format!(
                    "mailpipe_processor_messages_total{{collection=\"{collection}\",outcome=\"{}\"}} {}\n",
                    outcome.as_str(),
                    self.processed_total(collection, outcome)
                ));
            }
        }

        output
    }
}

fn counter_family(
    output: &mut String,
    name: &str,
    help: &str,
    values: &[AtomicU64; COLLECTIONS],
) {
    output.push_str(&format!("# HELP {name} {help}\n"));
    output.push_str(&format!("# TYPE {name} counter\n"));
    for collection in Collection::ALL {
        output.push_str(&format!(
            "{name}{{collection=\"{collection}\"}} {}\n",
            values[collection.index()].load(Ordering::Relaxed)
        ));
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-collection part of a [`MetricsSnapshot`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSnapshot {
    pub collection: &'static str,
    pub requeued_total: u64,
    pub skipped_backoff_total: u64,
    pub max_retries_exceeded_total: u64,
    pub claim_conflicts_total: u64,
    pub stuck_documents: Option<u64>,
    pub failed_documents: Option<u64>,
}

/// Snapshot of all metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub collections: Vec<CollectionSnapshot>,
    pub runs_success_total: u64,
    pub runs_failure_total: u64,
    pub run_count: u64,
    pub run_duration_avg_ms: u64,
}

/// Timer guard for measuring operation duration.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    #[must_use]
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration since timer start.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.requeued_total(Collection::Archive), 0);
        assert_eq!(metrics.runs_total(RunStatus::Success), 0);
        assert!(metrics.stuck_documents(Collection::Chunk).is_none());
    }

    #[test]
    fn test_counters_are_per_collection() {
        let metrics = Metrics::new();

        metrics.record_requeued(Collection::Chunk);
        metrics.record_requeued(Collection::Chunk);
        metrics.record_skipped_backoff(Collection::Thread);
        metrics.record_max_retries_exceeded(Collection::Archive);

        assert_eq!(metrics.requeued_total(Collection::Chunk), 2);
        assert_eq!(metrics.requeued_total(Collection::Thread), 0);
        assert_eq!(metrics.skipped_backoff_total(Collection::Thread), 1);
        assert_eq!(metrics.max_retries_exceeded_total(Collection::Archive), 1);
    }

    #[test]
    fn test_gauges_are_overwritten() {
        let metrics = Metrics::new();

        metrics.set_collection_gauges(Collection::Message, 4, 1);
        assert_eq!(metrics.stuck_documents(Collection::Message), Some(4));
        assert_eq!(metrics.failed_documents(Collection::Message), Some(1));

        metrics.reset_collection_gauges(Collection::Message);
        assert_eq!(metrics.stuck_documents(Collection::Message), Some(0));
        assert_eq!(metrics.failed_documents(Collection::Message), Some(0));
    }

    #[test]
    fn test_prometheus_emits_explicit_zero_gauges() {
        let metrics = Metrics::new();
        let before = metrics.to_prometheus();
        assert!(!before.contains("mailpipe_retry_stuck_documents{collection=\"chunk\"}"));

        metrics.reset_collection_gauges(Collection::Chunk);
        let after = metrics.to_prometheus();
        assert!(after.contains("mailpipe_retry_stuck_documents{collection=\"chunk\"} 0\n"));
        assert!(after.contains("mailpipe_retry_failed_documents{collection=\"chunk\"} 0\n"));
    }

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        let metrics = Metrics::new();

        metrics.record_run(RunStatus::Success, Duration::from_millis(50));
        metrics.record_run(RunStatus::Success, Duration::from_secs(3));
        metrics.record_run(RunStatus::Failure, Duration::from_secs(900));

        let text = metrics.to_prometheus();
        assert!(text.contains("mailpipe_retry_run_duration_seconds_bucket{le=\"0.1\"} 1\n"));
        assert!(text.contains("mailpipe_retry_run_duration_seconds_bucket{le=\"5\"} 2\n"));
        assert!(text.contains("mailpipe_retry_run_duration_seconds_bucket{le=\"600\"} 2\n"));
        assert!(text.contains("mailpipe_retry_run_duration_seconds_bucket{le=\"+Inf\"} 3\n"));
        assert!(text.contains("mailpipe_retry_run_duration_seconds_count 3\n"));
        assert!(text.contains("mailpipe_retry_runs_total{status=\"failure\"} 1\n"));
    }

    #[test]
    fn test_errors_by_type() {
        let metrics = Metrics::new();

        metrics.record_error(ErrorType::Database);
        metrics.record_error(ErrorType::Database);
        metrics.record_error(ErrorType::Broker);

        assert_eq!(metrics.errors_total(ErrorType::Database), 2);
        assert_eq!(metrics.errors_total(ErrorType::Broker), 1);
        assert!(metrics
            .to_prometheus()
            .contains("mailpipe_retry_errors_total{error_type=\"database\"} 2\n"));
    }

    #[test]
    fn test_processed_outcomes() {
        let metrics = Metrics::new();

        metrics.record_processed(Collection::Chunk, ProcessOutcome::Ack);
        metrics.record_processed(Collection::Chunk, ProcessOutcome::DeadLetter);

        assert_eq!(metrics.processed_total(Collection::Chunk, ProcessOutcome::Ack), 1);
        assert_eq!(
            metrics.processed_total(Collection::Chunk, ProcessOutcome::Requeue),
            0
        );
    }

    #[test]
    fn test_snapshot() {
        let metrics = Metrics::new();
        metrics.record_requeued(Collection::Archive);
        metrics.record_run(RunStatus::Success, Duration::from_millis(20));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.collections.len(), 4);
        assert_eq!(snapshot.collections[0].requeued_total, 1);
        assert_eq!(snapshot.runs_success_total, 1);
        assert_eq!(snapshot.run_count, 1);
    }
}
