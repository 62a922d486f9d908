//! Retry/backoff scheduler.
//!
//! Periodically pages through every collection's pending documents and
//! drives forward those whose retry window has elapsed:
//!
//! - below the retry budget: claim the next attempt with a compare-and-set on
//!   `attempt_count`, then republish the stage event
//! - budget used up: push the stage event into the topic's failed queue, then
//!   mark the document escalated so later scans leave it out
//!
//! Claims are conditional updates, so concurrent runs (overlapping ticks or
//! several replicas) requeue each document at most once per attempt.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use mailpipe_common::{
    AppError, Collection, DocumentStatus, MetricsEmitter, RetryPolicy, RetryPolicyTable, RunStatus,
    SchedulerConfig, Timer, TrackedDocument,
};
use mailpipe_db::{DocumentStore, ScanCursor};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use crate::bus::MessageBus;
use crate::envelope::StageEvent;
use crate::operator::FailedQueueOperator;
use crate::retry::{RetryConfig, publish_with_retry};

/// Reason attached to escalated stage events.
pub const MAX_RETRIES_EXCEEDED_REASON: &str = "max retries exceeded";

/// Why a pending document was left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Already completed or failed.
    Terminal,
    /// Never attempted and younger than the stuck threshold.
    NotStuck,
    /// Attempted, and the backoff delay has not elapsed.
    Backoff,
}

/// What the scheduler does with one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Leave it.
    Skip(SkipReason),
    /// Claim the next attempt and republish.
    Requeue,
    /// Retry budget used up.
    Escalate,
}

fn to_delta(duration: std::time::Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

/// Decide what to do with `document` at `now`.
///
/// Both windows are inclusive: a document is due exactly when its delay has
/// elapsed.
#[must_use]
pub fn evaluate(document: &TrackedDocument, policy: &RetryPolicy, now: DateTime<Utc>) -> Decision {
    if document.status != DocumentStatus::Pending {
        return Decision::Skip(SkipReason::Terminal);
    }

    if document.attempt_count == 0 {
        if now.signed_duration_since(document.created_at) < to_delta(policy.stuck_threshold()) {
            return Decision::Skip(SkipReason::NotStuck);
        }
    } else {
        let last = document.last_attempt_time.unwrap_or(document.created_at);
        let delay = to_delta(policy.delay_for_attempt(document.attempt_count));
        match last.checked_add_signed(delay) {
            Some(due) if now >= due => {}
            _ => return Decision::Skip(SkipReason::Backoff),
        }
    }

    if policy.should_retry(document.attempt_count) {
        Decision::Requeue
    } else {
        Decision::Escalate
    }
}

/// Outcome of scanning one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionReport {
    /// Collection scanned.
    pub collection: Collection,
    /// Pending, not yet escalated documents examined.
    pub scanned: u64,
    /// Documents due for a requeue.
    pub stuck: u64,
    /// Documents claimed and republished.
    pub requeued: u64,
    /// Documents still inside their window.
    pub skipped: u64,
    /// Pending documents that used up their retry budget, escalated or not.
    pub exhausted: u64,
    /// Exhausted documents escalated by this run.
    pub escalated: u64,
    /// Claims lost to a concurrent run.
    pub claim_conflicts: u64,
    /// Per-document errors.
    pub errors: u64,
    /// Whether the scan itself failed.
    pub aborted: bool,
}

impl CollectionReport {
    fn new(collection: Collection) -> Self {
        Self {
            collection,
            scanned: 0,
            stuck: 0,
            requeued: 0,
            skipped: 0,
            exhausted: 0,
            escalated: 0,
            claim_conflicts: 0,
            errors: 0,
            aborted: false,
        }
    }
}

/// Outcome of one scheduler run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Run status.
    pub status: RunStatus,
    /// Per-collection results.
    pub collections: Vec<CollectionReport>,
    /// Wall time of the run in milliseconds.
    pub duration_ms: u64,
}

impl RunReport {
    /// Total documents requeued.
    #[must_use]
    pub fn requeued(&self) -> u64 {
        self.collections.iter().map(|c| c.requeued).sum()
    }

    /// Total documents escalated.
    #[must_use]
    pub fn escalated(&self) -> u64 {
        self.collections.iter().map(|c| c.escalated).sum()
    }
}

/// Periodic retry scheduler.
pub struct RetryScheduler {
    store: Arc<dyn DocumentStore>,
    bus: Arc<dyn MessageBus>,
    operator: FailedQueueOperator,
    emitter: MetricsEmitter,
    policies: RetryPolicyTable,
    config: SchedulerConfig,
    publish_retry: RetryConfig,
}

impl RetryScheduler {
    /// Create a scheduler.
    #[must_use]
    pub fn new(
        store: Arc<dyn DocumentStore>,
        bus: Arc<dyn MessageBus>,
        emitter: MetricsEmitter,
        policies: RetryPolicyTable,
        config: SchedulerConfig,
        publish_retry: RetryConfig,
    ) -> Self {
        Self {
            store,
            operator: FailedQueueOperator::new(Arc::clone(&bus)),
            bus,
            emitter,
            policies,
            config,
            publish_retry,
        }
    }

    /// Run one scan at the current time.
    pub async fn run_once(&self) -> RunReport {
        self.run_at(Utc::now()).await
    }

    /// Run one scan as of `now`.
    ///
    /// Never fails: infrastructure errors are logged, counted and end the
    /// affected collection's scan early. Metrics are pushed at the end.
    pub async fn run_at(&self, now: DateTime<Utc>) -> RunReport {
        let timer = Timer::start();
        let metrics = self.emitter.metrics();

        let mut collections = Vec::with_capacity(self.config.collections.len());
        for &collection in &self.config.collections {
            metrics.reset_collection_gauges(collection);
            let report = self.scan_collection(collection, now).await;
            metrics.set_collection_gauges(collection, report.stuck, report.exhausted);
            collections.push(report);
        }

        let status = if collections.iter().any(|c| c.aborted) {
            RunStatus::Failure
        } else {
            RunStatus::Success
        };
        let elapsed = timer.elapsed();
        metrics.record_run(status, elapsed);

        let report = RunReport {
            status,
            collections,
            duration_ms: elapsed.as_millis() as u64,
        };

        info!(
            status = status.as_str(),
            requeued = report.requeued(),
            escalated = report.escalated(),
            duration_ms = report.duration_ms,
            "Retry scheduler run finished"
        );

        self.emitter.flush().await;
        report
    }

    /// Scan one collection, page by page.
    pub async fn scan_collection(&self, collection: Collection, now: DateTime<Utc>) -> CollectionReport {
        let metrics = self.emitter.metrics();
        let policy = self.policies.policy_for(collection);
        let page_size = self.config.scan_batch_size.max(1);
        let mut report = CollectionReport::new(collection);
        let mut cursor: Option<ScanCursor> = None;

        loop {
            let page = match self
                .store
                .find_pending(collection, cursor.as_ref(), page_size)
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    error!(%collection, error = %e, "Failed to scan collection");
                    metrics.record_error(e.error_type());
                    report.aborted = true;
                    return report;
                }
            };

            report.scanned += page.len() as u64;
            for document in &page {
                self.visit(document, policy, now, &mut report).await;
            }

            if (page.len() as u64) < page_size {
                break;
            }
            cursor = page.last().map(ScanCursor::after);
        }
        debug!(%collection, scanned = report.scanned, "Scanned pending documents");

        match self.store.count_exhausted(collection, policy.max_attempts).await {
            Ok(exhausted) => report.exhausted = exhausted,
            Err(e) => {
                error!(%collection, error = %e, "Failed to count exhausted documents");
                metrics.record_error(e.error_type());
                report.aborted = true;
            }
        }

        report
    }

    async fn visit(
        &self,
        document: &TrackedDocument,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
        report: &mut CollectionReport,
    ) {
        let collection = document.collection;
        let metrics = self.emitter.metrics();

        match evaluate(document, policy, now) {
            Decision::Skip(SkipReason::Terminal) => {}
            Decision::Skip(reason) => {
                debug!(%collection, document_id = %document.id, ?reason, "Skipping document");
                metrics.record_skipped_backoff(collection);
                report.skipped += 1;
            }
            Decision::Requeue => {
                report.stuck += 1;
                if let Err(e) = self.requeue(document, now, report).await {
                    warn!(%collection, document_id = %document.id, error = %e, "Requeue failed");
                    metrics.record_error(e.error_type());
                    report.errors += 1;
                }
            }
            Decision::Escalate => {
                if let Err(e) = self.escalate(document, now, report).await {
                    warn!(%collection, document_id = %document.id, error = %e, "Escalation failed");
                    metrics.record_error(e.error_type());
                    report.errors += 1;
                }
            }
        }
    }

    async fn requeue(
        &self,
        document: &TrackedDocument,
        now: DateTime<Utc>,
        report: &mut CollectionReport,
    ) -> Result<(), AppError> {
        let collection = document.collection;
        let metrics = self.emitter.metrics();

        let claimed = self
            .store
            .claim_attempt(collection, &document.id, document.attempt_count, now)
            .await?;
        if !claimed {
            debug!(%collection, document_id = %document.id, "Claim lost to concurrent run");
            metrics.record_claim_conflict(collection);
            report.claim_conflicts += 1;
            return Ok(());
        }

        // The claim stands even if the publish fails; the next window retries.
        let topic = self.policies.topic_for(collection);
        let envelope = StageEvent::for_document(document).into_envelope(topic)?;
        publish_with_retry(self.bus.as_ref(), &envelope, &self.publish_retry).await?;

        metrics.record_requeued(collection);
        report.requeued += 1;
        info!(
            %collection,
            document_id = %document.id,
            attempt = document.attempt_count + 1,
            topic,
            "Requeued stuck document"
        );
        Ok(())
    }

    async fn escalate(
        &self,
        document: &TrackedDocument,
        now: DateTime<Utc>,
        report: &mut CollectionReport,
    ) -> Result<(), AppError> {
        let collection = document.collection;

        // Failed-queue entry first: if marking fails the next run pushes a
        // duplicate, never nothing.
        let topic = self.policies.topic_for(collection);
        let envelope = StageEvent::for_document(document).into_envelope(topic)?;
        self.operator.escalate(envelope, MAX_RETRIES_EXCEEDED_REASON).await?;

        if !self.store.mark_escalated(collection, &document.id, now).await? {
            debug!(%collection, document_id = %document.id, "Escalated concurrently by another run");
            return Ok(());
        }

        self.emitter.metrics().record_max_retries_exceeded(collection);
        report.escalated += 1;
        warn!(
            %collection,
            document_id = %document.id,
            attempts = document.attempt_count,
            "Document exhausted its retries"
        );
        Ok(())
    }

    /// Run on the configured interval until `shutdown` flips to true.
    pub async fn run_forever(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_secs = self.config.interval_secs, "Retry scheduler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Retry scheduler stopped");
    }
}
