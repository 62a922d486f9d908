//! Idempotent stage processing.
//!
//! [`StageProcessor`] wraps a pipeline [`Stage`] into a [`MessageHandler`].
//! Redelivered events for documents that already reached a terminal status
//! are acknowledged without running the stage again. The terminal write is a
//! conditional update, so two deliveries racing on the same document settle
//! it exactly once.

use std::sync::Arc;

use async_trait::async_trait;
use mailpipe_common::{Collection, Metrics, ProcessOutcome, TrackedDocument};
use mailpipe_db::DocumentStore;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::consumer::{HandlerOutcome, MessageHandler};
use crate::envelope::{Envelope, StageEvent};

/// Reason used when an event references an unknown document.
pub const DOCUMENT_NOT_FOUND_REASON: &str = "document not found";

/// Stage failure classification.
#[derive(Debug, Error)]
pub enum StageError {
    /// Dependency unavailable; the same event may succeed later.
    #[error("transient stage failure: {0}")]
    Transient(String),

    /// The input can never be processed.
    #[error("permanent stage failure: {0}")]
    Permanent(String),
}

/// Business logic of one pipeline stage.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Collection whose documents this stage advances.
    fn collection(&self) -> Collection;

    /// Do the stage's work for `document`.
    async fn run(&self, document: &TrackedDocument, event: &StageEvent) -> Result<(), StageError>;
}

/// Message handler running a stage idempotently.
pub struct StageProcessor<S> {
    stage: S,
    store: Arc<dyn DocumentStore>,
    metrics: Arc<Metrics>,
}

impl<S: Stage> StageProcessor<S> {
    /// Create a processor.
    #[must_use]
    pub fn new(stage: S, store: Arc<dyn DocumentStore>, metrics: Arc<Metrics>) -> Self {
        Self {
            stage,
            store,
            metrics,
        }
    }

    /// The wrapped stage.
    #[must_use]
    pub const fn stage(&self) -> &S {
        &self.stage
    }

    async fn process(&self, envelope: &Envelope) -> HandlerOutcome {
        let collection = self.stage.collection();

        let event: StageEvent = match serde_json::from_value(envelope.payload.clone()) {
            Ok(event) => event,
            Err(e) => {
                return HandlerOutcome::DeadLetter(format!("unparseable stage event: {e}"));
            }
        };

        if event.collection != collection {
            return HandlerOutcome::DeadLetter(format!(
                "event for {} delivered to {collection} stage",
                event.collection
            ));
        }

        let document = match self.store.get(collection, &event.document_id).await {
            Ok(Some(document)) => document,
            Ok(None) => return HandlerOutcome::DeadLetter(DOCUMENT_NOT_FOUND_REASON.to_string()),
            Err(e) => return HandlerOutcome::Requeue(e.to_string()),
        };

        if document.status.is_terminal() {
            debug!(
                %collection,
                document_id = %document.id,
                status = document.status.as_str(),
                "Document already terminal, skipping"
            );
            return HandlerOutcome::Ack;
        }

        match self.stage.run(&document, &event).await {
            Ok(()) => match self.store.mark_completed(collection, &document.id).await {
                Ok(true) => {
                    info!(%collection, document_id = %document.id, "Document completed");
                    HandlerOutcome::Ack
                }
                Ok(false) => {
                    debug!(
                        %collection,
                        document_id = %document.id,
                        "Document settled by another delivery"
                    );
                    HandlerOutcome::Ack
                }
                Err(e) => HandlerOutcome::Requeue(e.to_string()),
            },
            Err(StageError::Transient(reason)) => {
                debug!(%collection, document_id = %document.id, %reason, "Transient stage failure");
                HandlerOutcome::Requeue(reason)
            }
            Err(StageError::Permanent(reason)) => {
                match self.store.mark_failed(collection, &document.id, &reason).await {
                    Ok(_) => {
                        warn!(%collection, document_id = %document.id, %reason, "Document failed");
                        HandlerOutcome::DeadLetter(reason)
                    }
                    Err(e) => HandlerOutcome::Requeue(e.to_string()),
                }
            }
        }
    }
}

#[async_trait]
impl<S: Stage> MessageHandler for StageProcessor<S> {
    async fn handle(&self, envelope: &Envelope) -> HandlerOutcome {
        let outcome = self.process(envelope).await;

        let recorded = match &outcome {
            HandlerOutcome::Ack => ProcessOutcome::Ack,
            HandlerOutcome::Requeue(_) => ProcessOutcome::Requeue,
            HandlerOutcome::DeadLetter(_) => ProcessOutcome::DeadLetter,
        };
        self.metrics.record_processed(self.stage.collection(), recorded);

        outcome
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mailpipe_common::{AppError, AppResult, DocumentStatus};
    use mailpipe_db::{MemoryDocumentStore, ScanCursor};
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Stage returning queued results, `Ok` once they run out.
    struct ScriptedStage {
        results: Mutex<Vec<Result<(), StageError>>>,
        runs: AtomicU32,
    }

    impl ScriptedStage {
        fn new(mut results: Vec<Result<(), StageError>>) -> Self {
            results.reverse();
            Self {
                results: Mutex::new(results),
                runs: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Stage for ScriptedStage {
        fn collection(&self) -> Collection {
            Collection::Chunk
        }

        async fn run(&self, _document: &TrackedDocument, _event: &StageEvent) -> Result<(), StageError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.results.lock().unwrap().pop().unwrap_or(Ok(()))
        }
    }

    async fn setup(stage: ScriptedStage) -> (StageProcessor<ScriptedStage>, MemoryDocumentStore, Arc<Metrics>) {
        let store = MemoryDocumentStore::new();
        store
            .insert(TrackedDocument::new(Collection::Chunk, "c1", json!({}), Utc::now()))
            .await
            .unwrap();
        let metrics = Arc::new(Metrics::new());
        let processor = StageProcessor::new(stage, Arc::new(store.clone()), metrics.clone());
        (processor, store, metrics)
    }

    fn event(document_id: &str) -> Envelope {
        StageEvent {
            collection: Collection::Chunk,
            document_id: document_id.to_string(),
            payload: json!({}),
        }
        .into_envelope("chunks.prepared")
        .unwrap()
    }

    #[tokio::test]
    async fn test_success_completes_and_acks() {
        let (processor, store, metrics) = setup(ScriptedStage::new(vec![])).await;

        assert_eq!(processor.handle(&event("c1")).await, HandlerOutcome::Ack);

        let doc = store.get(Collection::Chunk, "c1").await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Completed);
        assert_eq!(metrics.processed_total(Collection::Chunk, ProcessOutcome::Ack), 1);
    }

    #[tokio::test]
    async fn test_redelivery_after_completion_is_noop() {
        let (processor, store, _) = setup(ScriptedStage::new(vec![])).await;
        let envelope = event("c1");

        assert_eq!(processor.handle(&envelope).await, HandlerOutcome::Ack);
        assert_eq!(processor.handle(&envelope).await, HandlerOutcome::Ack);

        assert_eq!(processor.stage().runs.load(Ordering::SeqCst), 1);
        let doc = store.get(Collection::Chunk, "c1").await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Completed);
    }

    #[tokio::test]
    async fn test_transient_failure_leaves_attempts_untouched() {
        let (processor, store, metrics) =
            setup(ScriptedStage::new(vec![Err(StageError::Transient("embedder busy".into()))])).await;

        let outcome = processor.handle(&event("c1")).await;

        assert_eq!(outcome, HandlerOutcome::Requeue("embedder busy".to_string()));
        let doc = store.get(Collection::Chunk, "c1").await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Pending);
        assert_eq!(doc.attempt_count, 0);
        assert!(doc.last_attempt_time.is_none());
        assert_eq!(metrics.processed_total(Collection::Chunk, ProcessOutcome::Requeue), 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_marks_failed() {
        let (processor, store, _) =
            setup(ScriptedStage::new(vec![Err(StageError::Permanent("empty chunk".into()))])).await;

        let outcome = processor.handle(&event("c1")).await;

        assert_eq!(outcome, HandlerOutcome::DeadLetter("empty chunk".to_string()));
        let doc = store.get(Collection::Chunk, "c1").await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Failed);
        assert_eq!(doc.failure_reason.as_deref(), Some("empty chunk"));
    }

    #[tokio::test]
    async fn test_unknown_document_is_dead_lettered() {
        let (processor, _, _) = setup(ScriptedStage::new(vec![])).await;

        let outcome = processor.handle(&event("missing")).await;

        assert_eq!(outcome, HandlerOutcome::DeadLetter(DOCUMENT_NOT_FOUND_REASON.to_string()));
        assert_eq!(processor.stage().runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unparseable_payload_is_dead_lettered() {
        let (processor, _, metrics) = setup(ScriptedStage::new(vec![])).await;

        let outcome = processor
            .handle(&Envelope::new("chunks.prepared", json!({"garbage": true})))
            .await;

        assert!(matches!(outcome, HandlerOutcome::DeadLetter(_)));
        assert_eq!(metrics.processed_total(Collection::Chunk, ProcessOutcome::DeadLetter), 1);
    }

    struct UnavailableStore;

    #[async_trait]
    impl DocumentStore for UnavailableStore {
        async fn insert(&self, _document: TrackedDocument) -> AppResult<()> {
            Err(AppError::Database("connection refused".into()))
        }
        async fn get(&self, _c: Collection, _id: &str) -> AppResult<Option<TrackedDocument>> {
            Err(AppError::Timeout("document store get".into()))
        }
        async fn find_pending(
            &self,
            _c: Collection,
            _after: Option<&ScanCursor>,
            _limit: u64,
        ) -> AppResult<Vec<TrackedDocument>> {
            Err(AppError::Database("connection refused".into()))
        }
        async fn count_exhausted(&self, _c: Collection, _max_attempts: u32) -> AppResult<u64> {
            Err(AppError::Database("connection refused".into()))
        }
        async fn claim_attempt(
            &self,
            _c: Collection,
            _id: &str,
            _expected: u32,
            _now: chrono::DateTime<Utc>,
        ) -> AppResult<bool> {
            Err(AppError::Database("connection refused".into()))
        }
        async fn mark_escalated(
            &self,
            _c: Collection,
            _id: &str,
            _now: chrono::DateTime<Utc>,
        ) -> AppResult<bool> {
            Err(AppError::Database("connection refused".into()))
        }
        async fn mark_completed(&self, _c: Collection, _id: &str) -> AppResult<bool> {
            Err(AppError::Database("connection refused".into()))
        }
        async fn mark_failed(&self, _c: Collection, _id: &str, _reason: &str) -> AppResult<bool> {
            Err(AppError::Database("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_store_timeout_requeues() {
        let processor = StageProcessor::new(
            ScriptedStage::new(vec![]),
            Arc::new(UnavailableStore),
            Arc::new(Metrics::new()),
        );

        let outcome = processor.handle(&event("c1")).await;

        assert!(matches!(outcome, HandlerOutcome::Requeue(_)));
        assert_eq!(processor.stage().runs.load(Ordering::SeqCst), 0);
    }
}
