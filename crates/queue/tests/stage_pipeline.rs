//! Consumer, processor and scheduler working together on the in-memory backends.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use mailpipe_common::{
    Collection, DocumentStatus, Metrics, MetricsEmitter, ProcessOutcome, RetryPolicyTable,
    SchedulerConfig, TrackedDocument,
};
use mailpipe_db::{DocumentStore, MemoryDocumentStore};
use mailpipe_queue::{
    Consumer, ConsumerConfig, MemoryBus, MessageBus, RetryConfig, RetryScheduler, Stage,
    StageError, StageEvent, StageProcessor,
};
use serde_json::json;

const TOPIC: &str = "json.parsed";

/// Fails transiently the first `failures` times, then succeeds.
struct FlakyParser {
    failures: u32,
    runs: Arc<AtomicU32>,
}

#[async_trait]
impl Stage for FlakyParser {
    fn collection(&self) -> Collection {
        Collection::Message
    }

    async fn run(&self, _document: &TrackedDocument, _event: &StageEvent) -> Result<(), StageError> {
        let run = self.runs.fetch_add(1, Ordering::SeqCst);
        if run < self.failures {
            Err(StageError::Transient("parser backend unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

fn consumer(bus: &MemoryBus) -> Consumer {
    Consumer::new(
        Arc::new(bus.clone()),
        TOPIC,
        ConsumerConfig {
            max_redeliveries: 5,
            poll_interval: Duration::from_millis(5),
            lease: Duration::from_secs(1),
        },
    )
}

#[tokio::test]
async fn test_transient_failure_is_redelivered_until_completed() {
    let store = MemoryDocumentStore::new();
    let bus = MemoryBus::new();
    let metrics = Arc::new(Metrics::new());
    let runs = Arc::new(AtomicU32::new(0));

    store
        .insert(TrackedDocument::new(Collection::Message, "m1", json!({}), Utc::now()))
        .await
        .unwrap();
    let event = StageEvent {
        collection: Collection::Message,
        document_id: "m1".to_string(),
        payload: json!({}),
    };
    bus.publish(&event.into_envelope(TOPIC).unwrap()).await.unwrap();

    let processor = StageProcessor::new(
        FlakyParser {
            failures: 2,
            runs: runs.clone(),
        },
        Arc::new(store.clone()),
        metrics.clone(),
    );
    let consumer = consumer(&bus);

    while consumer.process_next(&processor).await.unwrap() {}

    assert_eq!(runs.load(Ordering::SeqCst), 3);
    let doc = store.get(Collection::Message, "m1").await.unwrap().unwrap();
    assert_eq!(doc.status, DocumentStatus::Completed);
    // Broker redeliveries never touch scheduler-owned fields.
    assert_eq!(doc.attempt_count, 0);
    assert_eq!(metrics.processed_total(Collection::Message, ProcessOutcome::Requeue), 2);
    assert_eq!(metrics.processed_total(Collection::Message, ProcessOutcome::Ack), 1);
}

#[tokio::test]
async fn test_scheduler_requeue_reaches_stage_once() {
    let store = MemoryDocumentStore::new();
    let bus = MemoryBus::new();
    let metrics = Arc::new(Metrics::new());
    let runs = Arc::new(AtomicU32::new(0));

    // Event was lost upstream; the document sits pending for two days.
    store
        .insert(TrackedDocument::new(
            Collection::Message,
            "m1",
            json!({}),
            Utc::now() - TimeDelta::days(2),
        ))
        .await
        .unwrap();

    let scheduler = RetryScheduler::new(
        Arc::new(store.clone()),
        Arc::new(bus.clone()),
        MetricsEmitter::noop(metrics.clone()),
        RetryPolicyTable::default(),
        SchedulerConfig::default(),
        RetryConfig::default(),
    );
    scheduler.run_once().await;

    // A crashed consumer would see the same event twice.
    let published = bus.ready_messages(TOPIC).await.unwrap();
    bus.publish(&published[0]).await.unwrap();

    let processor = StageProcessor::new(
        FlakyParser {
            failures: 0,
            runs: runs.clone(),
        },
        Arc::new(store.clone()),
        metrics.clone(),
    );
    let consumer = consumer(&bus);
    while consumer.process_next(&processor).await.unwrap() {}

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    let doc = store.get(Collection::Message, "m1").await.unwrap().unwrap();
    assert_eq!(doc.status, DocumentStatus::Completed);
    assert_eq!(doc.attempt_count, 1);
    assert_eq!(metrics.processed_total(Collection::Message, ProcessOutcome::Ack), 2);
}
