//! Topic consumers.
//!
//! A consumer fetches one message at a time, hands it to a
//! [`MessageHandler`] and settles it according to the returned
//! [`HandlerOutcome`]. Handlers never return errors; broker errors while
//! fetching or settling are logged and the loop backs off for one poll
//! interval.
//!
//! Each consumer has its own ID and in-flight list. A [`ConsumerPool`] keeps
//! the consumer's lease alive and periodically recovers the messages of
//! consumers whose lease lapsed, so replicas can start and stop without
//! taking each other's work.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use mailpipe_common::{AppResult, BrokerConfig};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::MessageBus;
use crate::envelope::{Delivery, Envelope};

/// Reason recorded when a message is requeued too often.
pub const REDELIVERY_LIMIT_REASON: &str = "redelivery limit exceeded";

/// How a handled message is settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Done; remove the message.
    Ack,
    /// Transient failure; deliver again later.
    Requeue(String),
    /// Permanent failure; move to the failed queue.
    DeadLetter(String),
}

/// Per-topic message handler.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one message.
    async fn handle(&self, envelope: &Envelope) -> HandlerOutcome;
}

/// Consumer settings.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Requeues allowed before a message is dead-lettered.
    pub max_redeliveries: u32,
    /// Idle wait when the topic is empty or the broker failed.
    pub poll_interval: Duration,
    /// How long a consumer counts as alive after its last heartbeat.
    pub lease: Duration,
}

impl ConsumerConfig {
    /// Consumer settings from the broker section.
    #[must_use]
    pub const fn from_broker(config: &BrokerConfig) -> Self {
        Self {
            max_redeliveries: config.max_redeliveries,
            poll_interval: config.poll_interval(),
            lease: config.consumer_lease(),
        }
    }
}

/// Consumer of a single topic.
#[derive(Clone)]
pub struct Consumer {
    bus: Arc<dyn MessageBus>,
    topic: String,
    id: String,
    config: ConsumerConfig,
}

impl Consumer {
    /// Create a consumer of `topic` with a fresh ID.
    #[must_use]
    pub fn new(bus: Arc<dyn MessageBus>, topic: impl Into<String>, config: ConsumerConfig) -> Self {
        Self {
            bus,
            topic: topic.into(),
            id: Uuid::now_v7().to_string(),
            config,
        }
    }

    /// Topic consumed.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Consumer ID, naming its in-flight list. Clones share it.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Renew this consumer's lease.
    pub async fn heartbeat(&self) -> AppResult<()> {
        self.bus.heartbeat(&self.topic, &self.id, self.config.lease).await
    }

    /// Fetch and settle one message. Returns false when the topic was empty.
    pub async fn process_next(&self, handler: &dyn MessageHandler) -> AppResult<bool> {
        let Some(delivery) = self.bus.fetch(&self.topic, &self.id).await? else {
            return Ok(false);
        };

        let outcome = handler.handle(&delivery.envelope).await;
        self.settle(&delivery, outcome).await?;
        Ok(true)
    }

    async fn settle(&self, delivery: &Delivery, outcome: HandlerOutcome) -> AppResult<()> {
        let envelope = &delivery.envelope;
        match outcome {
            HandlerOutcome::Ack => {
                self.bus.ack(delivery).await?;
                debug!(topic = %self.topic, message_id = %envelope.id, "Message acknowledged");
            }
            HandlerOutcome::Requeue(reason) => {
                if envelope.delivery_count >= self.config.max_redeliveries {
                    warn!(
                        topic = %self.topic,
                        message_id = %envelope.id,
                        delivery_count = envelope.delivery_count,
                        last_error = %reason,
                        "Redelivery limit reached, dead-lettering"
                    );
                    self.bus.dead_letter(delivery, REDELIVERY_LIMIT_REASON).await?;
                } else {
                    debug!(
                        topic = %self.topic,
                        message_id = %envelope.id,
                        reason = %reason,
                        "Message requeued"
                    );
                    self.bus.requeue(delivery, &reason).await?;
                }
            }
            HandlerOutcome::DeadLetter(reason) => {
                warn!(
                    topic = %self.topic,
                    message_id = %envelope.id,
                    reason = %reason,
                    "Message dead-lettered"
                );
                self.bus.dead_letter(delivery, &reason).await?;
            }
        }
        Ok(())
    }

    /// Consume until `shutdown` flips to true.
    pub async fn run(self, handler: Arc<dyn MessageHandler>, mut shutdown: watch::Receiver<bool>) {
        info!(topic = %self.topic, "Consumer started");

        while !*shutdown.borrow() {
            let idle = match self.process_next(handler.as_ref()).await {
                Ok(handled) => !handled,
                Err(e) => {
                    error!(topic = %self.topic, error = %e, "Consumer broker error");
                    true
                }
            };

            if idle {
                tokio::select! {
                    () = tokio::time::sleep(self.config.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        info!(topic = %self.topic, "Consumer stopped");
    }

    /// Renew the lease and recover lapsed consumers until `shutdown` flips to true.
    async fn keep_alive(self, mut shutdown: watch::Receiver<bool>) {
        let period = (self.config.lease / 3).max(Duration::from_millis(10));
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The pool renewed the lease right before spawning us.
        ticker.tick().await;

        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.heartbeat().await {
                        warn!(topic = %self.topic, consumer = %self.id, error = %e, "Lease renewal failed");
                    }
                    if let Err(e) = self.bus.recover_in_flight(&self.topic).await {
                        warn!(topic = %self.topic, error = %e, "In-flight recovery failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

/// A pool of consumer workers on one topic.
pub struct ConsumerPool {
    handles: Vec<JoinHandle<()>>,
}

impl ConsumerPool {
    /// Take a lease, put back messages that crashed consumers left in flight,
    /// then spawn `workers` workers sharing `consumer`'s in-flight list.
    pub async fn subscribe(
        consumer: Consumer,
        handler: Arc<dyn MessageHandler>,
        workers: usize,
        shutdown: watch::Receiver<bool>,
    ) -> AppResult<Self> {
        consumer.heartbeat().await?;
        consumer.bus.recover_in_flight(&consumer.topic).await?;

        let topic = consumer.topic.clone();
        let id = consumer.id.clone();
        let mut handles: Vec<JoinHandle<()>> = (0..workers.max(1))
            .map(|_| {
                tokio::spawn(
                    consumer
                        .clone()
                        .run(Arc::clone(&handler), shutdown.clone()),
                )
            })
            .collect();
        handles.push(tokio::spawn(consumer.keep_alive(shutdown)));

        info!(topic = %topic, consumer = %id, workers, "Consumer pool started");
        Ok(Self { handles })
    }

    /// Wait for every worker to stop.
    pub async fn join(self) {
        for result in join_all(self.handles).await {
            if let Err(e) = result {
                error!(error = %e, "Consumer worker panicked");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::memory::MemoryBus;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    const TOPIC: &str = "archive.ingested";

    struct FixedHandler {
        outcome: HandlerOutcome,
        calls: AtomicU32,
    }

    impl FixedHandler {
        fn new(outcome: HandlerOutcome) -> Self {
            Self {
                outcome,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl MessageHandler for FixedHandler {
        async fn handle(&self, _envelope: &Envelope) -> HandlerOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome.clone()
        }
    }

    fn consumer(bus: &MemoryBus, max_redeliveries: u32) -> Consumer {
        Consumer::new(
            Arc::new(bus.clone()),
            TOPIC,
            ConsumerConfig {
                max_redeliveries,
                poll_interval: Duration::from_millis(10),
                lease: Duration::from_millis(300),
            },
        )
    }

    #[tokio::test]
    async fn test_ack_removes_message() {
        let bus = MemoryBus::new();
        bus.publish(&Envelope::new(TOPIC, json!({}))).await.unwrap();
        let handler = FixedHandler::new(HandlerOutcome::Ack);

        assert!(consumer(&bus, 3).process_next(&handler).await.unwrap());
        assert_eq!(bus.ready_len(TOPIC).await, 0);
        assert_eq!(bus.in_flight_len(TOPIC).await, 0);
        assert_eq!(bus.failed_len(TOPIC).await, 0);
    }

    #[tokio::test]
    async fn test_empty_topic() {
        let bus = MemoryBus::new();
        let handler = FixedHandler::new(HandlerOutcome::Ack);

        assert!(!consumer(&bus, 3).process_next(&handler).await.unwrap());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_requeue_until_redelivery_limit() {
        let bus = MemoryBus::new();
        bus.publish(&Envelope::new(TOPIC, json!({}))).await.unwrap();
        let handler = FixedHandler::new(HandlerOutcome::Requeue("store down".to_string()));
        let consumer = consumer(&bus, 2);

        // Initial delivery plus two redeliveries, then dead-lettered.
        for _ in 0..3 {
            assert!(consumer.process_next(&handler).await.unwrap());
        }

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(bus.ready_len(TOPIC).await, 0);
        let failed = bus.peek_failed(TOPIC, 10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].last_error.as_deref(), Some(REDELIVERY_LIMIT_REASON));
        assert_eq!(failed[0].delivery_count, 2);
    }

    #[tokio::test]
    async fn test_dead_letter_moves_to_failed_queue() {
        let bus = MemoryBus::new();
        bus.publish(&Envelope::new(TOPIC, json!({}))).await.unwrap();
        let handler = FixedHandler::new(HandlerOutcome::DeadLetter("malformed mbox".to_string()));

        consumer(&bus, 3).process_next(&handler).await.unwrap();

        let failed = bus.peek_failed(TOPIC, 10).await.unwrap();
        assert_eq!(failed[0].last_error.as_deref(), Some("malformed mbox"));
    }

    #[tokio::test]
    async fn test_pool_drains_and_stops_on_shutdown() {
        let bus = MemoryBus::new();
        for n in 0..5 {
            bus.publish(&Envelope::new(TOPIC, json!({"n": n}))).await.unwrap();
        }
        let handler = Arc::new(FixedHandler::new(HandlerOutcome::Ack));
        let (tx, rx) = watch::channel(false);

        let pool = ConsumerPool::subscribe(consumer(&bus, 3), handler.clone(), 2, rx)
            .await
            .unwrap();

        for _ in 0..100 {
            if handler.calls.load(Ordering::SeqCst) == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        pool.join().await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 5);
        assert_eq!(bus.ready_len(TOPIC).await, 0);
    }

    #[tokio::test]
    async fn test_new_pool_keeps_live_consumer_messages_in_flight() {
        let bus = MemoryBus::new();
        bus.publish(&Envelope::new(TOPIC, json!({"n": 1}))).await.unwrap();

        // A running replica holds the message while it works on it.
        let busy = consumer(&bus, 3);
        busy.heartbeat().await.unwrap();
        let held = bus.fetch(TOPIC, busy.id()).await.unwrap().unwrap();

        let handler = Arc::new(FixedHandler::new(HandlerOutcome::Ack));
        let (tx, rx) = watch::channel(false);
        let pool = ConsumerPool::subscribe(consumer(&bus, 3), handler.clone(), 1, rx)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        assert_eq!(bus.in_flight_len(TOPIC).await, 1);

        bus.ack(&held).await.unwrap();
        tx.send(true).unwrap();
        pool.join().await;
        assert_eq!(bus.in_flight_len(TOPIC).await, 0);
    }

    #[tokio::test]
    async fn test_pool_recovers_lapsed_consumer_messages() {
        let bus = MemoryBus::new();
        bus.publish(&Envelope::new(TOPIC, json!({"n": 1}))).await.unwrap();

        // Fetched by a replica that never heartbeats again.
        let crashed = consumer(&bus, 3);
        crashed.heartbeat().await.unwrap();
        bus.fetch(TOPIC, crashed.id()).await.unwrap().unwrap();

        let handler = Arc::new(FixedHandler::new(HandlerOutcome::Ack));
        let (tx, rx) = watch::channel(false);
        let pool = ConsumerPool::subscribe(consumer(&bus, 3), handler.clone(), 1, rx)
            .await
            .unwrap();

        for _ in 0..100 {
            if handler.calls.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        pool.join().await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(bus.in_flight_len(TOPIC).await, 0);
    }
}
