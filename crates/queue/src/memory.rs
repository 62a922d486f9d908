//! Process-local message bus for development and tests.
//!
//! Mirrors the Redis layout: per topic a work queue, one in-flight list per
//! consumer and a failed queue, all oldest first. Leases run on the `tokio`
//! clock, so paused-time tests can let them lapse.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mailpipe_common::AppResult;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::bus::MessageBus;
use crate::envelope::{Delivery, Envelope};

#[derive(Debug, Default)]
struct TopicQueues {
    ready: VecDeque<String>,
    in_flight: HashMap<String, Vec<String>>,
    leases: HashMap<String, Instant>,
    failed: VecDeque<String>,
}

impl TopicQueues {
    fn take_in_flight(&mut self, delivery: &Delivery) -> bool {
        let Some(entries) = self.in_flight.get_mut(&delivery.consumer) else {
            return false;
        };
        match entries.iter().position(|entry| *entry == delivery.raw) {
            Some(index) => {
                entries.remove(index);
                true
            }
            None => false,
        }
    }

    fn lease_lapsed(&self, consumer: &str, now: Instant) -> bool {
        self.leases.get(consumer).is_none_or(|expires| *expires <= now)
    }
}

/// In-memory message bus.
#[derive(Clone, Default)]
pub struct MemoryBus {
    topics: Arc<Mutex<HashMap<String, TopicQueues>>>,
}

impl MemoryBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages waiting on `topic`.
    pub async fn ready_len(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .await
            .get(topic)
            .map_or(0, |queues| queues.ready.len())
    }

    /// Messages of `topic` fetched but not yet settled.
    pub async fn in_flight_len(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .await
            .get(topic)
            .map_or(0, |queues| queues.in_flight.values().map(Vec::len).sum())
    }

    /// Messages in the failed queue of `topic`.
    pub async fn failed_len(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .await
            .get(topic)
            .map_or(0, |queues| queues.failed.len())
    }

    /// Waiting messages of `topic`, oldest first, without consuming them.
    pub async fn ready_messages(&self, topic: &str) -> AppResult<Vec<Envelope>> {
        let topics = self.topics.lock().await;
        topics
            .get(topic)
            .map(|queues| queues.ready.iter().map(|raw| Envelope::from_json(raw)).collect())
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, envelope: &Envelope) -> AppResult<()> {
        let raw = envelope.to_json()?;
        let mut topics = self.topics.lock().await;
        topics.entry(envelope.topic.clone()).or_default().ready.push_back(raw);
        debug!(topic = %envelope.topic, message_id = %envelope.id, "Published message");
        Ok(())
    }

    async fn fetch(&self, topic: &str, consumer: &str) -> AppResult<Option<Delivery>> {
        let mut topics = self.topics.lock().await;
        let Some(queues) = topics.get_mut(topic) else {
            return Ok(None);
        };
        let Some(raw) = queues.ready.pop_front() else {
            return Ok(None);
        };

        match Delivery::from_raw(raw.clone(), consumer) {
            Ok(delivery) => {
                queues.in_flight.entry(consumer.to_string()).or_default().push(raw);
                Ok(Some(delivery))
            }
            Err(_) => {
                queues.failed.push_back(raw);
                Ok(None)
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> AppResult<()> {
        let mut topics = self.topics.lock().await;
        if let Some(queues) = topics.get_mut(&delivery.envelope.topic) {
            queues.take_in_flight(delivery);
        }
        Ok(())
    }

    async fn requeue(&self, delivery: &Delivery, reason: &str) -> AppResult<()> {
        let mut next = delivery.envelope.clone();
        next.delivery_count = next.delivery_count.saturating_add(1);
        next.last_error = Some(reason.to_string());
        let raw = next.to_json()?;

        let mut topics = self.topics.lock().await;
        let queues = topics.entry(next.topic).or_default();
        queues.take_in_flight(delivery);
        queues.ready.push_back(raw);
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> AppResult<()> {
        let mut next = delivery.envelope.clone();
        next.last_error = Some(reason.to_string());
        let raw = next.to_json()?;

        let mut topics = self.topics.lock().await;
        let queues = topics.entry(next.topic).or_default();
        queues.take_in_flight(delivery);
        queues.failed.push_back(raw);
        Ok(())
    }

    async fn heartbeat(&self, topic: &str, consumer: &str, lease: Duration) -> AppResult<()> {
        let mut topics = self.topics.lock().await;
        topics
            .entry(topic.to_string())
            .or_default()
            .leases
            .insert(consumer.to_string(), Instant::now() + lease);
        Ok(())
    }

    async fn recover_in_flight(&self, topic: &str) -> AppResult<u64> {
        let mut topics = self.topics.lock().await;
        let Some(queues) = topics.get_mut(topic) else {
            return Ok(0);
        };

        let now = Instant::now();
        let lapsed: Vec<String> = queues
            .in_flight
            .keys()
            .filter(|consumer| queues.lease_lapsed(consumer, now))
            .cloned()
            .collect();

        let mut count = 0;
        for consumer in lapsed {
            queues.leases.remove(&consumer);
            let Some(entries) = queues.in_flight.remove(&consumer) else {
                continue;
            };
            count += entries.len() as u64;
            // Recovered messages are older than anything still waiting.
            for raw in entries.into_iter().rev() {
                queues.ready.push_front(raw);
            }
        }

        if count > 0 {
            info!(topic, recovered = count, "Recovered messages of lapsed consumers");
        }
        Ok(count)
    }

    async fn push_failed(&self, envelope: &Envelope) -> AppResult<()> {
        let raw = envelope.to_json()?;
        let mut topics = self.topics.lock().await;
        topics.entry(envelope.topic.clone()).or_default().failed.push_back(raw);
        Ok(())
    }

    async fn peek_failed(&self, topic: &str, limit: usize) -> AppResult<Vec<Envelope>> {
        let topics = self.topics.lock().await;
        let Some(queues) = topics.get(topic) else {
            return Ok(Vec::new());
        };

        Ok(queues
            .failed
            .iter()
            .take(limit)
            .filter_map(|raw| Envelope::from_json(raw).ok())
            .collect())
    }

    async fn requeue_failed(&self, topic: &str, limit: usize) -> AppResult<u64> {
        let mut topics = self.topics.lock().await;
        let Some(queues) = topics.get_mut(topic) else {
            return Ok(0);
        };

        let mut moved = 0;
        while moved < limit {
            let Some(raw) = queues.failed.pop_front() else {
                break;
            };
            let mut envelope = match Envelope::from_json(&raw) {
                Ok(envelope) => envelope,
                Err(e) => {
                    queues.failed.push_back(raw);
                    return Err(e);
                }
            };
            envelope.delivery_count = 0;
            envelope.last_error = None;
            queues.ready.push_back(envelope.to_json()?);
            moved += 1;
        }
        Ok(moved as u64)
    }

    async fn purge_failed(&self, topic: &str) -> AppResult<u64> {
        let mut topics = self.topics.lock().await;
        let Some(queues) = topics.get_mut(topic) else {
            return Ok(0);
        };
        let count = queues.failed.len() as u64;
        queues.failed.clear();
        Ok(count)
    }
}
