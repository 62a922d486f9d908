//! Redis message bus.
//!
//! Reliable-queue layout per topic:
//!
//! - `{prefix}:queue:{topic}`: work list, `LPUSH` on publish
//! - `{prefix}:processing:{topic}:{consumer}`: one in-flight list per
//!   consumer, filled by `RPOPLPUSH`
//! - `{prefix}:consumers:{topic}`: set of consumers that ever held a lease
//! - `{prefix}:lease:{topic}:{consumer}`: lease key, expires unless renewed
//! - `{prefix}:failed:{topic}`: failed queue
//!
//! Every list is consumed from the right, so the oldest entry comes first.
//! Moves between lists push before they remove: a crash in between
//! duplicates a message instead of losing it.

use std::time::Duration;

use async_trait::async_trait;
use fred::clients::Client;
use fred::error::Error as RedisError;
use fred::interfaces::{ClientLike, KeysInterface, ListInterface, SetsInterface};
use fred::types::Expiration;
use fred::types::config::Config as RedisConfig;
use mailpipe_common::{AppError, AppResult, BrokerConfig};
use tracing::{debug, info, warn};

use crate::bus::{MessageBus, bounded};
use crate::envelope::{Delivery, Envelope};

fn broker_error(e: &RedisError) -> AppError {
    AppError::Broker(e.to_string())
}

/// Message bus over Redis lists.
#[derive(Clone)]
pub struct RedisBus {
    client: Client,
    prefix: String,
    timeout: Duration,
}

impl RedisBus {
    /// Connect using the broker configuration.
    pub async fn connect(config: &BrokerConfig) -> AppResult<Self> {
        let redis_config = RedisConfig::from_url(&config.url).map_err(|e| broker_error(&e))?;
        let client = Client::new(redis_config, None, None, None);

        bounded(config.operation_timeout(), "connect", async {
            client.init().await.map_err(|e| broker_error(&e))
        })
        .await?;

        Ok(Self::with_client(client, &config.prefix, config.operation_timeout()))
    }

    /// Wrap an initialized client.
    #[must_use]
    pub fn with_client(client: Client, prefix: &str, timeout: Duration) -> Self {
        Self {
            client,
            prefix: prefix.to_string(),
            timeout,
        }
    }

    fn queue_key(&self, topic: &str) -> String {
        format!("{}:queue:{topic}", self.prefix)
    }

    fn processing_key(&self, topic: &str, consumer: &str) -> String {
        format!("{}:processing:{topic}:{consumer}", self.prefix)
    }

    fn consumers_key(&self, topic: &str) -> String {
        format!("{}:consumers:{topic}", self.prefix)
    }

    fn lease_key(&self, topic: &str, consumer: &str) -> String {
        format!("{}:lease:{topic}:{consumer}", self.prefix)
    }

    fn failed_key(&self, topic: &str) -> String {
        format!("{}:failed:{topic}", self.prefix)
    }

    async fn push(&self, key: String, raw: String, operation: &str) -> AppResult<()> {
        bounded(self.timeout, operation, async {
            let _: i64 = self
                .client
                .lpush(key, raw)
                .await
                .map_err(|e| broker_error(&e))?;
            Ok(())
        })
        .await
    }

    /// Remove one occurrence of `raw` from `key`, counting from the right.
    async fn remove(&self, key: String, raw: String, operation: &str) -> AppResult<bool> {
        let removed: i64 = bounded(self.timeout, operation, async {
            self.client
                .lrem(key, -1, raw)
                .await
                .map_err(|e| broker_error(&e))
        })
        .await?;
        Ok(removed > 0)
    }

    /// Push `next` to `key`, then remove the in-flight entry.
    async fn move_in_flight(
        &self,
        delivery: &Delivery,
        key: String,
        next: &Envelope,
        operation: &str,
    ) -> AppResult<()> {
        self.push(key, next.to_json()?, operation).await?;
        self.remove_in_flight(delivery, operation).await
    }

    async fn remove_in_flight(&self, delivery: &Delivery, operation: &str) -> AppResult<()> {
        let processing = self.processing_key(&delivery.envelope.topic, &delivery.consumer);
        if !self.remove(processing, delivery.raw.clone(), operation).await? {
            warn!(
                topic = %delivery.envelope.topic,
                message_id = %delivery.envelope.id,
                "In-flight entry already gone"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn publish(&self, envelope: &Envelope) -> AppResult<()> {
        self.push(self.queue_key(&envelope.topic), envelope.to_json()?, "publish")
            .await?;
        debug!(topic = %envelope.topic, message_id = %envelope.id, "Published message");
        Ok(())
    }

    async fn fetch(&self, topic: &str, consumer: &str) -> AppResult<Option<Delivery>> {
        let processing = self.processing_key(topic, consumer);
        let raw: Option<String> = bounded(self.timeout, "fetch", async {
            self.client
                .rpoplpush(self.queue_key(topic), processing.clone())
                .await
                .map_err(|e| broker_error(&e))
        })
        .await?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        match Delivery::from_raw(raw.clone(), consumer) {
            Ok(delivery) => Ok(Some(delivery)),
            Err(e) => {
                // Undecodable entries cannot be handled; park them in the failed queue.
                warn!(topic, error = %e, "Undecodable message moved to failed queue");
                self.push(self.failed_key(topic), raw.clone(), "fetch").await?;
                self.remove(processing, raw, "fetch").await?;
                Ok(None)
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> AppResult<()> {
        self.remove_in_flight(delivery, "ack").await
    }

    async fn requeue(&self, delivery: &Delivery, reason: &str) -> AppResult<()> {
        let mut next = delivery.envelope.clone();
        next.delivery_count = next.delivery_count.saturating_add(1);
        next.last_error = Some(reason.to_string());
        self.move_in_flight(delivery, self.queue_key(&next.topic), &next, "requeue")
            .await
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> AppResult<()> {
        let mut next = delivery.envelope.clone();
        next.last_error = Some(reason.to_string());
        self.move_in_flight(delivery, self.failed_key(&next.topic), &next, "dead_letter")
            .await
    }

    async fn heartbeat(&self, topic: &str, consumer: &str, lease: Duration) -> AppResult<()> {
        let lease_ms = i64::try_from(lease.as_millis()).unwrap_or(i64::MAX).max(1);
        bounded(self.timeout, "heartbeat", async {
            let _: i64 = self
                .client
                .sadd(self.consumers_key(topic), consumer)
                .await
                .map_err(|e| broker_error(&e))?;
            self.client
                .set::<(), _, _>(
                    self.lease_key(topic, consumer),
                    "1",
                    Some(Expiration::PX(lease_ms)),
                    None,
                    false,
                )
                .await
                .map_err(|e| broker_error(&e))
        })
        .await
    }

    async fn recover_in_flight(&self, topic: &str) -> AppResult<u64> {
        let consumers: Vec<String> = bounded(self.timeout, "recover_in_flight", async {
            self.client
                .smembers(self.consumers_key(topic))
                .await
                .map_err(|e| broker_error(&e))
        })
        .await?;

        let mut recovered = 0;
        for consumer in consumers {
            let alive: i64 = bounded(self.timeout, "recover_in_flight", async {
                self.client
                    .exists(self.lease_key(topic, &consumer))
                    .await
                    .map_err(|e| broker_error(&e))
            })
            .await?;
            if alive > 0 {
                continue;
            }

            let mut moved_from_consumer = 0;
            loop {
                let moved: Option<String> = bounded(self.timeout, "recover_in_flight", async {
                    self.client
                        .rpoplpush(self.processing_key(topic, &consumer), self.queue_key(topic))
                        .await
                        .map_err(|e| broker_error(&e))
                })
                .await?;
                if moved.is_none() {
                    break;
                }
                moved_from_consumer += 1;
            }

            let _: i64 = bounded(self.timeout, "recover_in_flight", async {
                self.client
                    .srem(self.consumers_key(topic), consumer.clone())
                    .await
                    .map_err(|e| broker_error(&e))
            })
            .await?;

            if moved_from_consumer > 0 {
                info!(topic, %consumer, recovered = moved_from_consumer, "Recovered messages of lapsed consumer");
            }
            recovered += moved_from_consumer;
        }

        Ok(recovered)
    }

    async fn push_failed(&self, envelope: &Envelope) -> AppResult<()> {
        self.push(self.failed_key(&envelope.topic), envelope.to_json()?, "push_failed")
            .await
    }

    async fn peek_failed(&self, topic: &str, limit: usize) -> AppResult<Vec<Envelope>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let stop = -i64::try_from(limit).unwrap_or(i64::MAX);
        let raw: Vec<String> = bounded(self.timeout, "peek_failed", async {
            self.client
                .lrange(self.failed_key(topic), stop, -1)
                .await
                .map_err(|e| broker_error(&e))
        })
        .await?;

        // LRANGE returns newest first from the left; the tail is the oldest.
        Ok(raw
            .iter()
            .rev()
            .filter_map(|entry| match Envelope::from_json(entry) {
                Ok(envelope) => Some(envelope),
                Err(e) => {
                    warn!(topic, error = %e, "Skipping undecodable failed message");
                    None
                }
            })
            .collect())
    }

    async fn requeue_failed(&self, topic: &str, limit: usize) -> AppResult<u64> {
        let failed = self.failed_key(topic);
        let mut moved = 0;
        while moved < limit {
            let oldest: Vec<String> = bounded(self.timeout, "requeue_failed", async {
                self.client
                    .lrange(failed.clone(), -1, -1)
                    .await
                    .map_err(|e| broker_error(&e))
            })
            .await?;

            let Some(raw) = oldest.into_iter().next() else {
                break;
            };

            let mut envelope = match Envelope::from_json(&raw) {
                Ok(envelope) => envelope,
                Err(e) => {
                    // Keep it for an operator, at the newest end so it is not hit again.
                    self.push(failed.clone(), raw.clone(), "requeue_failed").await?;
                    self.remove(failed.clone(), raw, "requeue_failed").await?;
                    return Err(e);
                }
            };
            envelope.delivery_count = 0;
            envelope.last_error = None;

            self.push(self.queue_key(topic), envelope.to_json()?, "requeue_failed")
                .await?;
            if !self.remove(failed.clone(), raw, "requeue_failed").await? {
                warn!(topic, message_id = %envelope.id, "Failed entry taken concurrently, requeued twice");
            }
            moved += 1;
        }

        Ok(moved as u64)
    }

    async fn purge_failed(&self, topic: &str) -> AppResult<u64> {
        let key = self.failed_key(topic);
        let count: u64 = bounded(self.timeout, "purge_failed", async {
            self.client
                .llen(key.clone())
                .await
                .map_err(|e| broker_error(&e))
        })
        .await?;

        let _: i64 = bounded(self.timeout, "purge_failed", async {
            self.client.del(key).await.map_err(|e| broker_error(&e))
        })
        .await?;

        Ok(count)
    }
}
