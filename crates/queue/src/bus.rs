//! Message bus capability.
//!
//! At-least-once delivery with explicit acknowledgement. A fetched message
//! stays in the fetching consumer's in-flight list until it is acked,
//! requeued or dead-lettered. Consumers hold a lease they renew with
//! [`MessageBus::heartbeat`]; once a lease lapses, the consumer is presumed
//! crashed and [`MessageBus::recover_in_flight`] puts its messages back. No
//! deduplication happens here.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mailpipe_common::{AppError, AppResult, BrokerBackend, BrokerConfig};
use tracing::info;

use crate::envelope::{Delivery, Envelope};
use crate::memory::MemoryBus;
use crate::redis::RedisBus;

/// Broker operations the reliability layer needs.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Append a message to its topic. Single attempt.
    async fn publish(&self, envelope: &Envelope) -> AppResult<()>;

    /// Claim the next message of `topic` into `consumer`'s in-flight list.
    ///
    /// The consumer should hold a lease, otherwise its in-flight messages
    /// count as abandoned.
    async fn fetch(&self, topic: &str, consumer: &str) -> AppResult<Option<Delivery>>;

    /// Drop an in-flight message after successful handling.
    async fn ack(&self, delivery: &Delivery) -> AppResult<()>;

    /// Hand an in-flight message back to its topic with `delivery_count + 1`.
    async fn requeue(&self, delivery: &Delivery, reason: &str) -> AppResult<()>;

    /// Move an in-flight message to the topic's failed queue.
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> AppResult<()>;

    /// Register `consumer` as alive on `topic` for `lease`.
    async fn heartbeat(&self, topic: &str, consumer: &str, lease: Duration) -> AppResult<()>;

    /// Put the in-flight messages of every `topic` consumer whose lease has
    /// lapsed back on the topic. Live consumers are left alone.
    async fn recover_in_flight(&self, topic: &str) -> AppResult<u64>;

    /// Append a message directly to the failed queue of its topic.
    async fn push_failed(&self, envelope: &Envelope) -> AppResult<()>;

    /// Up to `limit` failed messages of `topic`, oldest first, without removing them.
    async fn peek_failed(&self, topic: &str, limit: usize) -> AppResult<Vec<Envelope>>;

    /// Move up to `limit` failed messages back to `topic`, oldest first.
    async fn requeue_failed(&self, topic: &str, limit: usize) -> AppResult<u64>;

    /// Discard the failed queue of `topic`. Returns the number discarded.
    async fn purge_failed(&self, topic: &str) -> AppResult<u64>;
}

/// Build the bus selected by configuration.
pub async fn connect_bus(config: &BrokerConfig) -> AppResult<Arc<dyn MessageBus>> {
    match config.backend {
        BrokerBackend::Redis => {
            let bus = RedisBus::connect(config).await?;
            info!(prefix = %config.prefix, "Connected to Redis message bus");
            Ok(Arc::new(bus))
        }
        BrokerBackend::Memory => {
            info!("Using in-memory message bus");
            Ok(Arc::new(MemoryBus::new()))
        }
    }
}

/// Bound a broker operation by `limit`, mapping expiry to a transient error.
pub(crate) async fn bounded<T, F>(limit: Duration, operation: &str, fut: F) -> AppResult<T>
where
    F: Future<Output = AppResult<T>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| AppError::Timeout(format!("broker {operation} after {limit:?}")))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bounded_maps_expiry_to_timeout() {
        let result: AppResult<()> = bounded(Duration::from_millis(5), "publish", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(AppError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_connect_memory_bus() {
        let config = BrokerConfig {
            backend: BrokerBackend::Memory,
            ..BrokerConfig::default()
        };
        assert!(connect_bus(&config).await.is_ok());
    }
}
