//! Failed-queue operations.

use std::sync::Arc;

use mailpipe_common::AppResult;
use tracing::{info, warn};

use crate::bus::MessageBus;
use crate::envelope::{Envelope, failed_queue_name, working_topic};

/// Inspect, requeue and purge failed queues.
///
/// Queue arguments accept either the working topic (`json.parsed`) or the
/// failed queue name (`json.parsed.failed`).
#[derive(Clone)]
pub struct FailedQueueOperator {
    bus: Arc<dyn MessageBus>,
}

impl FailedQueueOperator {
    /// Create an operator over `bus`.
    #[must_use]
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self { bus }
    }

    /// Up to `limit` failed messages, oldest first. Non-destructive.
    pub async fn inspect(&self, queue: &str, limit: usize) -> AppResult<Vec<Envelope>> {
        let topic = working_topic(queue);
        let entries = self.bus.peek_failed(topic, limit).await?;
        info!(queue = %failed_queue_name(topic), count = entries.len(), "Inspected failed queue");
        Ok(entries)
    }

    /// Move up to `limit` failed messages back to their topic.
    pub async fn requeue(&self, queue: &str, limit: usize) -> AppResult<u64> {
        let topic = working_topic(queue);
        let moved = self.bus.requeue_failed(topic, limit).await?;
        info!(queue = %failed_queue_name(topic), moved, "Requeued failed messages");
        Ok(moved)
    }

    /// Discard every failed message. Irreversible.
    pub async fn purge(&self, queue: &str) -> AppResult<u64> {
        let topic = working_topic(queue);
        let purged = self.bus.purge_failed(topic).await?;
        warn!(queue = %failed_queue_name(topic), purged, "Purged failed queue");
        Ok(purged)
    }

    /// Park `envelope` in its topic's failed queue for operator attention.
    pub async fn escalate(&self, mut envelope: Envelope, reason: &str) -> AppResult<()> {
        envelope.last_error = Some(reason.to_string());
        self.bus.push_failed(&envelope).await?;
        warn!(
            queue = %failed_queue_name(&envelope.topic),
            message_id = %envelope.id,
            %reason,
            "Escalated to failed queue"
        );
        Ok(())
    }
}
