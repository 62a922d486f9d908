//! Wire format of bus messages.

use chrono::{DateTime, Utc};
use mailpipe_common::{AppResult, Collection, TrackedDocument};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Suffix appended to a topic to name its failed queue.
pub const FAILED_SUFFIX: &str = ".failed";

/// Name of the failed queue belonging to `topic`.
#[must_use]
pub fn failed_queue_name(topic: &str) -> String {
    format!("{topic}{FAILED_SUFFIX}")
}

/// Working topic for a queue name, accepting either `topic` or `topic.failed`.
#[must_use]
pub fn working_topic(queue: &str) -> &str {
    queue.strip_suffix(FAILED_SUFFIX).unwrap_or(queue)
}

/// A message on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Unique message ID.
    pub id: String,
    /// Topic the message belongs to.
    pub topic: String,
    /// Business event.
    pub payload: serde_json::Value,
    /// Times the message has been handed back for redelivery.
    #[serde(default)]
    pub delivery_count: u32,
    /// When the message was first published.
    pub published_at: DateTime<Utc>,
    /// Reason of the last requeue or dead-letter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Envelope {
    /// Create a fresh envelope.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            topic: topic.into(),
            payload,
            delivery_count: 0,
            published_at: Utc::now(),
            last_error: None,
        }
    }

    /// Serialize to the JSON stored by the broker.
    pub fn to_json(&self) -> AppResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse broker JSON.
    pub fn from_json(raw: &str) -> AppResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// A fetched message, together with the exact bytes the broker holds for it.
///
/// Acknowledging removes the in-flight entry by value, so the raw form must
/// be kept rather than re-serialized.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Decoded message.
    pub envelope: Envelope,
    /// Raw in-flight entry.
    pub raw: String,
    /// Consumer whose in-flight list holds the entry.
    pub consumer: String,
}

impl Delivery {
    /// Decode a raw entry fetched by `consumer`.
    pub fn from_raw(raw: String, consumer: &str) -> AppResult<Self> {
        Ok(Self {
            envelope: Envelope::from_json(&raw)?,
            raw,
            consumer: consumer.to_string(),
        })
    }
}

/// Event asking a stage to (re)process one document.
///
/// Only the fields the reliability layer inspects are typed; the stage's own
/// routing data travels in `payload`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageEvent {
    /// Collection of the referenced document.
    pub collection: Collection,
    /// Referenced document.
    pub document_id: String,
    /// Stage-owned routing data.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl StageEvent {
    /// Event re-driving `document` through its stage.
    #[must_use]
    pub fn for_document(document: &TrackedDocument) -> Self {
        Self {
            collection: document.collection,
            document_id: document.id.clone(),
            payload: document.payload.clone(),
        }
    }

    /// Wrap in an envelope for `topic`.
    pub fn into_envelope(self, topic: &str) -> AppResult<Envelope> {
        Ok(Envelope::new(topic, serde_json::to_value(self)?))
    }
}
