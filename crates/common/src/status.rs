//! Document lifecycle model shared by every pipeline collection.
//!
//! Each collection (archives, messages, chunks, threads) stores its documents
//! with the same lifecycle fields. Stage processors own `status`; the retry
//! scheduler owns `attempt_count`, `last_attempt_time` and `escalated_at`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Pipeline collection a document belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    /// Raw mailing-list archives awaiting parsing.
    Archive,
    /// Parsed messages awaiting chunking.
    Message,
    /// Message chunks awaiting embedding.
    Chunk,
    /// Threads awaiting summarization.
    Thread,
}

impl Collection {
    /// All collections, in pipeline order.
    pub const ALL: [Self; 4] = [Self::Archive, Self::Message, Self::Chunk, Self::Thread];

    /// Storage/label name of the collection.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Archive => "archive",
            Self::Message => "message",
            Self::Chunk => "chunk",
            Self::Thread => "thread",
        }
    }

    /// Topic whose consumer advances documents of this collection.
    #[must_use]
    pub const fn default_topic(self) -> &'static str {
        match self {
            Self::Archive => "archive.ingested",
            Self::Message => "json.parsed",
            Self::Chunk => "chunks.prepared",
            Self::Thread => "summarization.requested",
        }
    }

    pub(crate) const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Collection {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "archive" | "archives" => Ok(Self::Archive),
            "message" | "messages" => Ok(Self::Message),
            "chunk" | "chunks" => Ok(Self::Chunk),
            "thread" | "threads" => Ok(Self::Thread),
            other => Err(AppError::Validation(format!("unknown collection: {other}"))),
        }
    }
}

/// Canonical document status.
///
/// Only these three values are ever written. The legacy intermediate value is
/// folded into [`DocumentStatus::Pending`] by the store layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    /// Work not yet finished.
    Pending,
    /// Terminal success.
    Completed,
    /// Terminal permanent failure.
    Failed,
}

impl DocumentStatus {
    /// Whether no further lifecycle writes may happen.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Storage name of the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Lifecycle view of a document in any collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedDocument {
    /// Collection the document belongs to.
    pub collection: Collection,
    /// Opaque identifier, stable for the document's lifetime.
    pub id: String,
    /// Current status.
    pub status: DocumentStatus,
    /// Number of scheduler-initiated retries so far.
    pub attempt_count: u32,
    /// When the scheduler last requeued the document.
    pub last_attempt_time: Option<DateTime<Utc>>,
    /// When the scheduler escalated the document after exhausting retries.
    pub escalated_at: Option<DateTime<Utc>>,
    /// Reason recorded by the processor on permanent failure.
    pub failure_reason: Option<String>,
    /// Stage-owned routing data, republished with requeued events.
    pub payload: serde_json::Value,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl TrackedDocument {
    /// Create a fresh pending document.
    #[must_use]
    pub fn new(
        collection: Collection,
        id: impl Into<String>,
        payload: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            collection,
            id: id.into(),
            status: DocumentStatus::Pending,
            attempt_count: 0,
            last_attempt_time: None,
            escalated_at: None,
            failure_reason: None,
            payload,
            created_at,
        }
    }

    /// Whether the document is pending with its retry budget used up.
    #[must_use]
    pub fn is_exhausted(&self, max_attempts: u32) -> bool {
        self.status == DocumentStatus::Pending && self.attempt_count >= max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_parse_accepts_plural() {
        assert_eq!("archives".parse::<Collection>().unwrap(), Collection::Archive);
        assert_eq!("chunk".parse::<Collection>().unwrap(), Collection::Chunk);
        assert!("reports".parse::<Collection>().is_err());
    }

    #[test]
    fn test_collection_indices_are_dense() {
        for (i, c) in Collection::ALL.iter().enumerate() {
            assert_eq!(c.index(), i);
        }
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!DocumentStatus::Pending.is_terminal());
        assert!(DocumentStatus::Completed.is_terminal());
        assert!(DocumentStatus::Failed.is_terminal());
    }

    #[test]
    fn test_new_document_has_no_attempts() {
        let doc = TrackedDocument::new(
            Collection::Message,
            "msg-1",
            serde_json::json!({"archive_id": "a1"}),
            Utc::now(),
        );
        assert_eq!(doc.status, DocumentStatus::Pending);
        assert_eq!(doc.attempt_count, 0);
        assert!(doc.last_attempt_time.is_none());
        assert!(!doc.is_exhausted(3));
    }

    #[test]
    fn test_serialization_uses_camel_case() {
        let doc = TrackedDocument::new(Collection::Chunk, "c1", serde_json::Value::Null, Utc::now());
        let json = serde_json::to_string(&doc).unwrap();
        assert!(json.contains("\"attemptCount\":0"));
        assert!(json.contains("\"collection\":\"chunk\""));
    }
}
