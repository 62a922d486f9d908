//! Document store capability.
//!
//! Every lifecycle mutation is a single conditional update that reports
//! whether it matched. Callers never read-then-write, so concurrent
//! redeliveries and scheduler replicas cannot lose updates.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mailpipe_common::{AppError, AppResult, Collection, TrackedDocument};

/// Keyset position of a collection scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanCursor {
    /// Creation time of the last document seen.
    pub created_at: DateTime<Utc>,
    /// ID of the last document seen.
    pub id: String,
}

impl ScanCursor {
    /// Cursor positioned on `document`.
    #[must_use]
    pub fn after(document: &TrackedDocument) -> Self {
        Self {
            created_at: document.created_at,
            id: document.id.clone(),
        }
    }

    /// Whether `document` sorts strictly after this cursor.
    #[must_use]
    pub fn precedes(&self, document: &TrackedDocument) -> bool {
        (document.created_at, document.id.as_str()) > (self.created_at, self.id.as_str())
    }
}

/// Store of trackable documents across all pipeline collections.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert a new document.
    async fn insert(&self, document: TrackedDocument) -> AppResult<()>;

    /// Look up a document.
    async fn get(&self, collection: Collection, id: &str) -> AppResult<Option<TrackedDocument>>;

    /// One page of pending, not yet escalated documents of a collection.
    ///
    /// Ordered by `(created_at, id)` and starting strictly after `after`, so a
    /// caller pages through the whole collection by passing the cursor of the
    /// last document it saw. Neither key changes over a document's lifetime,
    /// so claims made while paging do not reorder later pages.
    async fn find_pending(
        &self,
        collection: Collection,
        after: Option<&ScanCursor>,
        limit: u64,
    ) -> AppResult<Vec<TrackedDocument>>;

    /// Count pending documents with at least `max_attempts` attempts,
    /// escalated or not.
    async fn count_exhausted(&self, collection: Collection, max_attempts: u32) -> AppResult<u64>;

    /// Claim a retry attempt.
    ///
    /// Sets `attempt_count = expected_attempt + 1` and `last_attempt_time = now`
    /// only if the document is still pending with `attempt_count ==
    /// expected_attempt`. Returns whether this caller won the claim.
    async fn claim_attempt(
        &self,
        collection: Collection,
        id: &str,
        expected_attempt: u32,
        now: DateTime<Utc>,
    ) -> AppResult<bool>;

    /// Record escalation of an exhausted document, once.
    ///
    /// Matches only pending documents not escalated before.
    async fn mark_escalated(
        &self,
        collection: Collection,
        id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<bool>;

    /// Transition pending → completed. Returns false if already terminal.
    async fn mark_completed(&self, collection: Collection, id: &str) -> AppResult<bool>;

    /// Transition pending → failed. Returns false if already terminal.
    async fn mark_failed(&self, collection: Collection, id: &str, reason: &str) -> AppResult<bool>;
}

/// Bound a store operation by `limit`, mapping expiry to a transient error.
pub async fn with_timeout<T, F>(limit: Duration, operation: &str, fut: F) -> AppResult<T>
where
    F: Future<Output = AppResult<T>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| AppError::Timeout(format!("document store {operation} after {limit:?}")))?
}
