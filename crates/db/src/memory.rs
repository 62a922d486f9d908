//! Process-local document store.
//!
//! Holds documents in a map behind a `tokio` lock. Each conditional update
//! checks and writes under one write guard, which gives the same
//! compare-and-set semantics as the `PostgreSQL` store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mailpipe_common::{AppError, AppResult, Collection, DocumentStatus, TrackedDocument};
use tokio::sync::RwLock;

use crate::store::{DocumentStore, ScanCursor};

type Key = (Collection, String);

/// In-memory document store.
#[derive(Clone, Default)]
pub struct MemoryDocumentStore {
    documents: Arc<RwLock<HashMap<Key, TrackedDocument>>>,
}

impl MemoryDocumentStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents.
    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }

    /// Apply `update` to a pending document. Returns whether it matched.
    async fn update_pending<F>(&self, collection: Collection, id: &str, update: F) -> bool
    where
        F: FnOnce(&mut TrackedDocument) -> bool,
    {
        let mut documents = self.documents.write().await;
        match documents.get_mut(&(collection, id.to_string())) {
            Some(doc) if !doc.status.is_terminal() => update(doc),
            _ => false,
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn insert(&self, document: TrackedDocument) -> AppResult<()> {
        let mut documents = self.documents.write().await;
        let key = (document.collection, document.id.clone());
        if documents.contains_key(&key) {
            return Err(AppError::Conflict(format!(
                "{} document {} already exists",
                document.collection, document.id
            )));
        }
        documents.insert(key, document);
        Ok(())
    }

    async fn get(&self, collection: Collection, id: &str) -> AppResult<Option<TrackedDocument>> {
        let documents = self.documents.read().await;
        Ok(documents.get(&(collection, id.to_string())).cloned())
    }

    async fn find_pending(
        &self,
        collection: Collection,
        after: Option<&ScanCursor>,
        limit: u64,
    ) -> AppResult<Vec<TrackedDocument>> {
        let documents = self.documents.read().await;
        let mut pending: Vec<TrackedDocument> = documents
            .values()
            .filter(|doc| {
                doc.collection == collection
                    && doc.status == DocumentStatus::Pending
                    && doc.escalated_at.is_none()
                    && after.is_none_or(|cursor| cursor.precedes(doc))
            })
            .cloned()
            .collect();

        pending.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        pending.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(pending)
    }

    async fn count_exhausted(&self, collection: Collection, max_attempts: u32) -> AppResult<u64> {
        let documents = self.documents.read().await;
        let count = documents
            .values()
            .filter(|doc| {
                doc.collection == collection
                    && doc.status == DocumentStatus::Pending
                    && doc.attempt_count >= max_attempts
            })
            .count();
        Ok(count as u64)
    }

    async fn claim_attempt(
        &self,
        collection: Collection,
        id: &str,
        expected_attempt: u32,
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        Ok(self
            .update_pending(collection, id, |doc| {
                if doc.attempt_count != expected_attempt {
                    return false;
                }
                doc.attempt_count = expected_attempt.saturating_add(1);
                doc.last_attempt_time = Some(now);
                true
            })
            .await)
    }

    async fn mark_escalated(
        &self,
        collection: Collection,
        id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        Ok(self
            .update_pending(collection, id, |doc| {
                if doc.escalated_at.is_some() {
                    return false;
                }
                doc.escalated_at = Some(now);
                true
            })
            .await)
    }

    async fn mark_completed(&self, collection: Collection, id: &str) -> AppResult<bool> {
        Ok(self
            .update_pending(collection, id, |doc| {
                doc.status = DocumentStatus::Completed;
                true
            })
            .await)
    }

    async fn mark_failed(&self, collection: Collection, id: &str, reason: &str) -> AppResult<bool> {
        Ok(self
            .update_pending(collection, id, |doc| {
                doc.status = DocumentStatus::Failed;
                doc.failure_reason = Some(reason.to_string());
                true
            })
            .await)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn doc(id: &str, created_at: DateTime<Utc>) -> TrackedDocument {
        TrackedDocument::new(Collection::Message, id, json!({}), created_at)
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicate() {
        let store = MemoryDocumentStore::new();
        let now = Utc::now();

        store.insert(doc("m1", now)).await.unwrap();
        let err = store.insert(doc("m1", now)).await.unwrap_err();

        assert!(matches!(err, AppError::Conflict(_)));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_same_id_in_different_collections() {
        let store = MemoryDocumentStore::new();
        let now = Utc::now();

        store.insert(doc("x", now)).await.unwrap();
        store
            .insert(TrackedDocument::new(Collection::Chunk, "x", json!({}), now))
            .await
            .unwrap();

        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_claim_attempt_is_compare_and_set() {
        let store = MemoryDocumentStore::new();
        let now = Utc::now();
        store.insert(doc("m1", now)).await.unwrap();

        assert!(store.claim_attempt(Collection::Message, "m1", 0, now).await.unwrap());
        // Second claimant saw the same attempt count and loses.
        assert!(!store.claim_attempt(Collection::Message, "m1", 0, now).await.unwrap());

        let stored = store.get(Collection::Message, "m1").await.unwrap().unwrap();
        assert_eq!(stored.attempt_count, 1);
        assert_eq!(stored.last_attempt_time, Some(now));
    }

    #[tokio::test]
    async fn test_claim_attempt_skips_terminal_documents() {
        let store = MemoryDocumentStore::new();
        let now = Utc::now();
        store.insert(doc("m1", now)).await.unwrap();
        store.mark_completed(Collection::Message, "m1").await.unwrap();

        assert!(!store.claim_attempt(Collection::Message, "m1", 0, now).await.unwrap());
    }

    #[tokio::test]
    async fn test_terminal_status_is_sticky() {
        let store = MemoryDocumentStore::new();
        store.insert(doc("m1", Utc::now())).await.unwrap();

        assert!(store.mark_completed(Collection::Message, "m1").await.unwrap());
        assert!(!store.mark_failed(Collection::Message, "m1", "late").await.unwrap());

        let stored = store.get(Collection::Message, "m1").await.unwrap().unwrap();
        assert_eq!(stored.status, DocumentStatus::Completed);
        assert!(stored.failure_reason.is_none());
    }

    #[tokio::test]
    async fn test_mark_escalated_once() {
        let store = MemoryDocumentStore::new();
        let now = Utc::now();
        store.insert(doc("m1", now)).await.unwrap();

        assert!(store.mark_escalated(Collection::Message, "m1", now).await.unwrap());
        assert!(!store.mark_escalated(Collection::Message, "m1", now).await.unwrap());
    }

    #[tokio::test]
    async fn test_find_pending_pages_in_creation_order() {
        let store = MemoryDocumentStore::new();
        let now = Utc::now();
        store.insert(doc("attempted", now - Duration::hours(5))).await.unwrap();
        store.insert(doc("fresh", now)).await.unwrap();
        store.insert(doc("done", now - Duration::hours(2))).await.unwrap();
        store
            .claim_attempt(Collection::Message, "attempted", 0, now - Duration::hours(1))
            .await
            .unwrap();
        store.mark_completed(Collection::Message, "done").await.unwrap();

        let first = store.find_pending(Collection::Message, None, 1).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, "attempted");

        let cursor = ScanCursor::after(&first[0]);
        let second = store
            .find_pending(Collection::Message, Some(&cursor), 1)
            .await
            .unwrap();
        assert_eq!(second[0].id, "fresh");

        let cursor = ScanCursor::after(&second[0]);
        assert!(store
            .find_pending(Collection::Message, Some(&cursor), 1)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_find_pending_leaves_out_escalated() {
        let store = MemoryDocumentStore::new();
        let now = Utc::now();
        store.insert(doc("m1", now - Duration::days(3))).await.unwrap();
        store.insert(doc("m2", now)).await.unwrap();
        store.mark_escalated(Collection::Message, "m1", now).await.unwrap();

        let pending = store.find_pending(Collection::Message, None, 10).await.unwrap();
        let ids: Vec<&str> = pending.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["m2"]);
    }

    #[tokio::test]
    async fn test_count_exhausted_includes_escalated() {
        let store = MemoryDocumentStore::new();
        let now = Utc::now();
        for (id, attempts) in [("a", 3), ("b", 4), ("c", 2), ("d", 3)] {
            let mut d = doc(id, now);
            d.attempt_count = attempts;
            store.insert(d).await.unwrap();
        }
        store.mark_escalated(Collection::Message, "a", now).await.unwrap();
        store.mark_failed(Collection::Message, "d", "bad input").await.unwrap();

        assert_eq!(store.count_exhausted(Collection::Message, 3).await.unwrap(), 2);
        assert_eq!(store.count_exhausted(Collection::Chunk, 3).await.unwrap(), 0);
    }
}
