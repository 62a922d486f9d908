//! Database integration tests.
//!
//! These tests require a running `PostgreSQL` instance.
//! Run with: `cargo test -p mailpipe-db --features test-utils --test db_integration -- --ignored`
//!
//! Environment variables:
//!   `TEST_DB_HOST` (default: localhost)
//!   `TEST_DB_PORT` (default: 5433)
//!   `TEST_DB_USER` (default: `mailpipe_test`)
//!   `TEST_DB_PASSWORD` (default: `mailpipe_test`)
//!   `TEST_DB_NAME` (default: `mailpipe_test`)

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use mailpipe_common::{Collection, DocumentStatus, TrackedDocument};
use mailpipe_db::test_utils::{TestDatabase, TestDbConfig};
use mailpipe_db::{DocumentStore, ScanCursor, TrackedDocumentRepository};
use serde_json::json;

fn repository(db: &TestDatabase) -> TrackedDocumentRepository {
    TrackedDocumentRepository::new(Arc::new(db.connection().clone()), Duration::from_secs(5))
}

#[tokio::test]
#[ignore = "requires running PostgreSQL instance"]
async fn test_database_connection() {
    let config = TestDbConfig::default();
    let result = TestDatabase::with_config(config).await;
    assert!(result.is_ok(), "Failed to connect: {:?}", result.err());
}

#[tokio::test]
#[ignore = "requires running PostgreSQL instance"]
async fn test_insert_and_get_roundtrip() {
    let db = TestDatabase::create_unique().await.expect("Failed to create database");
    let repo = repository(&db);
    let created = Utc::now() - ChronoDuration::hours(2);

    repo.insert(TrackedDocument::new(
        Collection::Thread,
        "th-1",
        json!({"message_ids": ["m1", "m2"]}),
        created,
    ))
    .await
    .unwrap();

    let doc = repo.get(Collection::Thread, "th-1").await.unwrap().unwrap();
    assert_eq!(doc.status, DocumentStatus::Pending);
    assert_eq!(doc.attempt_count, 0);
    assert_eq!(doc.payload["message_ids"][1], "m2");

    db.drop_database().await.unwrap();
}

#[tokio::test]
#[ignore = "requires running PostgreSQL instance"]
async fn test_concurrent_claims_have_one_winner() {
    let db = TestDatabase::create_unique().await.expect("Failed to create database");
    let repo = repository(&db);
    repo.insert(TrackedDocument::new(Collection::Chunk, "c1", json!({}), Utc::now()))
        .await
        .unwrap();

    let now = Utc::now();
    let (a, b) = tokio::join!(
        repo.claim_attempt(Collection::Chunk, "c1", 0, now),
        repo.claim_attempt(Collection::Chunk, "c1", 0, now),
    );
    let winners = [a.unwrap(), b.unwrap()].iter().filter(|won| **won).count();
    assert_eq!(winners, 1);

    let doc = repo.get(Collection::Chunk, "c1").await.unwrap().unwrap();
    assert_eq!(doc.attempt_count, 1);

    db.drop_database().await.unwrap();
}

#[tokio::test]
#[ignore = "requires running PostgreSQL instance"]
async fn test_find_pending_pages_past_escalated_documents() {
    let db = TestDatabase::create_unique().await.expect("Failed to create database");
    let repo = repository(&db);
    let now = Utc::now();

    for (offset, id) in [(4, "escalated"), (3, "done"), (2, "live"), (1, "fresh")] {
        repo.insert(TrackedDocument::new(
            Collection::Message,
            id,
            json!({}),
            now - ChronoDuration::hours(offset),
        ))
        .await
        .unwrap();
    }
    repo.mark_escalated(Collection::Message, "escalated", now).await.unwrap();
    repo.mark_completed(Collection::Message, "done").await.unwrap();

    let first = repo.find_pending(Collection::Message, None, 1).await.unwrap();
    assert_eq!(first[0].id, "live");

    let cursor = ScanCursor::after(&first[0]);
    let second = repo
        .find_pending(Collection::Message, Some(&cursor), 1)
        .await
        .unwrap();
    assert_eq!(second[0].id, "fresh");

    repo.claim_attempt(Collection::Message, "escalated", 0, now).await.unwrap();
    repo.claim_attempt(Collection::Message, "escalated", 1, now).await.unwrap();
    assert_eq!(repo.count_exhausted(Collection::Message, 2).await.unwrap(), 1);

    db.drop_database().await.unwrap();
}

#[test]
fn test_config_from_env() {
    let config = TestDbConfig::default();
    assert!(!config.host.is_empty());
    assert!(config.port > 0);
    assert!(!config.username.is_empty());
    assert!(!config.database.is_empty());
}
