//! Tracked document repository.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mailpipe_common::{AppError, AppResult, Collection, TrackedDocument};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, DbErr, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, SqlErr,
};
use tracing::debug;

use crate::entities::tracked_document::{self, StoredStatus};
use crate::store::{DocumentStore, ScanCursor, with_timeout};

type Entity = tracked_document::Entity;
type Column = tracked_document::Column;

/// `PostgreSQL` document store.
#[derive(Clone)]
pub struct TrackedDocumentRepository {
    db: Arc<DatabaseConnection>,
    timeout: Duration,
}

impl TrackedDocumentRepository {
    /// Create a new repository. Every call is bounded by `timeout`.
    #[must_use]
    pub const fn new(db: Arc<DatabaseConnection>, timeout: Duration) -> Self {
        Self { db, timeout }
    }

    fn into_document(model: tracked_document::Model) -> AppResult<TrackedDocument> {
        Ok(TrackedDocument {
            collection: model.collection.parse()?,
            id: model.id,
            status: model.status.into(),
            attempt_count: u32::try_from(model.attempt_count).unwrap_or_default(),
            last_attempt_time: model.last_attempt_time,
            escalated_at: model.escalated_at,
            failure_reason: model.failure_reason,
            payload: model.payload,
            created_at: model.created_at,
        })
    }

    fn db_error(e: &DbErr) -> AppError {
        AppError::Database(e.to_string())
    }
}

#[async_trait]
impl DocumentStore for TrackedDocumentRepository {
    async fn insert(&self, document: TrackedDocument) -> AppResult<()> {
        let model = tracked_document::ActiveModel {
            collection: Set(document.collection.as_str().to_string()),
            id: Set(document.id.clone()),
            status: Set(document.status.into()),
            attempt_count: Set(i32::try_from(document.attempt_count).unwrap_or(i32::MAX)),
            last_attempt_time: Set(document.last_attempt_time),
            escalated_at: Set(document.escalated_at),
            failure_reason: Set(document.failure_reason),
            payload: Set(document.payload),
            created_at: Set(document.created_at),
            updated_at: Set(None),
        };

        with_timeout(self.timeout, "insert", async {
            model.insert(self.db.as_ref()).await.map_err(|e| {
                if matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) {
                    AppError::Conflict(format!(
                        "{} document {} already exists",
                        document.collection, document.id
                    ))
                } else {
                    Self::db_error(&e)
                }
            })
        })
        .await?;

        Ok(())
    }

    async fn get(&self, collection: Collection, id: &str) -> AppResult<Option<TrackedDocument>> {
        let model = with_timeout(self.timeout, "get", async {
            Entity::find_by_id((collection.as_str().to_string(), id.to_string()))
                .one(self.db.as_ref())
                .await
                .map_err(|e| Self::db_error(&e))
        })
        .await?;

        model.map(Self::into_document).transpose()
    }

    async fn find_pending(
        &self,
        collection: Collection,
        after: Option<&ScanCursor>,
        limit: u64,
    ) -> AppResult<Vec<TrackedDocument>> {
        let mut query = Entity::find()
            .filter(Column::Collection.eq(collection.as_str()))
            .filter(Column::Status.is_in(StoredStatus::NON_TERMINAL))
            .filter(Column::EscalatedAt.is_null());

        if let Some(cursor) = after {
            query = query.filter(
                Condition::any()
                    .add(Column::CreatedAt.gt(cursor.created_at))
                    .add(
                        Condition::all()
                            .add(Column::CreatedAt.eq(cursor.created_at))
                            .add(Column::Id.gt(cursor.id.as_str())),
                    ),
            );
        }

        let models = with_timeout(self.timeout, "find_pending", async {
            query
                .order_by_asc(Column::CreatedAt)
                .order_by_asc(Column::Id)
                .limit(limit)
                .all(self.db.as_ref())
                .await
                .map_err(|e| Self::db_error(&e))
        })
        .await?;

        debug!(%collection, count = models.len(), "Loaded pending documents");
        models.into_iter().map(Self::into_document).collect()
    }

    async fn count_exhausted(&self, collection: Collection, max_attempts: u32) -> AppResult<u64> {
        let threshold = i32::try_from(max_attempts).unwrap_or(i32::MAX);

        with_timeout(self.timeout, "count_exhausted", async {
            Entity::find()
                .filter(Column::Collection.eq(collection.as_str()))
                .filter(Column::Status.is_in(StoredStatus::NON_TERMINAL))
                .filter(Column::AttemptCount.gte(threshold))
                .count(self.db.as_ref())
                .await
                .map_err(|e| Self::db_error(&e))
        })
        .await
    }

    async fn claim_attempt(
        &self,
        collection: Collection,
        id: &str,
        expected_attempt: u32,
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        let expected = i32::try_from(expected_attempt)
            .map_err(|_| AppError::Validation(format!("attempt count {expected_attempt} out of range")))?;

        let result = with_timeout(self.timeout, "claim_attempt", async {
            Entity::update_many()
                .col_expr(Column::AttemptCount, Expr::value(expected.saturating_add(1)))
                .col_expr(Column::LastAttemptTime, Expr::value(now))
                .col_expr(Column::UpdatedAt, Expr::value(now))
                .filter(Column::Collection.eq(collection.as_str()))
                .filter(Column::Id.eq(id))
                .filter(Column::Status.is_in(StoredStatus::NON_TERMINAL))
                .filter(Column::AttemptCount.eq(expected))
                .exec(self.db.as_ref())
                .await
                .map_err(|e| Self::db_error(&e))
        })
        .await?;

        Ok(result.rows_affected > 0)
    }

    async fn mark_escalated(
        &self,
        collection: Collection,
        id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        let result = with_timeout(self.timeout, "mark_escalated", async {
            Entity::update_many()
                .col_expr(Column::EscalatedAt, Expr::value(now))
                .col_expr(Column::UpdatedAt, Expr::value(now))
                .filter(Column::Collection.eq(collection.as_str()))
                .filter(Column::Id.eq(id))
                .filter(Column::Status.is_in(StoredStatus::NON_TERMINAL))
                .filter(Column::EscalatedAt.is_null())
                .exec(self.db.as_ref())
                .await
                .map_err(|e| Self::db_error(&e))
        })
        .await?;

        Ok(result.rows_affected > 0)
    }

    async fn mark_completed(&self, collection: Collection, id: &str) -> AppResult<bool> {
        let result = with_timeout(self.timeout, "mark_completed", async {
            Entity::update_many()
                .col_expr(Column::Status, Expr::value(StoredStatus::Completed))
                .col_expr(Column::UpdatedAt, Expr::value(Utc::now()))
                .filter(Column::Collection.eq(collection.as_str()))
                .filter(Column::Id.eq(id))
                .filter(Column::Status.is_in(StoredStatus::NON_TERMINAL))
                .exec(self.db.as_ref())
                .await
                .map_err(|e| Self::db_error(&e))
        })
        .await?;

        Ok(result.rows_affected > 0)
    }

    async fn mark_failed(&self, collection: Collection, id: &str, reason: &str) -> AppResult<bool> {
        let result = with_timeout(self.timeout, "mark_failed", async {
            Entity::update_many()
                .col_expr(Column::Status, Expr::value(StoredStatus::Failed))
                .col_expr(Column::FailureReason, Expr::value(reason))
                .col_expr(Column::UpdatedAt, Expr::value(Utc::now()))
                .filter(Column::Collection.eq(collection.as_str()))
                .filter(Column::Id.eq(id))
                .filter(Column::Status.is_in(StoredStatus::NON_TERMINAL))
                .exec(self.db.as_ref())
                .await
                .map_err(|e| Self::db_error(&e))
        })
        .await?;

        Ok(result.rows_affected > 0)
    }
}
