//! Tracked document entity.
//!
//! One row per document of any pipeline collection, keyed by
//! `(collection, id)`.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use mailpipe_common::DocumentStatus;

/// Stored document status.
///
/// `Processing` is a legacy intermediate value still present in older rows.
/// It is read as pending and never written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum StoredStatus {
    /// Waiting for its stage to finish.
    #[sea_orm(string_value = "pending")]
    Pending,
    /// Legacy intermediate state.
    #[sea_orm(string_value = "processing")]
    Processing,
    /// Stage finished successfully.
    #[sea_orm(string_value = "completed")]
    Completed,
    /// Stage failed permanently.
    #[sea_orm(string_value = "failed")]
    Failed,
}

impl StoredStatus {
    /// Stored values that count as pending.
    pub const NON_TERMINAL: [Self; 2] = [Self::Pending, Self::Processing];
}

impl From<StoredStatus> for DocumentStatus {
    fn from(status: StoredStatus) -> Self {
        match status {
            StoredStatus::Pending | StoredStatus::Processing => Self::Pending,
            StoredStatus::Completed => Self::Completed,
            StoredStatus::Failed => Self::Failed,
        }
    }
}

impl From<DocumentStatus> for StoredStatus {
    fn from(status: DocumentStatus) -> Self {
        match status {
            DocumentStatus::Pending => Self::Pending,
            DocumentStatus::Completed => Self::Completed,
            DocumentStatus::Failed => Self::Failed,
        }
    }
}

/// A document tracked through the pipeline.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "tracked_document")]
pub struct Model {
    /// Collection name (`archive`, `message`, `chunk`, `thread`).
    #[sea_orm(primary_key, auto_increment = false)]
    pub collection: String,

    /// Document ID, unique within its collection.
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    /// Lifecycle status. Written by stage processors only.
    pub status: StoredStatus,

    /// Scheduler requeues so far. Written by the retry scheduler only.
    #[sea_orm(default_value = 0)]
    pub attempt_count: i32,

    /// Time of the last scheduler requeue.
    #[sea_orm(nullable)]
    pub last_attempt_time: Option<DateTimeUtc>,

    /// Time the scheduler escalated the exhausted document.
    #[sea_orm(nullable)]
    pub escalated_at: Option<DateTimeUtc>,

    /// Reason for a permanent failure.
    #[sea_orm(column_type = "Text", nullable)]
    pub failure_reason: Option<String>,

    /// Stage-owned routing data.
    #[sea_orm(column_type = "JsonBinary")]
    pub payload: Json,

    /// When this document was created.
    pub created_at: DateTimeUtc,

    /// When the lifecycle fields last changed.
    #[sea_orm(nullable)]
    pub updated_at: Option<DateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
