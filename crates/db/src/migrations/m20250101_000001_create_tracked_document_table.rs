//! Create tracked document table migration.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(TrackedDocument::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(TrackedDocument::Collection)
                            .string_len(16)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(TrackedDocument::Id)
                            .string_len(128)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(TrackedDocument::Status)
                            .string_len(16)
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(TrackedDocument::AttemptCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(TrackedDocument::LastAttemptTime).timestamp_with_time_zone())
                    .col(ColumnDef::new(TrackedDocument::EscalatedAt).timestamp_with_time_zone())
                    .col(ColumnDef::new(TrackedDocument::FailureReason).text())
                    .col(
                        ColumnDef::new(TrackedDocument::Payload)
                            .json_binary()
                            .not_null()
                            .default(Expr::cust("'{}'::jsonb")),
                    )
                    .col(
                        ColumnDef::new(TrackedDocument::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(ColumnDef::new(TrackedDocument::UpdatedAt).timestamp_with_time_zone())
                    .primary_key(
                        Index::create()
                            .col(TrackedDocument::Collection)
                            .col(TrackedDocument::Id),
                    )
                    .to_owned(),
            )
            .await?;

        // Index: (collection, status, last_attempt_time) (for the retry scan)
        manager
            .create_index(
                Index::create()
                    .name("idx_tracked_document_retry_scan")
                    .table(TrackedDocument::Table)
                    .col(TrackedDocument::Collection)
                    .col(TrackedDocument::Status)
                    .col(TrackedDocument::CreatedAt)
                    .col(TrackedDocument::Id)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(TrackedDocument::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum TrackedDocument {
    Table,
    Collection,
    Id,
    Status,
    AttemptCount,
    LastAttemptTime,
    EscalatedAt,
    FailureReason,
    Payload,
    CreatedAt,
    UpdatedAt,
}
