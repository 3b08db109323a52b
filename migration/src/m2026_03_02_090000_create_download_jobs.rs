//! Migration to create the download_jobs table.
//!
//! One row per user request to materialize remote media locally. Rows are
//! user-scoped and carry the job status, byte progress, attempt bookkeeping
//! and the final file location.

use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::Statement;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(DownloadJobs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(DownloadJobs::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(DownloadJobs::UserId).text().not_null())
                    .col(ColumnDef::new(DownloadJobs::Kind).text().not_null())
                    .col(
                        ColumnDef::new(DownloadJobs::SourceEntityId)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(DownloadJobs::SourceEntityIds)
                            .json_binary()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(DownloadJobs::Status)
                            .text()
                            .not_null()
                            .default("PENDING"),
                    )
                    .col(
                        ColumnDef::new(DownloadJobs::ProgressBytes)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(DownloadJobs::TotalBytes).big_integer().null())
                    .col(
                        ColumnDef::new(DownloadJobs::ItemsTotal)
                            .integer()
                            .not_null()
                            .default(1),
                    )
                    .col(
                        ColumnDef::new(DownloadJobs::ItemsCompleted)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(DownloadJobs::Attempt)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(DownloadJobs::MaxAttempts)
                            .integer()
                            .not_null()
                            .default(3),
                    )
                    .col(ColumnDef::new(DownloadJobs::FilePath).text().null())
                    .col(ColumnDef::new(DownloadJobs::ErrorMessage).text().null())
                    .col(ColumnDef::new(DownloadJobs::ErrorKind).text().null())
                    .col(
                        ColumnDef::new(DownloadJobs::RetryAfter)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(DownloadJobs::StartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(DownloadJobs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(DownloadJobs::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(DownloadJobs::CompletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        // Dispatcher scan: oldest eligible pending job first
        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "CREATE INDEX IF NOT EXISTS idx_download_jobs_status_retry_created ON download_jobs (status, retry_after, created_at)".to_string(),
            ))
            .await?;

        // Per-user listing, newest first
        manager
            .create_index(
                Index::create()
                    .name("idx_download_jobs_user_created")
                    .table(DownloadJobs::Table)
                    .col(DownloadJobs::UserId)
                    .col(DownloadJobs::CreatedAt)
                    .to_owned(),
            )
            .await?;

        // Retention sweep over terminal rows
        manager
            .create_index(
                Index::create()
                    .name("idx_download_jobs_status_updated")
                    .table(DownloadJobs::Table)
                    .col(DownloadJobs::Status)
                    .col(DownloadJobs::UpdatedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_download_jobs_status_retry_created")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_download_jobs_user_created")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_download_jobs_status_updated")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(DownloadJobs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum DownloadJobs {
    Table,
    Id,
    UserId,
    Kind,
    SourceEntityId,
    SourceEntityIds,
    Status,
    ProgressBytes,
    TotalBytes,
    ItemsTotal,
    ItemsCompleted,
    Attempt,
    MaxAttempts,
    FilePath,
    ErrorMessage,
    ErrorKind,
    RetryAfter,
    StartedAt,
    CreatedAt,
    UpdatedAt,
    CompletedAt,
}
