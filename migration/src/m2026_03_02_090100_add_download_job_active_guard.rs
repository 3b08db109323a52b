//! Adds a partial unique index allowing at most one active download per
//! (user, kind, source item).

use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::{DatabaseBackend, Statement};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let backend = manager.get_database_backend();
        match backend {
            DatabaseBackend::Postgres => {
                manager
                    .get_connection()
                    .execute(Statement::from_string(
                        backend,
                        "DO $$\nBEGIN\n    IF NOT EXISTS (\n        SELECT 1 FROM pg_indexes\n        WHERE schemaname = current_schema()\n          AND indexname = 'idx_download_jobs_active_source'\n    ) THEN\n        CREATE UNIQUE INDEX idx_download_jobs_active_source\n            ON download_jobs (user_id, kind, source_entity_id)\n            WHERE status IN ('PENDING','DOWNLOADING');\n    END IF;\nEND\n$$;"
                            .to_string(),
                    ))
                    .await
                    .map(|_| ())
            }
            _ => manager
                .get_connection()
                .execute(Statement::from_string(
                    backend,
                    "CREATE UNIQUE INDEX IF NOT EXISTS idx_download_jobs_active_source \
                     ON download_jobs (user_id, kind, source_entity_id) \
                     WHERE status IN ('PENDING','DOWNLOADING')"
                        .to_string(),
                ))
                .await
                .map(|_| ()),
        }
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "DROP INDEX IF EXISTS idx_download_jobs_active_source",
            ))
            .await
            .map(|_| ())
    }
}
