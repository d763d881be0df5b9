//! Adds a partial unique index allowing at most one live job per config.

use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::{DatabaseBackend, Statement};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let backend = manager.get_database_backend();
        let sql = match backend {
            DatabaseBackend::Postgres => {
                "DO $$\nBEGIN\n    IF NOT EXISTS (\n        SELECT 1 FROM pg_indexes\n        WHERE schemaname = current_schema()\n          AND indexname = 'idx_issue_sync_jobs_active_config'\n    ) THEN\n        CREATE UNIQUE INDEX idx_issue_sync_jobs_active_config\n            ON issue_sync_jobs (config_id)\n            WHERE status IN ('pending','running');\n    END IF;\nEND\n$$;"
            }
            _ => {
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_issue_sync_jobs_active_config \
                 ON issue_sync_jobs (config_id) \
                 WHERE status IN ('pending','running')"
            }
        };

        manager
            .get_connection()
            .execute(Statement::from_string(backend, sql.to_string()))
            .await
            .map(|_| ())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "DROP INDEX IF EXISTS idx_issue_sync_jobs_active_config",
            ))
            .await
            .map(|_| ())
    }
}
