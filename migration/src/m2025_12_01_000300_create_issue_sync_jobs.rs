//! Creates the `issue_sync_jobs` table.
//!
//! The four project/instance columns are the keys conflict detection reasons over,
//! so they are indexed together with the status.

use sea_orm_migration::prelude::*;

use crate::m2025_12_01_000200_create_mirrors::MirrorIssueConfigs;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(IssueSyncJobs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(IssueSyncJobs::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(IssueSyncJobs::ConfigId).integer().not_null())
                    .col(ColumnDef::new(IssueSyncJobs::JobType).text().not_null())
                    .col(
                        ColumnDef::new(IssueSyncJobs::Status)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(IssueSyncJobs::SourceProjectId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(IssueSyncJobs::TargetProjectId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(IssueSyncJobs::SourceInstanceId)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(IssueSyncJobs::TargetInstanceId)
                            .integer()
                            .not_null(),
                    )
                    .col(counter(IssueSyncJobs::IssuesProcessed))
                    .col(counter(IssueSyncJobs::IssuesCreated))
                    .col(counter(IssueSyncJobs::IssuesUpdated))
                    .col(counter(IssueSyncJobs::IssuesSkipped))
                    .col(counter(IssueSyncJobs::IssuesFailed))
                    .col(ColumnDef::new(IssueSyncJobs::ErrorDetails).json_binary().null())
                    .col(
                        ColumnDef::new(IssueSyncJobs::StartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(IssueSyncJobs::CompletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(IssueSyncJobs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(IssueSyncJobs::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_issue_sync_jobs_config_id")
                            .from(IssueSyncJobs::Table, IssueSyncJobs::ConfigId)
                            .to(MirrorIssueConfigs::Table, MirrorIssueConfigs::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_issue_sync_jobs_conflict_keys")
                    .table(IssueSyncJobs::Table)
                    .col(IssueSyncJobs::SourceProjectId)
                    .col(IssueSyncJobs::TargetProjectId)
                    .col(IssueSyncJobs::SourceInstanceId)
                    .col(IssueSyncJobs::TargetInstanceId)
                    .col(IssueSyncJobs::Status)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_issue_sync_jobs_config_status")
                    .table(IssueSyncJobs::Table)
                    .col(IssueSyncJobs::ConfigId)
                    .col(IssueSyncJobs::Status)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_issue_sync_jobs_conflict_keys")
                    .to_owned(),
            )
            .await?;
        manager
            .drop_index(
                Index::drop()
                    .name("idx_issue_sync_jobs_config_status")
                    .to_owned(),
            )
            .await?;
        manager
            .drop_table(Table::drop().table(IssueSyncJobs::Table).to_owned())
            .await
    }
}

fn counter(column: IssueSyncJobs) -> ColumnDef {
    ColumnDef::new(column)
        .integer()
        .not_null()
        .default(0)
        .to_owned()
}

#[derive(DeriveIden)]
pub(crate) enum IssueSyncJobs {
    Table,
    Id,
    ConfigId,
    JobType,
    Status,
    SourceProjectId,
    TargetProjectId,
    SourceInstanceId,
    TargetInstanceId,
    IssuesProcessed,
    IssuesCreated,
    IssuesUpdated,
    IssuesSkipped,
    IssuesFailed,
    ErrorDetails,
    StartedAt,
    CompletedAt,
    CreatedAt,
    UpdatedAt,
}
