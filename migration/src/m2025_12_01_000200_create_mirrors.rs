//! Creates `mirrors` and their per-mirror `mirror_issue_configs`.

use sea_orm_migration::prelude::*;

use crate::m2025_12_01_000100_create_gitlab_instances::InstancePairs;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Mirrors::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Mirrors::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Mirrors::InstancePairId).integer().not_null())
                    .col(
                        ColumnDef::new(Mirrors::SourceProjectId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Mirrors::SourceProjectPath).text().not_null())
                    .col(
                        ColumnDef::new(Mirrors::TargetProjectId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Mirrors::TargetProjectPath).text().not_null())
                    .col(
                        ColumnDef::new(Mirrors::Enabled)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(Mirrors::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Mirrors::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_mirrors_instance_pair_id")
                            .from(Mirrors::Table, Mirrors::InstancePairId)
                            .to(InstancePairs::Table, InstancePairs::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(MirrorIssueConfigs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(MirrorIssueConfigs::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(MirrorIssueConfigs::MirrorId)
                            .integer()
                            .not_null()
                            .unique_key(),
                    )
                    .col(flag(MirrorIssueConfigs::Enabled, true))
                    .col(flag(MirrorIssueConfigs::SyncComments, true))
                    .col(flag(MirrorIssueConfigs::SyncLabels, true))
                    .col(flag(MirrorIssueConfigs::SyncAttachments, true))
                    .col(flag(MirrorIssueConfigs::SyncWeight, true))
                    .col(flag(MirrorIssueConfigs::SyncTimeEstimate, true))
                    .col(flag(MirrorIssueConfigs::SyncTimeSpent, true))
                    .col(flag(MirrorIssueConfigs::SyncClosedIssues, false))
                    .col(flag(MirrorIssueConfigs::UpdateExisting, true))
                    .col(flag(MirrorIssueConfigs::SyncExistingIssues, false))
                    .col(
                        ColumnDef::new(MirrorIssueConfigs::SyncIntervalMinutes)
                            .integer()
                            .not_null()
                            .default(15),
                    )
                    .col(
                        ColumnDef::new(MirrorIssueConfigs::LastSyncAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(MirrorIssueConfigs::NextSyncAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(MirrorIssueConfigs::LastSyncStatus).text().null())
                    .col(ColumnDef::new(MirrorIssueConfigs::LastSyncError).text().null())
                    .col(
                        ColumnDef::new(MirrorIssueConfigs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(MirrorIssueConfigs::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_mirror_issue_configs_mirror_id")
                            .from(MirrorIssueConfigs::Table, MirrorIssueConfigs::MirrorId)
                            .to(Mirrors::Table, Mirrors::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Due-config scan
        manager
            .create_index(
                Index::create()
                    .name("idx_mirror_issue_configs_enabled_next_sync")
                    .table(MirrorIssueConfigs::Table)
                    .col(MirrorIssueConfigs::Enabled)
                    .col(MirrorIssueConfigs::NextSyncAt)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_mirror_issue_configs_enabled_next_sync")
                    .to_owned(),
            )
            .await?;
        manager
            .drop_table(Table::drop().table(MirrorIssueConfigs::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Mirrors::Table).to_owned())
            .await
    }
}

fn flag(column: MirrorIssueConfigs, default: bool) -> ColumnDef {
    ColumnDef::new(column)
        .boolean()
        .not_null()
        .default(default)
        .to_owned()
}

#[derive(DeriveIden)]
pub(crate) enum Mirrors {
    Table,
    Id,
    InstancePairId,
    SourceProjectId,
    SourceProjectPath,
    TargetProjectId,
    TargetProjectPath,
    Enabled,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
pub(crate) enum MirrorIssueConfigs {
    Table,
    Id,
    MirrorId,
    Enabled,
    SyncComments,
    SyncLabels,
    SyncAttachments,
    SyncWeight,
    SyncTimeEstimate,
    SyncTimeSpent,
    SyncClosedIssues,
    UpdateExisting,
    SyncExistingIssues,
    SyncIntervalMinutes,
    LastSyncAt,
    NextSyncAt,
    LastSyncStatus,
    LastSyncError,
    CreatedAt,
    UpdatedAt,
}
