//! Creates the issue, comment and attachment mapping tables.
//!
//! These rows are the durable sync checkpoint; each carries a unique guard on its
//! natural key so a replayed step cannot produce a second correlation.

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
                    .table(IssueMappings::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(IssueMappings::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(IssueMappings::ConfigId).integer().not_null())
                    .col(
                        ColumnDef::new(IssueMappings::SourceIssueId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(IssueMappings::SourceIssueIid)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(IssueMappings::TargetIssueId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(IssueMappings::TargetIssueIid)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(IssueMappings::SourceContentHash)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(IssueMappings::SourceState)
                            .text()
                            .not_null()
                            .default("opened"),
                    )
                    .col(
                        ColumnDef::new(IssueMappings::SyncStatus)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(IssueMappings::LastSyncedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(IssueMappings::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(IssueMappings::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_issue_mappings_config_id")
                            .from(IssueMappings::Table, IssueMappings::ConfigId)
                            .to(MirrorIssueConfigs::Table, MirrorIssueConfigs::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_issue_mappings_config_source_issue")
                    .table(IssueMappings::Table)
                    .col(IssueMappings::ConfigId)
                    .col(IssueMappings::SourceIssueId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(CommentMappings::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(CommentMappings::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(CommentMappings::IssueMappingId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(CommentMappings::SourceNoteId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(CommentMappings::TargetNoteId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(CommentMappings::SourceContentHash)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(CommentMappings::LastSyncedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(CommentMappings::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_comment_mappings_issue_mapping_id")
                            .from(CommentMappings::Table, CommentMappings::IssueMappingId)
                            .to(IssueMappings::Table, IssueMappings::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_comment_mappings_issue_note")
                    .table(CommentMappings::Table)
                    .col(CommentMappings::IssueMappingId)
                    .col(CommentMappings::SourceNoteId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(AttachmentMappings::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(AttachmentMappings::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(AttachmentMappings::IssueMappingId)
                            .uuid()
                            .not_null(),
                    )
                    .col(ColumnDef::new(AttachmentMappings::SourceUrl).text().not_null())
                    .col(ColumnDef::new(AttachmentMappings::TargetUrl).text().not_null())
                    .col(ColumnDef::new(AttachmentMappings::Filename).text().not_null())
                    .col(
                        ColumnDef::new(AttachmentMappings::FileSize)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(AttachmentMappings::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_attachment_mappings_issue_mapping_id")
                            .from(AttachmentMappings::Table, AttachmentMappings::IssueMappingId)
                            .to(IssueMappings::Table, IssueMappings::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_attachment_mappings_issue_url")
                    .table(AttachmentMappings::Table)
                    .col(AttachmentMappings::IssueMappingId)
                    .col(AttachmentMappings::SourceUrl)
                    .unique()
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        for index in [
            "idx_attachment_mappings_issue_url",
            "idx_comment_mappings_issue_note",
            "idx_issue_mappings_config_source_issue",
        ] {
            manager
                .drop_index(Index::drop().name(index).to_owned())
                .await?;
        }
        manager
            .drop_table(Table::drop().table(AttachmentMappings::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(CommentMappings::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(IssueMappings::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum IssueMappings {
    Table,
    Id,
    ConfigId,
    SourceIssueId,
    SourceIssueIid,
    TargetIssueId,
    TargetIssueIid,
    SourceContentHash,
    SourceState,
    SyncStatus,
    LastSyncedAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum CommentMappings {
    Table,
    Id,
    IssueMappingId,
    SourceNoteId,
    TargetNoteId,
    SourceContentHash,
    LastSyncedAt,
    CreatedAt,
}

#[derive(DeriveIden)]
enum AttachmentMappings {
    Table,
    Id,
    IssueMappingId,
    SourceUrl,
    TargetUrl,
    Filename,
    FileSize,
    CreatedAt,
}
