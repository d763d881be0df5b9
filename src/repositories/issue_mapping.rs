//! # Mapping Repository
//!
//! Source-to-target correlation rows for issues, comments and attachments.

use std::collections::HashMap;

use chrono::Utc;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, Set,
    TransactionTrait,
};
use uuid::Uuid;

use crate::error::to_db_time;
use crate::models::issue_mapping::{self, MappingStatus};
use crate::models::{AttachmentMapping, CommentMapping, IssueMapping, attachment_mapping, comment_mapping};

/// Fields of a freshly created (or adopted) target issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewIssueMapping {
    pub config_id: i32,
    pub source_issue_id: i64,
    pub source_issue_iid: i64,
    pub target_issue_id: i64,
    pub target_issue_iid: i64,
    pub source_content_hash: String,
    pub source_state: String,
}

/// A comment that was created or updated on the target during one issue's tail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentMappingChange {
    pub source_note_id: i64,
    pub target_note_id: i64,
    pub source_content_hash: String,
}

#[derive(Debug, Clone)]
pub struct MappingRepository {
    db: DatabaseConnection,
}

impl MappingRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn find_issue_mapping(
        &self,
        config_id: i32,
        source_issue_id: i64,
    ) -> Result<Option<issue_mapping::Model>, DbErr> {
        IssueMapping::find()
            .filter(issue_mapping::Column::ConfigId.eq(config_id))
            .filter(issue_mapping::Column::SourceIssueId.eq(source_issue_id))
            .one(&self.db)
            .await
    }

    pub async fn list_issue_mappings(&self, config_id: i32) -> Result<Vec<issue_mapping::Model>, DbErr> {
        IssueMapping::find()
            .filter(issue_mapping::Column::ConfigId.eq(config_id))
            .all(&self.db)
            .await
    }

    /// Insert a mapping in `pending` state.
    pub async fn insert_issue_mapping(&self, new: NewIssueMapping) -> Result<issue_mapping::Model, DbErr> {
        let now = to_db_time(Utc::now());
        issue_mapping::ActiveModel {
            id: Set(Uuid::new_v4()),
            config_id: Set(new.config_id),
            source_issue_id: Set(new.source_issue_id),
            source_issue_iid: Set(new.source_issue_iid),
            target_issue_id: Set(new.target_issue_id),
            target_issue_iid: Set(new.target_issue_iid),
            source_content_hash: Set(new.source_content_hash),
            source_state: Set(new.source_state),
            sync_status: Set(MappingStatus::Pending.as_str().to_string()),
            last_synced_at: Set(Some(now)),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&self.db)
        .await
    }

    /// Record the source content the target now reflects and reset the mapping to `pending`
    /// until its tail has run.
    pub async fn record_content(
        &self,
        mapping_id: Uuid,
        source_content_hash: &str,
        source_state: &str,
    ) -> Result<(), DbErr> {
        let now = to_db_time(Utc::now());
        IssueMapping::update_many()
            .col_expr(issue_mapping::Column::SourceContentHash, Expr::value(source_content_hash))
            .col_expr(issue_mapping::Column::SourceState, Expr::value(source_state))
            .col_expr(
                issue_mapping::Column::SyncStatus,
                Expr::value(MappingStatus::Pending.as_str()),
            )
            .col_expr(issue_mapping::Column::LastSyncedAt, Expr::value(Some(now)))
            .col_expr(issue_mapping::Column::UpdatedAt, Expr::value(now))
            .filter(issue_mapping::Column::Id.eq(mapping_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn set_status(&self, mapping_id: Uuid, status: MappingStatus) -> Result<(), DbErr> {
        let now = to_db_time(Utc::now());
        IssueMapping::update_many()
            .col_expr(issue_mapping::Column::SyncStatus, Expr::value(status.as_str()))
            .col_expr(issue_mapping::Column::UpdatedAt, Expr::value(now))
            .filter(issue_mapping::Column::Id.eq(mapping_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Point a mapping at a recreated target issue. Comment and attachment
    /// mappings referred to the deleted issue and are dropped with it.
    pub async fn repoint(
        &self,
        mapping_id: Uuid,
        target_issue_id: i64,
        target_issue_iid: i64,
    ) -> Result<(), DbErr> {
        let txn = self.db.begin().await?;
        CommentMapping::delete_many()
            .filter(comment_mapping::Column::IssueMappingId.eq(mapping_id))
            .exec(&txn)
            .await?;
        AttachmentMapping::delete_many()
            .filter(attachment_mapping::Column::IssueMappingId.eq(mapping_id))
            .exec(&txn)
            .await?;
        IssueMapping::update_many()
            .col_expr(issue_mapping::Column::TargetIssueId, Expr::value(target_issue_id))
            .col_expr(issue_mapping::Column::TargetIssueIid, Expr::value(target_issue_iid))
            .col_expr(
                issue_mapping::Column::SyncStatus,
                Expr::value(MappingStatus::Pending.as_str()),
            )
            .col_expr(issue_mapping::Column::UpdatedAt, Expr::value(to_db_time(Utc::now())))
            .filter(issue_mapping::Column::Id.eq(mapping_id))
            .exec(&txn)
            .await?;
        txn.commit().await
    }

    pub async fn delete_issue_mapping(&self, mapping_id: Uuid) -> Result<(), DbErr> {
        IssueMapping::delete_by_id(mapping_id).exec(&self.db).await?;
        Ok(())
    }

    /// Comment mappings of one issue keyed by source note id.
    pub async fn comment_mappings(
        &self,
        issue_mapping_id: Uuid,
    ) -> Result<HashMap<i64, comment_mapping::Model>, DbErr> {
        let rows = CommentMapping::find()
            .filter(comment_mapping::Column::IssueMappingId.eq(issue_mapping_id))
            .all(&self.db)
            .await?;
        Ok(rows.into_iter().map(|m| (m.source_note_id, m)).collect())
    }

    /// Upsert all comment mappings produced by one issue's comment pass in a single transaction.
    pub async fn save_comment_mappings(
        &self,
        issue_mapping_id: Uuid,
        changes: &[CommentMappingChange],
    ) -> Result<(), DbErr> {
        if changes.is_empty() {
            return Ok(());
        }

        let now = to_db_time(Utc::now());
        let txn = self.db.begin().await?;
        for change in changes {
            let row = comment_mapping::ActiveModel {
                id: Set(Uuid::new_v4()),
                issue_mapping_id: Set(issue_mapping_id),
                source_note_id: Set(change.source_note_id),
                target_note_id: Set(change.target_note_id),
                source_content_hash: Set(change.source_content_hash.clone()),
                last_synced_at: Set(now),
                created_at: Set(now),
            };
            CommentMapping::insert(row)
                .on_conflict(
                    OnConflict::columns([
                        comment_mapping::Column::IssueMappingId,
                        comment_mapping::Column::SourceNoteId,
                    ])
                    .update_columns([
                        comment_mapping::Column::TargetNoteId,
                        comment_mapping::Column::SourceContentHash,
                        comment_mapping::Column::LastSyncedAt,
                    ])
                    .to_owned(),
                )
                .exec_without_returning(&txn)
                .await?;
        }
        txn.commit().await
    }

    pub async fn find_attachment(
        &self,
        issue_mapping_id: Uuid,
        source_url: &str,
    ) -> Result<Option<attachment_mapping::Model>, DbErr> {
        AttachmentMapping::find()
            .filter(attachment_mapping::Column::IssueMappingId.eq(issue_mapping_id))
            .filter(attachment_mapping::Column::SourceUrl.eq(source_url))
            .one(&self.db)
            .await
    }

    pub async fn insert_attachment(
        &self,
        issue_mapping_id: Uuid,
        source_url: &str,
        target_url: &str,
        filename: &str,
        file_size: i64,
    ) -> Result<(), DbErr> {
        let row = attachment_mapping::ActiveModel {
            id: Set(Uuid::new_v4()),
            issue_mapping_id: Set(issue_mapping_id),
            source_url: Set(source_url.to_string()),
            target_url: Set(target_url.to_string()),
            filename: Set(filename.to_string()),
            file_size: Set(file_size),
            created_at: Set(to_db_time(Utc::now())),
        };
        AttachmentMapping::insert(row)
            .on_conflict(
                OnConflict::columns([
                    attachment_mapping::Column::IssueMappingId,
                    attachment_mapping::Column::SourceUrl,
                ])
                .update_columns([
                    attachment_mapping::Column::TargetUrl,
                    attachment_mapping::Column::Filename,
                    attachment_mapping::Column::FileSize,
                ])
                .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;
        Ok(())
    }
}
