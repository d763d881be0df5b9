//! # MirrorIssueConfig Repository
//!
//! Scheduling columns (`next_sync_at`, `last_sync_*`) and the joined
//! [`MirrorContext`] a job unit is built from.

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ColumnTrait, Condition, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect,
};

use crate::error::to_db_time;
use crate::models::issue_sync_job::ConflictKeys;
use crate::models::mirror_issue_config::{Column, Entity, Model, SyncStatus};
use crate::models::{gitlab_instance, instance_pair, mirror};
use crate::models::{GitlabInstance, InstancePair, Mirror};

/// Everything a sync unit needs to know about one config.
#[derive(Debug, Clone, PartialEq)]
pub struct MirrorContext {
    pub config: Model,
    pub mirror: mirror::Model,
    pub pair: instance_pair::Model,
    pub source_instance: gitlab_instance::Model,
    pub target_instance: gitlab_instance::Model,
}

impl MirrorContext {
    pub fn conflict_keys(&self) -> ConflictKeys {
        ConflictKeys {
            source_project_id: self.mirror.source_project_id,
            target_project_id: self.mirror.target_project_id,
            source_instance_id: self.source_instance.id,
            target_instance_id: self.target_instance.id,
        }
    }

    /// Config and its mirror are both switched on.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled && self.mirror.enabled
    }
}

#[derive(Debug, Clone)]
pub struct MirrorIssueConfigRepository {
    db: DatabaseConnection,
}

impl MirrorIssueConfigRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn find_by_id(&self, config_id: i32) -> Result<Option<Model>, DbErr> {
        Entity::find_by_id(config_id).one(&self.db).await
    }

    /// Enabled configs whose `next_sync_at` is unset or not after `now`, oldest first.
    pub async fn find_due(&self, now: DateTime<Utc>, limit: u64) -> Result<Vec<Model>, DbErr> {
        Entity::find()
            .filter(Column::Enabled.eq(true))
            .filter(
                Condition::any()
                    .add(Column::NextSyncAt.is_null())
                    .add(Column::NextSyncAt.lte(to_db_time(now))),
            )
            .order_by_asc(Column::NextSyncAt)
            .order_by_asc(Column::Id)
            .limit(limit)
            .all(&self.db)
            .await
    }

    /// Resolve the mirror, pair and both instances. `Ok(None)` if any link is missing.
    ///
    /// Issues flow from the mirror's source project on the pair's source
    /// instance to its target project, whatever the repository mirror direction.
    pub async fn load_context(&self, config_id: i32) -> Result<Option<MirrorContext>, DbErr> {
        let Some(config) = self.find_by_id(config_id).await? else {
            return Ok(None);
        };
        let Some(mirror) = Mirror::find_by_id(config.mirror_id).one(&self.db).await? else {
            return Ok(None);
        };
        let Some(pair) = InstancePair::find_by_id(mirror.instance_pair_id)
            .one(&self.db)
            .await?
        else {
            return Ok(None);
        };
        let Some(source_instance) = GitlabInstance::find_by_id(pair.source_instance_id)
            .one(&self.db)
            .await?
        else {
            return Ok(None);
        };
        let Some(target_instance) = GitlabInstance::find_by_id(pair.target_instance_id)
            .one(&self.db)
            .await?
        else {
            return Ok(None);
        };

        Ok(Some(MirrorContext {
            config,
            mirror,
            pair,
            source_instance,
            target_instance,
        }))
    }

    /// Persist progress without touching `last_sync_status`.
    pub async fn checkpoint(&self, config_id: i32, last_sync_at: DateTime<Utc>) -> Result<(), DbErr> {
        Entity::update_many()
            .col_expr(Column::LastSyncAt, Expr::value(Some(to_db_time(last_sync_at))))
            .col_expr(Column::UpdatedAt, Expr::value(to_db_time(Utc::now())))
            .filter(Column::Id.eq(config_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Record the final status of a run and when the next one is due.
    pub async fn finalize(
        &self,
        config_id: i32,
        status: SyncStatus,
        error: Option<String>,
        next_sync_at: DateTime<Utc>,
    ) -> Result<(), DbErr> {
        Entity::update_many()
            .col_expr(Column::LastSyncStatus, Expr::value(Some(status.as_str().to_string())))
            .col_expr(Column::LastSyncError, Expr::value(error))
            .col_expr(Column::NextSyncAt, Expr::value(Some(to_db_time(next_sync_at))))
            .col_expr(Column::UpdatedAt, Expr::value(to_db_time(Utc::now())))
            .filter(Column::Id.eq(config_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn reschedule(&self, config_id: i32, next_sync_at: DateTime<Utc>) -> Result<(), DbErr> {
        Entity::update_many()
            .col_expr(Column::NextSyncAt, Expr::value(Some(to_db_time(next_sync_at))))
            .col_expr(Column::UpdatedAt, Expr::value(to_db_time(Utc::now())))
            .filter(Column::Id.eq(config_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }
}
