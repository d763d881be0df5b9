//! AttachmentMapping entity: a download/upload cache keyed by source URL.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "attachment_mappings")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub issue_mapping_id: Uuid,
    /// URL as it appears in the source description
    pub source_url: String,
    /// URL returned by the target upload endpoint
    pub target_url: String,
    pub filename: String,
    pub file_size: i64,
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::issue_mapping::Entity",
        from = "Column::IssueMappingId",
        to = "super::issue_mapping::Column::Id"
    )]
    IssueMapping,
}

impl Related<super::issue_mapping::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::IssueMapping.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
