//! Mirror entity: a repository-level replication link between two projects.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "mirrors")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub instance_pair_id: i32,
    pub source_project_id: i64,
    /// Full path such as `group/project`
    pub source_project_path: String,
    pub target_project_id: i64,
    pub target_project_path: String,
    pub enabled: bool,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::instance_pair::Entity",
        from = "Column::InstancePairId",
        to = "super::instance_pair::Column::Id"
    )]
    InstancePair,
}

impl Related<super::instance_pair::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::InstancePair.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
