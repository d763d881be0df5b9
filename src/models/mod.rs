//! # Data Models
//!
//! SeaORM entities for mirrors, their issue-sync policy, sync jobs and the
//! mapping rows that act as the durable sync checkpoint.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod attachment_mapping;
pub mod comment_mapping;
pub mod gitlab_instance;
pub mod instance_pair;
pub mod issue_mapping;
pub mod issue_sync_job;
pub mod mirror;
pub mod mirror_issue_config;

pub use attachment_mapping::Entity as AttachmentMapping;
pub use comment_mapping::Entity as CommentMapping;
pub use gitlab_instance::Entity as GitlabInstance;
pub use instance_pair::Entity as InstancePair;
pub use issue_mapping::Entity as IssueMapping;
pub use issue_sync_job::Entity as IssueSyncJob;
pub use mirror::Entity as Mirror;
pub use mirror_issue_config::Entity as MirrorIssueConfig;

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "issue-mirror".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
