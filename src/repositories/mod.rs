//! # Repository Layer
//!
//! SeaORM access for jobs, configs and mappings. Methods return `DbErr`; callers
//! decide whether a failure is per-issue, per-job or an HTTP error.

pub mod issue_mapping;
pub mod issue_sync_job;
pub mod mirror_issue_config;

pub use issue_mapping::{CommentMappingChange, MappingRepository, NewIssueMapping};
pub use issue_sync_job::{IssueSyncJobRepository, JobCounters, StartCheck, StartOutcome};
pub use mirror_issue_config::{MirrorContext, MirrorIssueConfigRepository};
