//! Issue replication: the per-job engine, its footer and attachment helpers,
//! and the runner that owns job units.

use std::time::Duration;

use sea_orm::DbErr;
use serde::Serialize;
use thiserror::Error;

pub mod attachments;
pub mod engine;
pub mod footer;
pub mod runner;

pub use attachments::{AttachmentError, AttachmentFetcher, HttpAttachmentFetcher};
pub use engine::{EngineDeps, IssueSyncEngine};
pub use runner::{SyncRunner, TriggerError};

use crate::gitlab::{GitLabError, GitLabErrorKind};
use crate::models::mirror_issue_config::SyncStatus;
use crate::repositories::JobCounters;
use crate::resilience::CircuitError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{0}")]
    Remote(GitLabError),
    #[error("circuit '{name}' open, retry in {retry_in:?}")]
    CircuitOpen { name: String, retry_in: Duration },
    #[error("database error: {0}")]
    Database(#[from] DbErr),
    #[error("attachment error: {0}")]
    Attachment(#[from] AttachmentError),
}

impl From<CircuitError<GitLabError>> for SyncError {
    fn from(err: CircuitError<GitLabError>) -> Self {
        match err {
            CircuitError::Open { name, retry_in } => SyncError::CircuitOpen { name, retry_in },
            CircuitError::Inner(inner) => SyncError::Remote(inner),
        }
    }
}

impl SyncError {
    pub fn remote_kind(&self) -> Option<&GitLabErrorKind> {
        match self {
            SyncError::Remote(err) => Some(&err.kind),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::Remote(err) if err.is_not_found())
    }
}

/// One failed issue, as recorded in a job's `error_details`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IssueError {
    pub source_issue_id: i64,
    pub source_issue_iid: i64,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<GitLabErrorKind>,
}

/// Result of one engine run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncOutcome {
    #[serde(flatten)]
    pub counters: JobCounters,
    /// Issues whose comment or attachment tail failed; their mapping is `partial`
    pub degraded: u32,
    pub errors: Vec<IssueError>,
    /// The fetch hit `max_issues_per_sync` or `max_pages_per_request`
    pub capped: bool,
    /// First run without backfill; only the baseline was recorded
    pub baseline: bool,
    /// Stopped early by shutdown
    pub cancelled: bool,
}

impl SyncOutcome {
    pub fn empty() -> Self {
        Self {
            counters: JobCounters::default(),
            degraded: 0,
            errors: Vec::new(),
            capped: false,
            baseline: false,
            cancelled: false,
        }
    }

    /// Status of the run; fixed here so later steps cannot overwrite it.
    pub fn status(&self) -> SyncStatus {
        if self.cancelled {
            return SyncStatus::Failed;
        }
        let failed = self.counters.failed;
        let degraded = self.degraded;
        let succeeded = self
            .counters
            .processed
            .saturating_sub(failed)
            .saturating_sub(degraded);
        SyncStatus::rollup(succeeded, degraded, failed)
    }

    /// JSON stored in `issue_sync_jobs.error_details`.
    pub fn error_details(&self) -> serde_json::Value {
        serde_json::json!({
            "sync_status": self.status().as_str(),
            "degraded": self.degraded,
            "capped": self.capped,
            "errors": self.errors,
        })
    }

    /// Short text for `mirror_issue_configs.last_sync_error`.
    pub fn summary_error(&self) -> Option<String> {
        if self.cancelled {
            return Some("interrupted by shutdown".to_string());
        }
        if self.errors.is_empty() && self.degraded == 0 {
            return None;
        }
        let mut text = format!(
            "{} of {} issues failed",
            self.counters.failed, self.counters.processed
        );
        if self.degraded > 0 {
            text.push_str(&format!(", {} partially synced", self.degraded));
        }
        if let Some(first) = self.errors.first() {
            text.push_str(&format!("; first error (#{}): {}", first.source_issue_iid, first.error));
        }
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(processed: u32, failed: u32, degraded: u32) -> SyncOutcome {
        SyncOutcome {
            counters: JobCounters {
                processed,
                failed,
                ..JobCounters::default()
            },
            degraded,
            ..SyncOutcome::empty()
        }
    }

    #[test]
    fn status_rollup_from_counts() {
        assert_eq!(outcome(0, 0, 0).status(), SyncStatus::Success);
        assert_eq!(outcome(5, 0, 0).status(), SyncStatus::Success);
        assert_eq!(outcome(5, 2, 0).status(), SyncStatus::Partial);
        assert_eq!(outcome(5, 0, 1).status(), SyncStatus::Partial);
        assert_eq!(outcome(3, 3, 0).status(), SyncStatus::Failed);
    }

    #[test]
    fn cancelled_runs_fail_with_interruption_message() {
        let run = SyncOutcome {
            cancelled: true,
            ..outcome(2, 0, 0)
        };
        assert_eq!(run.status(), SyncStatus::Failed);
        assert_eq!(run.summary_error().as_deref(), Some("interrupted by shutdown"));
    }

    #[test]
    fn circuit_open_converts_to_sync_error() {
        let err: SyncError = CircuitError::<GitLabError>::Open {
            name: "https://gitlab.example.com".to_string(),
            retry_in: Duration::from_secs(5),
        }
        .into();
        assert!(matches!(err, SyncError::CircuitOpen { .. }));
        assert!(err.remote_kind().is_none());
    }
}
