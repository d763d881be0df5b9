//! GitLab client contract.
//!
//! [`GitLabApi`] is the method surface the sync engine consumes; [`GitLabClient`]
//! implements it over the REST v4 API. Every failure is classified into a closed
//! [`GitLabErrorKind`] at this boundary so retry and circuit-breaking decisions
//! never inspect message text.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod client;
pub mod types;

pub use client::{GitLabClient, HttpGitLabClientFactory};
pub use types::*;

use crate::models::gitlab_instance;
use crate::resilience::{BreakerFailure, Throttled};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GitLabErrorKind {
    /// HTTP 429, optionally with a `Retry-After` hint
    RateLimited {
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_secs: Option<u64>,
    },
    /// 5xx, 408, connection reset or timeout
    Transient,
    /// Any other 4xx; retrying will not help
    Permanent,
    /// Body could not be decoded or lacked required fields
    MalformedResponse,
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{endpoint}: {message}")]
pub struct GitLabError {
    #[serde(flatten)]
    pub kind: GitLabErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub endpoint: String,
}

impl GitLabError {
    pub fn new(kind: GitLabErrorKind, endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            endpoint: endpoint.into(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Classify an HTTP error status.
    pub fn from_status(
        status: u16,
        retry_after_secs: Option<u64>,
        endpoint: impl Into<String>,
        body: &str,
    ) -> Self {
        let kind = match status {
            429 => GitLabErrorKind::RateLimited { retry_after_secs },
            408 | 500..=599 => GitLabErrorKind::Transient,
            _ => GitLabErrorKind::Permanent,
        };
        Self::new(kind, endpoint, format!("HTTP {}: {}", status, snippet(body))).with_status(status)
    }

    pub fn malformed(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(GitLabErrorKind::MalformedResponse, endpoint, message)
    }

    pub fn is_not_found(&self) -> bool {
        self.status == Some(404)
    }

    pub fn is_conflict(&self) -> bool {
        self.status == Some(409)
    }
}

impl Throttled for GitLabError {
    fn is_rate_limited(&self) -> bool {
        matches!(self.kind, GitLabErrorKind::RateLimited { .. })
    }

    fn retry_after(&self) -> Option<Duration> {
        match self.kind {
            GitLabErrorKind::RateLimited {
                retry_after_secs: Some(secs),
            } => Some(Duration::from_secs(secs)),
            _ => None,
        }
    }
}

impl BreakerFailure for GitLabError {
    /// Only signs of a struggling instance trip the breaker; a 404 on one issue does not.
    fn trips_breaker(&self) -> bool {
        matches!(
            self.kind,
            GitLabErrorKind::Transient | GitLabErrorKind::RateLimited { .. }
        )
    }
}

fn snippet(body: &str) -> String {
    if body.chars().count() > 200 {
        let truncated: String = body.chars().take(200).collect();
        format!("{}...", truncated)
    } else {
        body.to_string()
    }
}

/// GitLab operations used by the sync engine. Project ids are numeric ids on
/// the instance the client talks to; issue and note endpoints address issues
/// by project-scoped `iid`.
#[async_trait]
pub trait GitLabApi: Send + Sync {
    /// Base URL of the instance, without trailing slash.
    fn base_url(&self) -> &str;

    async fn get_issues(&self, project_id: i64, query: &IssueQuery)
    -> Result<Page<Issue>, GitLabError>;

    async fn get_issue(&self, project_id: i64, issue_iid: i64) -> Result<Issue, GitLabError>;

    async fn create_issue(&self, project_id: i64, issue: &NewIssue) -> Result<Issue, GitLabError>;

    async fn update_issue(
        &self,
        project_id: i64,
        issue_iid: i64,
        update: &IssueUpdate,
    ) -> Result<Issue, GitLabError>;

    /// All notes of an issue, oldest first, system notes included.
    async fn get_issue_notes(&self, project_id: i64, issue_iid: i64)
    -> Result<Vec<Note>, GitLabError>;

    async fn create_issue_note(
        &self,
        project_id: i64,
        issue_iid: i64,
        body: &str,
    ) -> Result<Note, GitLabError>;

    async fn update_issue_note(
        &self,
        project_id: i64,
        issue_iid: i64,
        note_id: i64,
        body: &str,
    ) -> Result<Note, GitLabError>;

    async fn get_project_labels(&self, project_id: i64) -> Result<Vec<ProjectLabel>, GitLabError>;

    async fn create_label(
        &self,
        project_id: i64,
        name: &str,
        color: &str,
    ) -> Result<ProjectLabel, GitLabError>;

    /// `duration` is a GitLab duration string such as `1h30m`.
    async fn set_time_estimate(
        &self,
        project_id: i64,
        issue_iid: i64,
        duration: &str,
    ) -> Result<(), GitLabError>;

    async fn reset_time_spent(&self, project_id: i64, issue_iid: i64) -> Result<(), GitLabError>;

    async fn add_time_spent(
        &self,
        project_id: i64,
        issue_iid: i64,
        duration: &str,
    ) -> Result<(), GitLabError>;

    async fn upload_file(
        &self,
        project_id: i64,
        filename: &str,
        content: Vec<u8>,
    ) -> Result<UploadedFile, GitLabError>;
}

/// Builds a client for a configured instance.
pub trait GitLabClientFactory: Send + Sync {
    fn client_for(
        &self,
        instance: &gitlab_instance::Model,
    ) -> Result<Arc<dyn GitLabApi>, GitLabError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        let limited = GitLabError::from_status(429, Some(7), "GET /issues", "");
        assert_eq!(
            limited.kind,
            GitLabErrorKind::RateLimited {
                retry_after_secs: Some(7)
            }
        );
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(7)));
        assert!(limited.trips_breaker());

        let unavailable = GitLabError::from_status(503, None, "GET /issues", "down");
        assert_eq!(unavailable.kind, GitLabErrorKind::Transient);
        assert!(unavailable.trips_breaker());

        let missing = GitLabError::from_status(404, None, "GET /issues/3", "404 Not Found");
        assert_eq!(missing.kind, GitLabErrorKind::Permanent);
        assert!(missing.is_not_found());
        assert!(!missing.trips_breaker());
        assert!(!missing.is_rate_limited());
    }

    #[test]
    fn error_serializes_with_tagged_kind() {
        let error = GitLabError::from_status(403, None, "POST /issues", "forbidden");
        let value = serde_json::to_value(&error).unwrap();
        assert_eq!(value["type"], "permanent");
        assert_eq!(value["status"], 403);
    }
}
