//! Typed GitLab REST payloads.
//!
//! Only the fields the sync engine reads are modelled. Required fields are
//! non-optional so a response missing them fails deserialization and surfaces
//! as [`GitLabErrorKind::MalformedResponse`](super::GitLabErrorKind).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueState {
    Opened,
    Closed,
}

impl IssueState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueState::Opened => "opened",
            IssueState::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Milestone {
    pub id: i64,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Iteration {
    pub id: i64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub iid: Option<i64>,
}

impl Iteration {
    /// Iterations in automatic cadences often have no title.
    pub fn display_name(&self) -> String {
        match (&self.title, self.iid) {
            (Some(title), _) if !title.is_empty() => title.clone(),
            (_, Some(iid)) => format!("Iteration {iid}"),
            _ => format!("Iteration {}", self.id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Epic {
    pub id: i64,
    pub iid: i64,
    pub title: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeStats {
    #[serde(default)]
    pub time_estimate: i64,
    #[serde(default)]
    pub total_time_spent: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub id: i64,
    pub iid: i64,
    pub project_id: i64,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub state: IssueState,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub milestone: Option<Milestone>,
    #[serde(default)]
    pub iteration: Option<Iteration>,
    #[serde(default)]
    pub epic: Option<Epic>,
    #[serde(default)]
    pub assignees: Vec<User>,
    pub author: User,
    #[serde(default)]
    pub weight: Option<i64>,
    #[serde(default)]
    pub time_stats: TimeStats,
    pub web_url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Issue {
    pub fn description_text(&self) -> &str {
        self.description.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: i64,
    pub body: String,
    pub author: User,
    #[serde(default)]
    pub system: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectLabel {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
}

/// Response of `POST /projects/:id/uploads`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadedFile {
    #[serde(default)]
    pub alt: String,
    /// Project-relative URL such as `/uploads/<secret>/file.png`
    pub url: String,
    pub markdown: String,
}

/// One page of a paginated listing.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_page: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueStateFilter {
    All,
    Opened,
    Closed,
}

impl IssueStateFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueStateFilter::All => "all",
            IssueStateFilter::Opened => "opened",
            IssueStateFilter::Closed => "closed",
        }
    }
}

/// Filters for `GET /projects/:id/issues`. Results are always ordered by
/// `updated_at` ascending.
#[derive(Debug, Clone, PartialEq)]
pub struct IssueQuery {
    pub updated_after: Option<DateTime<Utc>>,
    pub state: IssueStateFilter,
    pub labels: Vec<String>,
    pub search: Option<String>,
    pub page: u32,
    pub per_page: u32,
}

impl Default for IssueQuery {
    fn default() -> Self {
        Self {
            updated_after: None,
            state: IssueStateFilter::All,
            labels: Vec::new(),
            search: None,
            page: 1,
            per_page: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct NewIssue {
    pub title: String,
    pub description: String,
    pub labels: Vec<String>,
    pub weight: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    Close,
    Reopen,
}

impl StateEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateEvent::Close => "close",
            StateEvent::Reopen => "reopen",
        }
    }
}

/// Partial update; `None` fields are left untouched.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IssueUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub labels: Option<Vec<String>>,
    pub weight: Option<i64>,
    pub state_event: Option<StateEvent>,
}

impl IssueUpdate {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.labels.is_none()
            && self.weight.is_none()
            && self.state_event.is_none()
    }
}
