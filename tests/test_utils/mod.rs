//! Shared fixtures for integration tests: an in-memory SQLite database with
//! migrations applied, seed helpers for instances/mirrors/configs, and
//! in-memory fakes for the GitLab API and the attachment fetcher.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use issue_mirror::config::AppConfig;
use issue_mirror::gitlab::{
    GitLabApi, GitLabClientFactory, GitLabError, GitLabErrorKind, Issue, IssueQuery, IssueState,
    IssueStateFilter, IssueUpdate, NewIssue, Note, Page, ProjectLabel, StateEvent, TimeStats,
    UploadedFile, User,
};
use issue_mirror::models::{gitlab_instance, instance_pair, mirror, mirror_issue_config};
use issue_mirror::repositories::{MirrorContext, MirrorIssueConfigRepository};
use issue_mirror::sync::attachments::{
    AttachmentError, AttachmentFetcher, FetchedFile, SourceAuth,
};
use migration::{Migrator, MigratorTrait};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, Database, DatabaseConnection, EntityTrait,
    IntoActiveModel, QueryFilter, Set, Statement,
};
use url::Url;

pub const SOURCE_URL: &str = "https://gitlab-a.example.com";
pub const TARGET_URL: &str = "https://gitlab-b.example.com";
pub const SOURCE_PROJECT: i64 = 101;
pub const TARGET_PROJECT: i64 = 202;
pub const SOURCE_PATH: &str = "group/app";
pub const TARGET_PATH: &str = "mirror/app";

/// In-memory SQLite with every migration applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;

    // Deleting a mirror relies on the schema's cascades.
    db.execute(Statement::from_string(
        db.get_database_backend(),
        "PRAGMA foreign_keys = ON".to_string(),
    ))
    .await?;

    Ok(db)
}

/// Defaults with pacing removed so tests run quickly.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.rate_limit.delay_ms = 0;
    config.rate_limit.backoff_base_ms = 1;
    config.issue_sync.batch_size = 2;
    config
}

pub async fn find_or_create_instance(
    db: &DatabaseConnection,
    url: &str,
) -> Result<gitlab_instance::Model> {
    if let Some(existing) = gitlab_instance::Entity::find()
        .filter(gitlab_instance::Column::Url.eq(url))
        .one(db)
        .await?
    {
        return Ok(existing);
    }
    let now = Utc::now().fixed_offset();
    let model = gitlab_instance::ActiveModel {
        name: Set(url.trim_start_matches("https://").to_string()),
        url: Set(url.to_string()),
        api_token: Set(format!("token-for-{}", url.trim_start_matches("https://"))),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(db)
    .await?;
    Ok(model)
}

/// Seeded rows for one mirror and its issue sync config.
#[derive(Debug, Clone)]
pub struct MirrorFixture {
    pub source_instance: gitlab_instance::Model,
    pub target_instance: gitlab_instance::Model,
    pub pair: instance_pair::Model,
    pub mirror: mirror::Model,
    pub config: mirror_issue_config::Model,
}

/// Mirror `source_project` on `source_url` into `target_project` on `target_url`.
pub async fn seed_mirror(
    db: &DatabaseConnection,
    source_url: &str,
    source_project: (i64, &str),
    target_url: &str,
    target_project: (i64, &str),
) -> Result<MirrorFixture> {
    let source_instance = find_or_create_instance(db, source_url).await?;
    let target_instance = find_or_create_instance(db, target_url).await?;
    let now = Utc::now().fixed_offset();

    let pair = instance_pair::ActiveModel {
        name: Set(format!("{} -> {}", source_instance.name, target_instance.name)),
        source_instance_id: Set(source_instance.id),
        target_instance_id: Set(target_instance.id),
        mirror_direction: Set("push".to_string()),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(db)
    .await?;

    let mirror = mirror::ActiveModel {
        instance_pair_id: Set(pair.id),
        source_project_id: Set(source_project.0),
        source_project_path: Set(source_project.1.to_string()),
        target_project_id: Set(target_project.0),
        target_project_path: Set(target_project.1.to_string()),
        enabled: Set(true),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(db)
    .await?;

    let config = mirror_issue_config::ActiveModel {
        mirror_id: Set(mirror.id),
        enabled: Set(true),
        sync_comments: Set(true),
        sync_labels: Set(true),
        sync_attachments: Set(false),
        sync_weight: Set(true),
        sync_time_estimate: Set(true),
        sync_time_spent: Set(true),
        sync_closed_issues: Set(true),
        update_existing: Set(true),
        sync_existing_issues: Set(true),
        sync_interval_minutes: Set(15),
        last_sync_at: Set(None),
        next_sync_at: Set(None),
        last_sync_status: Set(None),
        last_sync_error: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(db)
    .await?;

    Ok(MirrorFixture {
        source_instance,
        target_instance,
        pair,
        mirror,
        config,
    })
}

/// The standard A -> B fixture.
pub async fn seed_default_mirror(db: &DatabaseConnection) -> Result<MirrorFixture> {
    seed_mirror(
        db,
        SOURCE_URL,
        (SOURCE_PROJECT, SOURCE_PATH),
        TARGET_URL,
        (TARGET_PROJECT, TARGET_PATH),
    )
    .await
}

/// Apply `edit` to a stored config and return the updated row.
pub async fn update_config<F>(
    db: &DatabaseConnection,
    config_id: i32,
    edit: F,
) -> Result<mirror_issue_config::Model>
where
    F: FnOnce(&mut mirror_issue_config::ActiveModel),
{
    let model = mirror_issue_config::Entity::find_by_id(config_id)
        .one(db)
        .await?
        .ok_or_else(|| anyhow::anyhow!("config {config_id} missing"))?;
    let mut active = model.into_active_model();
    edit(&mut active);
    Ok(active.update(db).await?)
}

pub async fn load_config(
    db: &DatabaseConnection,
    config_id: i32,
) -> Result<mirror_issue_config::Model> {
    mirror_issue_config::Entity::find_by_id(config_id)
        .one(db)
        .await?
        .ok_or_else(|| anyhow::anyhow!("config {config_id} missing"))
}

pub async fn load_context(db: &DatabaseConnection, config_id: i32) -> Result<MirrorContext> {
    MirrorIssueConfigRepository::new(db.clone())
        .load_context(config_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("context for config {config_id} missing"))
}

pub fn user(username: &str) -> User {
    User {
        id: username.len() as i64,
        username: username.to_string(),
        name: username.to_string(),
    }
}

/// An open source issue with sensible defaults, last updated an hour ago.
pub fn issue(project_id: i64, iid: i64, title: &str) -> Issue {
    let updated = Utc::now() - Duration::hours(1);
    Issue {
        id: project_id * 10_000 + iid,
        iid,
        project_id,
        title: title.to_string(),
        description: Some(format!("Description of {title}")),
        state: IssueState::Opened,
        labels: Vec::new(),
        milestone: None,
        iteration: None,
        epic: None,
        assignees: Vec::new(),
        author: user("reporter"),
        weight: None,
        time_stats: TimeStats::default(),
        web_url: format!("{SOURCE_URL}/{SOURCE_PATH}/-/issues/{iid}"),
        created_at: updated - Duration::days(1),
        updated_at: updated,
    }
}

pub fn note(id: i64, author: &str, body: &str) -> Note {
    Note {
        id,
        body: body.to_string(),
        author: user(author),
        system: false,
        created_at: Utc::now() - Duration::minutes(30),
    }
}

/// Parse the `h`/`m`/`s` duration strings the engine sends.
fn parse_duration(value: &str) -> i64 {
    let mut total = 0;
    let mut number = String::new();
    for ch in value.chars() {
        if ch.is_ascii_digit() {
            number.push(ch);
            continue;
        }
        let amount: i64 = number.parse().unwrap_or(0);
        number.clear();
        total += match ch {
            'h' => amount * 3600,
            'm' => amount * 60,
            's' => amount,
            _ => 0,
        };
    }
    total
}

#[derive(Default)]
struct FakeState {
    issues: BTreeMap<(i64, i64), Issue>,
    notes: HashMap<(i64, i64), Vec<Note>>,
    labels: HashMap<i64, Vec<ProjectLabel>>,
    uploads: Vec<(i64, String, usize)>,
    next_id: i64,
    last_iid: HashMap<i64, i64>,
    calls: Vec<String>,
    failures: HashMap<String, VecDeque<GitLabError>>,
    time_calls: Vec<(i64, String, String)>,
}

/// In-memory GitLab instance keyed by `(project_id, iid)`.
pub struct FakeGitLab {
    base_url: String,
    state: Mutex<FakeState>,
}

impl FakeGitLab {
    pub fn new(base_url: &str) -> Arc<Self> {
        Arc::new(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            state: Mutex::new(FakeState {
                next_id: 50_000,
                ..FakeState::default()
            }),
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn enter(&self, op: &str) -> Result<(), GitLabError> {
        let mut state = self.state();
        state.calls.push(op.to_string());
        match state.failures.get_mut(op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Make the next call to `op` fail with `err`.
    pub fn fail_next(&self, op: &str, err: GitLabError) {
        self.state()
            .failures
            .entry(op.to_string())
            .or_default()
            .push_back(err);
    }

    pub fn fail_times(&self, op: &str, times: usize, err: GitLabError) {
        for _ in 0..times {
            self.fail_next(op, err.clone());
        }
    }

    pub fn put_issue(&self, issue: Issue) {
        self.state()
            .issues
            .insert((issue.project_id, issue.iid), issue);
    }

    pub fn put_note(&self, project_id: i64, iid: i64, note: Note) {
        let mut state = self.state();
        let notes = state.notes.entry((project_id, iid)).or_default();
        match notes.iter_mut().find(|existing| existing.id == note.id) {
            Some(existing) => *existing = note,
            None => notes.push(note),
        }
    }

    pub fn put_label(&self, project_id: i64, name: &str) {
        let mut state = self.state();
        state.next_id += 1;
        let id = state.next_id;
        state.labels.entry(project_id).or_default().push(ProjectLabel {
            id,
            name: name.to_string(),
            color: None,
        });
    }

    /// Bump `updated_at` without changing content.
    pub fn touch(&self, project_id: i64, iid: i64) {
        if let Some(issue) = self.state().issues.get_mut(&(project_id, iid)) {
            issue.updated_at = Utc::now();
        }
    }

    pub fn edit_issue<F: FnOnce(&mut Issue)>(&self, project_id: i64, iid: i64, edit: F) {
        if let Some(issue) = self.state().issues.get_mut(&(project_id, iid)) {
            edit(issue);
            issue.updated_at = Utc::now();
        }
    }

    pub fn remove_issue(&self, project_id: i64, iid: i64) {
        self.state().issues.remove(&(project_id, iid));
    }

    pub fn issues(&self, project_id: i64) -> Vec<Issue> {
        self.state()
            .issues
            .values()
            .filter(|issue| issue.project_id == project_id)
            .cloned()
            .collect()
    }

    pub fn issue(&self, project_id: i64, iid: i64) -> Option<Issue> {
        self.state().issues.get(&(project_id, iid)).cloned()
    }

    pub fn notes(&self, project_id: i64, iid: i64) -> Vec<Note> {
        self.state()
            .notes
            .get(&(project_id, iid))
            .cloned()
            .unwrap_or_default()
    }

    pub fn label_names(&self, project_id: i64) -> Vec<String> {
        self.state()
            .labels
            .get(&project_id)
            .map(|labels| labels.iter().map(|label| label.name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn uploads(&self) -> Vec<(i64, String, usize)> {
        self.state().uploads.clone()
    }

    pub fn call_count(&self, op: &str) -> usize {
        self.state().calls.iter().filter(|call| *call == op).count()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// `(iid, operation, duration)` for every time-tracking call.
    pub fn time_calls(&self) -> Vec<(i64, String, String)> {
        self.state().time_calls.clone()
    }

    fn not_found(endpoint: &str) -> GitLabError {
        GitLabError::from_status(404, None, endpoint, "404 Not Found")
    }
}

pub fn transient(endpoint: &str) -> GitLabError {
    GitLabError::from_status(503, None, endpoint, "Service Unavailable")
}

pub fn rate_limited(endpoint: &str) -> GitLabError {
    GitLabError::from_status(429, Some(0), endpoint, "Too Many Requests")
}

pub fn forbidden(endpoint: &str) -> GitLabError {
    GitLabError::from_status(403, None, endpoint, "403 Forbidden")
}

#[async_trait]
impl GitLabApi for FakeGitLab {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_issues(&self, project_id: i64, query: &IssueQuery) -> Result<Page<Issue>, GitLabError> {
        self.enter("get_issues")?;
        let state = self.state();
        let mut matching: Vec<Issue> = state
            .issues
            .values()
            .filter(|issue| issue.project_id == project_id)
            .filter(|issue| match query.state {
                IssueStateFilter::All => true,
                IssueStateFilter::Opened => issue.state == IssueState::Opened,
                IssueStateFilter::Closed => issue.state == IssueState::Closed,
            })
            .filter(|issue| query.updated_after.is_none_or(|after| issue.updated_at >= after))
            .filter(|issue| query.labels.iter().all(|label| issue.labels.contains(label)))
            .filter(|issue| {
                query.search.as_ref().is_none_or(|needle| {
                    issue.title.contains(needle.as_str())
                        || issue.description_text().contains(needle.as_str())
                })
            })
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.id.cmp(&b.id)));

        let per_page = query.per_page.max(1) as usize;
        let start = (query.page.max(1) as usize - 1) * per_page;
        let items: Vec<Issue> = matching.iter().skip(start).take(per_page).cloned().collect();
        let next_page = (start + per_page < matching.len()).then_some(query.page + 1);
        Ok(Page { items, next_page })
    }

    async fn get_issue(&self, project_id: i64, issue_iid: i64) -> Result<Issue, GitLabError> {
        self.enter("get_issue")?;
        self.issue(project_id, issue_iid)
            .ok_or_else(|| Self::not_found("get_issue"))
    }

    async fn create_issue(&self, project_id: i64, new: &NewIssue) -> Result<Issue, GitLabError> {
        self.enter("create_issue")?;
        let mut state = self.state();
        state.next_id += 1;
        let id = state.next_id;
        let existing_max = state
            .issues
            .keys()
            .filter(|(project, _)| *project == project_id)
            .map(|(_, iid)| *iid)
            .max()
            .unwrap_or(0);
        // iids are never reused, even after a delete.
        let last = state.last_iid.entry(project_id).or_insert(0);
        let iid = (*last).max(existing_max) + 1;
        *last = iid;
        let now = Utc::now();
        let issue = Issue {
            id,
            iid,
            project_id,
            title: new.title.clone(),
            description: Some(new.description.clone()),
            state: IssueState::Opened,
            labels: new.labels.clone(),
            milestone: None,
            iteration: None,
            epic: None,
            assignees: Vec::new(),
            author: user("mirror-bot"),
            weight: new.weight,
            time_stats: TimeStats::default(),
            web_url: format!("{}/p/{}/-/issues/{}", self.base_url, project_id, iid),
            created_at: now,
            updated_at: now,
        };
        state.issues.insert((project_id, iid), issue.clone());
        Ok(issue)
    }

    async fn update_issue(
        &self,
        project_id: i64,
        issue_iid: i64,
        update: &IssueUpdate,
    ) -> Result<Issue, GitLabError> {
        self.enter("update_issue")?;
        let mut state = self.state();
        let issue = state
            .issues
            .get_mut(&(project_id, issue_iid))
            .ok_or_else(|| Self::not_found("update_issue"))?;
        if let Some(title) = &update.title {
            issue.title = title.clone();
        }
        if let Some(description) = &update.description {
            issue.description = Some(description.clone());
        }
        if let Some(labels) = &update.labels {
            issue.labels = labels.clone();
        }
        if update.weight.is_some() {
            issue.weight = update.weight;
        }
        match update.state_event {
            Some(StateEvent::Close) => issue.state = IssueState::Closed,
            Some(StateEvent::Reopen) => issue.state = IssueState::Opened,
            None => {}
        }
        issue.updated_at = Utc::now();
        Ok(issue.clone())
    }

    async fn get_issue_notes(&self, project_id: i64, issue_iid: i64) -> Result<Vec<Note>, GitLabError> {
        self.enter("get_issue_notes")?;
        Ok(self.notes(project_id, issue_iid))
    }

    async fn create_issue_note(
        &self,
        project_id: i64,
        issue_iid: i64,
        body: &str,
    ) -> Result<Note, GitLabError> {
        self.enter("create_issue_note")?;
        let mut state = self.state();
        state.next_id += 1;
        let note = Note {
            id: state.next_id,
            body: body.to_string(),
            author: user("mirror-bot"),
            system: false,
            created_at: Utc::now(),
        };
        state
            .notes
            .entry((project_id, issue_iid))
            .or_default()
            .push(note.clone());
        Ok(note)
    }

    async fn update_issue_note(
        &self,
        project_id: i64,
        issue_iid: i64,
        note_id: i64,
        body: &str,
    ) -> Result<Note, GitLabError> {
        self.enter("update_issue_note")?;
        let mut state = self.state();
        let note = state
            .notes
            .get_mut(&(project_id, issue_iid))
            .and_then(|notes| notes.iter_mut().find(|note| note.id == note_id))
            .ok_or_else(|| Self::not_found("update_issue_note"))?;
        note.body = body.to_string();
        Ok(note.clone())
    }

    async fn get_project_labels(&self, project_id: i64) -> Result<Vec<ProjectLabel>, GitLabError> {
        self.enter("get_project_labels")?;
        Ok(self
            .state()
            .labels
            .get(&project_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_label(
        &self,
        project_id: i64,
        name: &str,
        color: &str,
    ) -> Result<ProjectLabel, GitLabError> {
        self.enter("create_label")?;
        let mut state = self.state();
        state.next_id += 1;
        let id = state.next_id;
        let labels = state.labels.entry(project_id).or_default();
        if let Some(existing) = labels
            .iter()
            .find(|label| label.name.eq_ignore_ascii_case(name))
        {
            return Ok(existing.clone());
        }
        let label = ProjectLabel {
            id,
            name: name.to_string(),
            color: Some(color.to_string()),
        };
        labels.push(label.clone());
        Ok(label)
    }

    async fn set_time_estimate(
        &self,
        project_id: i64,
        issue_iid: i64,
        duration: &str,
    ) -> Result<(), GitLabError> {
        self.enter("set_time_estimate")?;
        let mut state = self.state();
        state
            .time_calls
            .push((issue_iid, "estimate".to_string(), duration.to_string()));
        let issue = state
            .issues
            .get_mut(&(project_id, issue_iid))
            .ok_or_else(|| Self::not_found("set_time_estimate"))?;
        issue.time_stats.time_estimate = parse_duration(duration);
        Ok(())
    }

    async fn reset_time_spent(&self, project_id: i64, issue_iid: i64) -> Result<(), GitLabError> {
        self.enter("reset_time_spent")?;
        let mut state = self.state();
        state
            .time_calls
            .push((issue_iid, "reset".to_string(), String::new()));
        let issue = state
            .issues
            .get_mut(&(project_id, issue_iid))
            .ok_or_else(|| Self::not_found("reset_time_spent"))?;
        issue.time_stats.total_time_spent = 0;
        Ok(())
    }

    async fn add_time_spent(
        &self,
        project_id: i64,
        issue_iid: i64,
        duration: &str,
    ) -> Result<(), GitLabError> {
        self.enter("add_time_spent")?;
        let mut state = self.state();
        state
            .time_calls
            .push((issue_iid, "spent".to_string(), duration.to_string()));
        let issue = state
            .issues
            .get_mut(&(project_id, issue_iid))
            .ok_or_else(|| Self::not_found("add_time_spent"))?;
        issue.time_stats.total_time_spent += parse_duration(duration);
        Ok(())
    }

    async fn upload_file(
        &self,
        project_id: i64,
        filename: &str,
        content: Vec<u8>,
    ) -> Result<UploadedFile, GitLabError> {
        self.enter("upload_file")?;
        let mut state = self.state();
        state.next_id += 1;
        let url = format!("/uploads/{:08x}/{}", state.next_id, filename);
        state
            .uploads
            .push((project_id, filename.to_string(), content.len()));
        Ok(UploadedFile {
            alt: filename.to_string(),
            markdown: format!("![{filename}]({url})"),
            url,
        })
    }
}

/// Hands out the fake registered for an instance's base URL.
#[derive(Default)]
pub struct FakeFactory {
    clients: Mutex<HashMap<String, Arc<FakeGitLab>>>,
}

impl FakeFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, fake: Arc<FakeGitLab>) {
        self.clients
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(fake.base_url.clone(), fake);
    }
}

impl GitLabClientFactory for FakeFactory {
    fn client_for(
        &self,
        instance: &gitlab_instance::Model,
    ) -> Result<Arc<dyn GitLabApi>, GitLabError> {
        let clients = self.clients.lock().unwrap_or_else(|p| p.into_inner());
        match clients.get(instance.base_url()) {
            Some(fake) => Ok(fake.clone() as Arc<dyn GitLabApi>),
            None => Err(GitLabError::new(
                GitLabErrorKind::Permanent,
                "client_for",
                format!("no fake registered for {}", instance.base_url()),
            )),
        }
    }
}

/// Serves canned bytes per URL and records what was requested.
#[derive(Default)]
pub struct FakeFetcher {
    files: Mutex<HashMap<String, Vec<u8>>>,
    requests: Mutex<Vec<(String, Option<String>)>>,
}

impl FakeFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serve(&self, url: &str, bytes: &[u8]) {
        self.files
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(url.to_string(), bytes.to_vec());
    }

    /// `(url, auth host)` for every fetch.
    pub fn requests(&self) -> Vec<(String, Option<String>)> {
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

#[async_trait]
impl AttachmentFetcher for FakeFetcher {
    async fn fetch(&self, url: &Url, auth: Option<&SourceAuth>) -> Result<FetchedFile, AttachmentError> {
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((url.to_string(), auth.map(|auth| auth.host.clone())));
        let files = self.files.lock().unwrap_or_else(|p| p.into_inner());
        match files.get(url.as_str()) {
            Some(bytes) => Ok(FetchedFile {
                filename: url
                    .path_segments()
                    .and_then(|mut segments| segments.next_back())
                    .unwrap_or("file")
                    .to_string(),
                bytes: bytes.clone(),
            }),
            None => Err(AttachmentError::Http { status: 404 }),
        }
    }
}

/// A timestamp safely in the past relative to seeded issues.
pub fn long_ago() -> DateTime<Utc> {
    Utc::now() - Duration::days(30)
}
