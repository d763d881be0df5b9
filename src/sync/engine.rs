//! # Issue Sync Engine
//!
//! Replays source issue state onto the target project of one mirror. An engine
//! is built per job and owns its rate limiter and label cache; the circuit
//! breakers come from the process-wide registry so concurrent jobs hitting the
//! same instance share them.
//!
//! Per issue the engine decides between create, update and skip:
//!
//! * issues labelled as mirrored from the target instance are never sent back;
//! * without a mapping the target is searched for an orphan carrying this
//!   issue's footer token before anything is created;
//! * a mapping with an unchanged content hash and state is a no-op apart from
//!   picking up new comments and retrying a `partial` tail.
//!
//! Mappings are written as `pending` once the target issue exists and promoted
//! to `synced` only after the comment and attachment tail succeeds.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use metrics::counter;
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::attachments::{
    AttachmentFetcher, SourceAuth, extract_attachment_urls, filename_from_url, host_key,
    resolve_attachment_url,
};
use super::footer;
use super::{IssueError, SyncError, SyncOutcome};
use crate::config::{AppConfig, IssueSyncSettings};
use crate::gitlab::{
    GitLabApi, GitLabError, Issue, IssueQuery, IssueState, IssueStateFilter, IssueUpdate,
    NewIssue, StateEvent,
};
use crate::models::issue_mapping::{self, MappingStatus};
use crate::repositories::{
    CommentMappingChange, IssueSyncJobRepository, MappingRepository, MirrorContext,
    MirrorIssueConfigRepository, NewIssueMapping,
};
use crate::resilience::{CircuitBreaker, CircuitBreakerRegistry, RateLimiter};

/// Shared services an engine is assembled from.
#[derive(Clone)]
pub struct EngineDeps {
    pub db: DatabaseConnection,
    pub source: Arc<dyn GitLabApi>,
    pub target: Arc<dyn GitLabApi>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub fetcher: Arc<dyn AttachmentFetcher>,
    pub config: Arc<AppConfig>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Source,
    Target,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IssueResult {
    Created { degraded: bool },
    Updated { degraded: bool },
    Skipped { degraded: bool },
}

impl IssueResult {
    fn degraded(&self) -> bool {
        match *self {
            IssueResult::Created { degraded }
            | IssueResult::Updated { degraded }
            | IssueResult::Skipped { degraded } => degraded,
        }
    }

    fn metric_label(&self) -> &'static str {
        match self {
            IssueResult::Created { .. } => "created",
            IssueResult::Updated { .. } => "updated",
            IssueResult::Skipped { .. } => "skipped",
        }
    }
}

pub struct IssueSyncEngine {
    ctx: MirrorContext,
    source: Arc<dyn GitLabApi>,
    target: Arc<dyn GitLabApi>,
    source_breaker: Arc<CircuitBreaker>,
    target_breaker: Arc<CircuitBreaker>,
    limiter: RateLimiter,
    fetcher: Arc<dyn AttachmentFetcher>,
    mappings: MappingRepository,
    configs: MirrorIssueConfigRepository,
    jobs: IssueSyncJobRepository,
    settings: IssueSyncSettings,
    cancel: CancellationToken,
    /// Lowercased label names known to exist on the target project
    label_cache: Mutex<HashSet<String>>,
    source_host: String,
    target_host: String,
}

impl IssueSyncEngine {
    pub fn new(ctx: MirrorContext, deps: EngineDeps) -> Self {
        let source_breaker = deps.breakers.for_instance(ctx.source_instance.base_url());
        let target_breaker = deps.breakers.for_instance(ctx.target_instance.base_url());
        let source_host = ctx.source_instance.host_identity();
        let target_host = ctx.target_instance.host_identity();
        Self {
            source: deps.source,
            target: deps.target,
            source_breaker,
            target_breaker,
            limiter: RateLimiter::new(deps.config.rate_limit.clone()),
            fetcher: deps.fetcher,
            mappings: MappingRepository::new(deps.db.clone()),
            configs: MirrorIssueConfigRepository::new(deps.db.clone()),
            jobs: IssueSyncJobRepository::new(deps.db),
            settings: deps.config.issue_sync.clone(),
            cancel: deps.cancel,
            label_cache: Mutex::new(HashSet::new()),
            source_host,
            target_host,
            ctx,
        }
    }

    fn source_project(&self) -> i64 {
        self.ctx.mirror.source_project_id
    }

    fn target_project(&self) -> i64 {
        self.ctx.mirror.target_project_id
    }

    fn source_path(&self) -> &str {
        &self.ctx.mirror.source_project_path
    }

    fn provenance_label(&self) -> String {
        footer::provenance_label(&self.source_host)
    }

    /// Pace, retry on 429, and route through the instance's breaker.
    async fn remote<T, F, Fut>(&self, side: Side, name: &'static str, op: F) -> Result<T, SyncError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, GitLabError>>,
    {
        let breaker = match side {
            Side::Source => &self.source_breaker,
            Side::Target => &self.target_breaker,
        };
        self.limiter.delay().await;
        breaker
            .call(|| self.limiter.execute_with_retry(name, &op))
            .await
            .map_err(SyncError::from)
    }

    /// Run one sync pass.
    ///
    /// Returns `Err` only when the run cannot proceed at all (labels or the issue
    /// list cannot be loaded, or the checkpoint cannot be written). Per-issue
    /// failures are collected in the outcome.
    #[instrument(skip(self), fields(config_id = self.ctx.config.id, mirror_id = self.ctx.mirror.id))]
    pub async fn sync(&self) -> Result<SyncOutcome, SyncError> {
        let run_started = Utc::now();
        let config = &self.ctx.config;

        self.load_label_cache().await?;
        self.ensure_labels(&[self.provenance_label()]).await?;

        // Backfill configs rescan everything so issues older than the checkpoint
        // are still picked up. A pass cut short by the fetch cap continues from
        // its high-water mark first; the rest run incrementally.
        let resume_capped = config.sync_existing_issues
            && config.last_sync_at.is_some()
            && self.jobs.last_pass_capped(config.id).await?;
        let updated_after = match config.last_sync_at {
            _ if config.sync_existing_issues && !resume_capped => None,
            Some(last) => Some(last.with_timezone(&Utc)),
            None => {
                info!(config_id = config.id, "First run without backfill, recording baseline");
                self.configs.checkpoint(config.id, run_started).await?;
                return Ok(SyncOutcome {
                    baseline: true,
                    ..SyncOutcome::empty()
                });
            }
        };

        let (issues, capped) = self.fetch_source_issues(updated_after).await?;
        info!(
            config_id = config.id,
            fetched = issues.len(),
            capped,
            incremental = updated_after.is_some(),
            "Fetched source issues"
        );

        let mut outcome = SyncOutcome {
            capped,
            ..SyncOutcome::empty()
        };
        let mut high_water: Option<DateTime<Utc>> = None;
        let batch_size = self.settings.batch_size.max(1);

        'batches: for batch in issues.chunks(batch_size) {
            for issue in batch {
                if self.cancel.is_cancelled() {
                    warn!(config_id = config.id, "Cancellation requested, stopping before next issue");
                    outcome.cancelled = true;
                    break 'batches;
                }
                self.process_issue(issue, &mut outcome).await;
                high_water = high_water.max(Some(issue.updated_at));
            }
            if let Some(mark) = high_water {
                self.configs.checkpoint(config.id, mark).await?;
            }
        }

        if let Some(mark) = high_water
            && outcome.cancelled
        {
            self.configs.checkpoint(config.id, mark).await?;
        } else if !outcome.cancelled && !capped {
            self.configs.checkpoint(config.id, run_started).await?;
        }

        info!(
            config_id = config.id,
            processed = outcome.counters.processed,
            created = outcome.counters.created,
            updated = outcome.counters.updated,
            skipped = outcome.counters.skipped,
            failed = outcome.counters.failed,
            degraded = outcome.degraded,
            api_calls = self.limiter.operation_count(),
            calls_per_sec = format!("{:.2}", self.limiter.throughput()),
            status = outcome.status().as_str(),
            "Issue sync pass finished"
        );
        Ok(outcome)
    }

    async fn process_issue(&self, issue: &Issue, outcome: &mut SyncOutcome) {
        outcome.counters.processed += 1;
        match self.sync_issue(issue).await {
            Ok(result) => {
                match result {
                    IssueResult::Created { .. } => outcome.counters.created += 1,
                    IssueResult::Updated { .. } => outcome.counters.updated += 1,
                    IssueResult::Skipped { .. } => outcome.counters.skipped += 1,
                }
                if result.degraded() {
                    outcome.degraded += 1;
                }
                counter!("issue_sync_issues_total", "outcome" => result.metric_label()).increment(1);
            }
            Err(err) => {
                warn!(
                    source_issue_iid = issue.iid,
                    error = %err,
                    "Failed to sync issue"
                );
                outcome.counters.failed += 1;
                outcome.errors.push(IssueError {
                    source_issue_id: issue.id,
                    source_issue_iid: issue.iid,
                    error: err.to_string(),
                    kind: err.remote_kind().cloned(),
                });
                counter!("issue_sync_issues_total", "outcome" => "failed").increment(1);
            }
        }
    }

    /// Page through source issues in `updated_at` order, honouring both caps.
    async fn fetch_source_issues(
        &self,
        updated_after: Option<DateTime<Utc>>,
    ) -> Result<(Vec<Issue>, bool), SyncError> {
        let state = if self.ctx.config.sync_closed_issues {
            IssueStateFilter::All
        } else {
            IssueStateFilter::Opened
        };
        let max_issues = self.settings.max_issues_per_sync;
        let max_pages = self.settings.max_pages_per_request.max(1);

        let mut issues = Vec::new();
        let mut page = 1u32;
        let mut pages_fetched = 0u32;
        loop {
            let query = IssueQuery {
                updated_after,
                state,
                page,
                per_page: self.settings.per_page,
                ..IssueQuery::default()
            };
            let result = self
                .remote(Side::Source, "get_issues", || {
                    self.source.get_issues(self.source_project(), &query)
                })
                .await?;
            pages_fetched += 1;
            issues.extend(result.items);

            if issues.len() >= max_issues {
                let capped = issues.len() > max_issues || result.next_page.is_some();
                issues.truncate(max_issues);
                return Ok((issues, capped));
            }
            match result.next_page {
                Some(next) if next > page => {
                    if pages_fetched >= max_pages {
                        return Ok((issues, true));
                    }
                    page = next;
                }
                _ => return Ok((issues, false)),
            }
        }
    }

    async fn sync_issue(&self, issue: &Issue) -> Result<IssueResult, SyncError> {
        if footer::carries_provenance_of(&issue.labels, &self.target_host, self.ctx.target_instance.id) {
            debug!(source_issue_iid = issue.iid, "Issue originated on target, skipping");
            return Ok(IssueResult::Skipped { degraded: false });
        }

        let hash = footer::issue_content_hash(issue);
        let mapping = self
            .mappings
            .find_issue_mapping(self.ctx.config.id, issue.id)
            .await?;

        match mapping {
            None => self.create_path(issue, &hash).await,
            Some(_) if !self.ctx.config.update_existing => {
                Ok(IssueResult::Skipped { degraded: false })
            }
            Some(mapping)
                if mapping.source_content_hash == hash
                    && mapping.source_state == issue.state.as_str() =>
            {
                self.unchanged_path(issue, &mapping).await
            }
            Some(mapping) => self.update_path(issue, mapping, &hash).await,
        }
    }

    /// Content unchanged: pick up new comments, and rerun the whole tail for a `partial` mapping.
    async fn unchanged_path(
        &self,
        issue: &Issue,
        mapping: &issue_mapping::Model,
    ) -> Result<IssueResult, SyncError> {
        let degraded = if mapping.needs_tail_retry() {
            debug!(source_issue_iid = issue.iid, "Retrying incomplete tail");
            let ok = self.run_tail(issue, mapping.target_issue_iid, mapping.id, true).await?;
            !ok
        } else if self.ctx.config.sync_comments {
            match self.sync_comments(issue, mapping.target_issue_iid, mapping.id).await {
                Ok(()) => false,
                Err(err) => {
                    warn!(source_issue_iid = issue.iid, error = %err, "Comment sync failed");
                    self.mappings.set_status(mapping.id, MappingStatus::Partial).await?;
                    true
                }
            }
        } else {
            false
        };
        Ok(IssueResult::Skipped { degraded })
    }

    async fn create_path(&self, issue: &Issue, hash: &str) -> Result<IssueResult, SyncError> {
        let labels = self.desired_labels(issue).await?;
        let description =
            footer::compose_description(issue, issue.description_text(), self.source_path());

        let (target_issue, adopted) = match self.find_orphan(issue).await? {
            Some(orphan) => {
                info!(
                    source_issue_iid = issue.iid,
                    target_issue_iid = orphan.iid,
                    "Adopting orphaned target issue"
                );
                let update = IssueUpdate {
                    title: Some(issue.title.clone()),
                    description: Some(description),
                    labels: Some(labels),
                    weight: self.weight_for(issue),
                    state_event: self.state_event(issue.state, orphan.state),
                };
                let updated = self
                    .remote(Side::Target, "update_issue", || {
                        self.target.update_issue(self.target_project(), orphan.iid, &update)
                    })
                    .await?;
                (updated, true)
            }
            None => {
                let new_issue = NewIssue {
                    title: issue.title.clone(),
                    description,
                    labels,
                    weight: self.weight_for(issue),
                };
                let created = self
                    .remote(Side::Target, "create_issue", || {
                        self.target.create_issue(self.target_project(), &new_issue)
                    })
                    .await?;
                if let Some(event) = self.state_event(issue.state, created.state) {
                    self.set_state(created.iid, event).await?;
                }
                (created, false)
            }
        };

        self.reconcile_time(issue, &target_issue).await?;

        let mapping = self
            .mappings
            .insert_issue_mapping(NewIssueMapping {
                config_id: self.ctx.config.id,
                source_issue_id: issue.id,
                source_issue_iid: issue.iid,
                target_issue_id: target_issue.id,
                target_issue_iid: target_issue.iid,
                source_content_hash: hash.to_string(),
                source_state: issue.state.as_str().to_string(),
            })
            .await?;

        let ok = self.run_tail(issue, target_issue.iid, mapping.id, true).await?;
        info!(
            source_issue_iid = issue.iid,
            target_issue_iid = target_issue.iid,
            adopted,
            "Mirrored issue"
        );
        Ok(if adopted {
            IssueResult::Updated { degraded: !ok }
        } else {
            IssueResult::Created { degraded: !ok }
        })
    }

    async fn update_path(
        &self,
        issue: &Issue,
        mapping: issue_mapping::Model,
        hash: &str,
    ) -> Result<IssueResult, SyncError> {
        let existing = self
            .remote(Side::Target, "get_issue", || {
                self.target.get_issue(self.target_project(), mapping.target_issue_iid)
            })
            .await;

        let target_issue = match existing {
            Ok(target_issue) => target_issue,
            Err(err) if err.is_not_found() => {
                return self.recreate(issue, &mapping, hash).await;
            }
            Err(err) => return Err(err),
        };

        // Attachments first so the description is written once.
        let (body, attachments_ok) = if self.ctx.config.sync_attachments {
            self.sync_attachments(issue.description_text(), mapping.id).await?
        } else {
            (issue.description_text().to_string(), true)
        };

        let update = IssueUpdate {
            title: Some(issue.title.clone()),
            description: Some(footer::compose_description(issue, &body, self.source_path())),
            labels: Some(self.desired_labels(issue).await?),
            weight: self.weight_for(issue),
            state_event: self.state_event(issue.state, target_issue.state),
        };
        let updated = self
            .remote(Side::Target, "update_issue", || {
                self.target.update_issue(self.target_project(), target_issue.iid, &update)
            })
            .await?;
        self.reconcile_time(issue, &updated).await?;

        self.mappings
            .record_content(mapping.id, hash, issue.state.as_str())
            .await?;

        let comments_ok = self.run_tail(issue, updated.iid, mapping.id, false).await?;
        let degraded = !(attachments_ok && comments_ok);
        if degraded {
            self.mappings.set_status(mapping.id, MappingStatus::Partial).await?;
        }
        Ok(IssueResult::Updated { degraded })
    }

    /// The mapped target issue is gone; create a fresh one and re-point the mapping.
    async fn recreate(
        &self,
        issue: &Issue,
        mapping: &issue_mapping::Model,
        hash: &str,
    ) -> Result<IssueResult, SyncError> {
        warn!(
            source_issue_iid = issue.iid,
            target_issue_iid = mapping.target_issue_iid,
            "Mapped target issue no longer exists, recreating"
        );
        let new_issue = NewIssue {
            title: issue.title.clone(),
            description: footer::compose_description(
                issue,
                issue.description_text(),
                self.source_path(),
            ),
            labels: self.desired_labels(issue).await?,
            weight: self.weight_for(issue),
        };
        let created = self
            .remote(Side::Target, "create_issue", || {
                self.target.create_issue(self.target_project(), &new_issue)
            })
            .await?;
        if let Some(event) = self.state_event(issue.state, created.state) {
            self.set_state(created.iid, event).await?;
        }
        self.reconcile_time(issue, &created).await?;

        self.mappings
            .repoint(mapping.id, created.id, created.iid)
            .await?;
        self.mappings
            .record_content(mapping.id, hash, issue.state.as_str())
            .await?;

        let ok = self.run_tail(issue, created.iid, mapping.id, true).await?;
        Ok(IssueResult::Updated { degraded: !ok })
    }

    /// Attachments (optionally) then comments; promotes the mapping to
    /// `synced` or leaves it `partial`. Returns whether the tail succeeded.
    async fn run_tail(
        &self,
        issue: &Issue,
        target_iid: i64,
        mapping_id: Uuid,
        with_attachments: bool,
    ) -> Result<bool, SyncError> {
        let mut ok = true;

        if with_attachments && self.ctx.config.sync_attachments {
            let original = issue.description_text();
            let (body, attachments_ok) = self.sync_attachments(original, mapping_id).await?;
            ok &= attachments_ok;
            if body != original {
                let update = IssueUpdate {
                    description: Some(footer::compose_description(issue, &body, self.source_path())),
                    ..IssueUpdate::default()
                };
                if let Err(err) = self
                    .remote(Side::Target, "update_issue", || {
                        self.target.update_issue(self.target_project(), target_iid, &update)
                    })
                    .await
                {
                    warn!(source_issue_iid = issue.iid, error = %err, "Failed to write rewritten attachment links");
                    ok = false;
                }
            }
        }

        if self.ctx.config.sync_comments
            && let Err(err) = self.sync_comments(issue, target_iid, mapping_id).await
        {
            warn!(source_issue_iid = issue.iid, error = %err, "Comment sync failed");
            ok = false;
        }

        let status = if ok {
            MappingStatus::Synced
        } else {
            MappingStatus::Partial
        };
        self.mappings.set_status(mapping_id, status).await?;
        Ok(ok)
    }

    /// Mirror new and edited non-system notes. Mappings for every note that
    /// reached the target are committed together, even when a later note fails.
    async fn sync_comments(
        &self,
        issue: &Issue,
        target_iid: i64,
        mapping_id: Uuid,
    ) -> Result<(), SyncError> {
        let notes = self
            .remote(Side::Source, "get_issue_notes", || {
                self.source.get_issue_notes(self.source_project(), issue.iid)
            })
            .await?;
        let existing = self.mappings.comment_mappings(mapping_id).await?;

        let mut changes = Vec::new();
        let mut failure = None;
        for note in notes.iter().filter(|note| !note.system) {
            let hash = footer::note_hash(&note.body);
            let body = footer::comment_body(note);

            let result = match existing.get(&note.id) {
                Some(mapped) if mapped.source_content_hash == hash => continue,
                Some(mapped) => {
                    let updated = self
                        .remote(Side::Target, "update_issue_note", || {
                            self.target.update_issue_note(
                                self.target_project(),
                                target_iid,
                                mapped.target_note_id,
                                &body,
                            )
                        })
                        .await;
                    match updated {
                        Err(err) if err.is_not_found() => {
                            self.remote(Side::Target, "create_issue_note", || {
                                self.target
                                    .create_issue_note(self.target_project(), target_iid, &body)
                            })
                            .await
                        }
                        other => other,
                    }
                }
                None => {
                    self.remote(Side::Target, "create_issue_note", || {
                        self.target
                            .create_issue_note(self.target_project(), target_iid, &body)
                    })
                    .await
                }
            };

            match result {
                Ok(target_note) => changes.push(CommentMappingChange {
                    source_note_id: note.id,
                    target_note_id: target_note.id,
                    source_content_hash: hash,
                }),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        self.mappings
            .save_comment_mappings(mapping_id, &changes)
            .await?;
        if !changes.is_empty() {
            debug!(source_issue_iid = issue.iid, mirrored = changes.len(), "Mirrored comments");
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Copy referenced attachments to the target and rewrite their links.
    ///
    /// Returns the rewritten body and whether every attachment succeeded; a
    /// failed attachment keeps its original reference.
    async fn sync_attachments(
        &self,
        body: &str,
        mapping_id: Uuid,
    ) -> Result<(String, bool), SyncError> {
        let mut rewritten = body.to_string();
        let mut ok = true;
        let auth = SourceAuth {
            host: self.source_host.clone(),
            token: self.ctx.source_instance.api_token.clone(),
        };

        for raw in extract_attachment_urls(body) {
            if let Some(cached) = self.mappings.find_attachment(mapping_id, &raw).await? {
                rewritten = rewritten.replace(&raw, &cached.target_url);
                continue;
            }

            let url = match resolve_attachment_url(
                &raw,
                self.ctx.source_instance.base_url(),
                self.source_path(),
            ) {
                Ok(url) => url,
                Err(err) => {
                    warn!(url = %raw, error = %err, "Skipping unparseable attachment link");
                    ok = false;
                    continue;
                }
            };
            if host_key(&url) == self.target_host {
                continue;
            }

            match self.copy_attachment(&url, &auth).await {
                Ok((target_url, size)) => {
                    self.mappings
                        .insert_attachment(mapping_id, &raw, &target_url, &filename_from_url(&url), size)
                        .await?;
                    rewritten = rewritten.replace(&raw, &target_url);
                }
                Err(err) => {
                    warn!(url = %url, error = %err, "Attachment copy failed, keeping original link");
                    ok = false;
                }
            }
        }
        Ok((rewritten, ok))
    }

    async fn copy_attachment(
        &self,
        url: &url::Url,
        auth: &SourceAuth,
    ) -> Result<(String, i64), SyncError> {
        let file = self.fetcher.fetch(url, Some(auth)).await?;
        let size = file.bytes.len() as i64;
        let filename = file.filename;
        let bytes = file.bytes;
        let uploaded = self
            .remote(Side::Target, "upload_file", || {
                self.target
                    .upload_file(self.target_project(), &filename, bytes.clone())
            })
            .await?;
        Ok((uploaded.url, size))
    }

    /// Look for a target issue already carrying this issue's footer token.
    async fn find_orphan(&self, issue: &Issue) -> Result<Option<Issue>, SyncError> {
        let token = footer::source_token(self.source_path(), issue.iid);
        let query = IssueQuery {
            labels: vec![self.provenance_label()],
            search: Some(format!("{}#{}", self.source_path(), issue.iid)),
            state: IssueStateFilter::All,
            per_page: 20,
            ..IssueQuery::default()
        };
        let page = self
            .remote(Side::Target, "get_issues", || {
                self.target.get_issues(self.target_project(), &query)
            })
            .await?;
        Ok(page
            .items
            .into_iter()
            .find(|candidate| candidate.description_text().contains(&token)))
    }

    async fn load_label_cache(&self) -> Result<(), SyncError> {
        let labels = self
            .remote(Side::Target, "get_project_labels", || {
                self.target.get_project_labels(self.target_project())
            })
            .await?;
        let mut cache = self
            .label_cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        cache.clear();
        cache.extend(labels.into_iter().map(|label| label.name.to_lowercase()));
        Ok(())
    }

    async fn ensure_labels(&self, labels: &[String]) -> Result<(), SyncError> {
        for name in labels {
            let key = name.to_lowercase();
            let known = self
                .label_cache
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .contains(&key);
            if known {
                continue;
            }
            let color = footer::label_color(name);
            self.remote(Side::Target, "create_label", || {
                self.target.create_label(self.target_project(), name, &color)
            })
            .await?;
            self.label_cache
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .insert(key);
        }
        Ok(())
    }

    /// Provenance label, foreign provenance labels, source labels (when
    /// enabled) and PM-field labels, deduplicated case-insensitively.
    async fn desired_labels(&self, issue: &Issue) -> Result<Vec<String>, SyncError> {
        let mut labels = vec![self.provenance_label()];
        for label in &issue.labels {
            if self.ctx.config.sync_labels || footer::is_provenance_label(label) {
                labels.push(label.clone());
            }
        }
        labels.extend(footer::pm_labels(issue));

        let mut seen = HashSet::new();
        labels.retain(|label| seen.insert(label.to_lowercase()));
        self.ensure_labels(&labels).await?;
        Ok(labels)
    }

    fn weight_for(&self, issue: &Issue) -> Option<i64> {
        if self.ctx.config.sync_weight {
            issue.weight
        } else {
            None
        }
    }

    /// Close only when closed-issue sync is on; always reopen.
    fn state_event(&self, source: IssueState, target: IssueState) -> Option<StateEvent> {
        match (source, target) {
            (IssueState::Closed, IssueState::Opened) if self.ctx.config.sync_closed_issues => {
                Some(StateEvent::Close)
            }
            (IssueState::Opened, IssueState::Closed) => Some(StateEvent::Reopen),
            _ => None,
        }
    }

    async fn set_state(&self, target_iid: i64, event: StateEvent) -> Result<(), SyncError> {
        let update = IssueUpdate {
            state_event: Some(event),
            ..IssueUpdate::default()
        };
        self.remote(Side::Target, "update_issue", || {
            self.target.update_issue(self.target_project(), target_iid, &update)
        })
        .await?;
        Ok(())
    }

    async fn reconcile_time(&self, source: &Issue, target: &Issue) -> Result<(), SyncError> {
        let project = self.target_project();
        let iid = target.iid;

        if self.ctx.config.sync_time_estimate
            && source.time_stats.time_estimate != target.time_stats.time_estimate
        {
            let duration = footer::format_duration(source.time_stats.time_estimate);
            self.remote(Side::Target, "set_time_estimate", || {
                self.target.set_time_estimate(project, iid, &duration)
            })
            .await?;
        }

        if self.ctx.config.sync_time_spent
            && source.time_stats.total_time_spent != target.time_stats.total_time_spent
        {
            if target.time_stats.total_time_spent != 0 {
                self.remote(Side::Target, "reset_time_spent", || {
                    self.target.reset_time_spent(project, iid)
                })
                .await?;
            }
            if source.time_stats.total_time_spent > 0 {
                let duration = footer::format_duration(source.time_stats.total_time_spent);
                self.remote(Side::Target, "add_time_spent", || {
                    self.target.add_time_spent(project, iid, &duration)
                })
                .await?;
            }
        }
        Ok(())
    }
}
