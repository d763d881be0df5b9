//! End-to-end engine runs against in-memory GitLab fakes and SQLite.

mod test_utils;

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use issue_mirror::config::AppConfig;
use issue_mirror::gitlab::{GitLabErrorKind, IssueState, Milestone, TimeStats};
use issue_mirror::models::issue_mapping;
use issue_mirror::models::mirror_issue_config::SyncStatus;
use issue_mirror::repositories::MappingRepository;
use issue_mirror::resilience::{CircuitBreakerRegistry, CircuitState};
use issue_mirror::sync::footer;
use issue_mirror::sync::{EngineDeps, IssueSyncEngine, SyncOutcome};
use sea_orm::{DatabaseConnection, Set};
use tokio_util::sync::CancellationToken;

use test_utils::{
    FakeFetcher, FakeGitLab, MirrorFixture, SOURCE_PATH, SOURCE_PROJECT, SOURCE_URL,
    TARGET_PROJECT, TARGET_URL, forbidden, issue, load_config, load_context, note, rate_limited,
    seed_default_mirror, setup_test_db, test_config, transient, update_config,
};

struct Harness {
    db: DatabaseConnection,
    fixture: MirrorFixture,
    source: Arc<FakeGitLab>,
    target: Arc<FakeGitLab>,
    fetcher: Arc<FakeFetcher>,
    breakers: Arc<CircuitBreakerRegistry>,
    config: Arc<AppConfig>,
}

impl Harness {
    async fn new() -> Result<Self> {
        Self::with_config(test_config()).await
    }

    async fn with_config(config: AppConfig) -> Result<Self> {
        let db = setup_test_db().await?;
        let fixture = seed_default_mirror(&db).await?;
        Ok(Self {
            breakers: Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone())),
            config: Arc::new(config),
            source: FakeGitLab::new(SOURCE_URL),
            target: FakeGitLab::new(TARGET_URL),
            fetcher: FakeFetcher::new(),
            fixture,
            db,
        })
    }

    fn config_id(&self) -> i32 {
        self.fixture.config.id
    }

    async fn engine(&self, cancel: CancellationToken) -> Result<IssueSyncEngine> {
        let ctx = load_context(&self.db, self.config_id()).await?;
        Ok(IssueSyncEngine::new(
            ctx,
            EngineDeps {
                db: self.db.clone(),
                source: self.source.clone(),
                target: self.target.clone(),
                breakers: self.breakers.clone(),
                fetcher: self.fetcher.clone(),
                config: self.config.clone(),
                cancel,
            },
        ))
    }

    async fn run(&self) -> Result<SyncOutcome> {
        Ok(self.engine(CancellationToken::new()).await?.sync().await?)
    }

    async fn mappings(&self) -> Result<Vec<issue_mapping::Model>> {
        Ok(MappingRepository::new(self.db.clone())
            .list_issue_mappings(self.config_id())
            .await?)
    }

    async fn last_sync_at(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(load_config(&self.db, self.config_id())
            .await?
            .last_sync_at
            .map(|at| at.with_timezone(&Utc)))
    }
}

fn provenance() -> String {
    footer::provenance_label("gitlab-a.example.com")
}

fn at_hour(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 15, hour, 0, 0).unwrap()
}

#[tokio::test]
async fn mirrors_new_issue_with_comments_labels_and_time() -> Result<()> {
    let h = Harness::new().await?;
    let mut bug = issue(SOURCE_PROJECT, 1, "Bug X");
    bug.labels = vec!["bug".to_string()];
    bug.weight = Some(3);
    bug.milestone = Some(Milestone {
        id: 9,
        title: "v1.0".to_string(),
    });
    bug.time_stats = TimeStats {
        time_estimate: 3600,
        total_time_spent: 1800,
    };
    h.source.put_issue(bug);
    h.source.put_note(SOURCE_PROJECT, 1, note(1, "alice", "Reproduced on main"));

    let outcome = h.run().await?;

    assert_eq!(outcome.counters.processed, 1);
    assert_eq!(outcome.counters.created, 1);
    assert_eq!(outcome.status(), SyncStatus::Success);
    assert!(!outcome.baseline);

    let mirrored = h.target.issues(TARGET_PROJECT);
    assert_eq!(mirrored.len(), 1);
    let target = &mirrored[0];
    assert_eq!(target.title, "Bug X");
    assert_eq!(target.weight, Some(3));
    assert!(target.labels.contains(&provenance()));
    assert!(target.labels.contains(&"bug".to_string()));
    assert!(target.labels.contains(&"Milestone::v1.0".to_string()));
    let description = target.description_text();
    assert!(description.starts_with("Description of Bug X"));
    assert!(description.contains(&footer::source_token(SOURCE_PATH, 1)));
    assert!(description.contains("**Milestone:** v1.0"));
    assert_eq!(target.time_stats.time_estimate, 3600);
    assert_eq!(target.time_stats.total_time_spent, 1800);

    let notes = h.target.notes(TARGET_PROJECT, target.iid);
    assert_eq!(notes.len(), 1);
    assert!(notes[0].body.starts_with("**@alice** commented on"));
    assert!(notes[0].body.ends_with("Reproduced on main"));

    let labels = h.target.label_names(TARGET_PROJECT);
    assert!(labels.contains(&provenance()));
    assert!(labels.contains(&"bug".to_string()));

    let mappings = h.mappings().await?;
    assert_eq!(mappings.len(), 1);
    assert_eq!(mappings[0].source_issue_iid, 1);
    assert_eq!(mappings[0].target_issue_iid, target.iid);
    assert_eq!(mappings[0].sync_status, "synced");

    assert!(h.last_sync_at().await?.is_some());
    Ok(())
}

#[tokio::test]
async fn rerun_without_content_change_writes_nothing() -> Result<()> {
    let h = Harness::new().await?;
    h.source.put_issue(issue(SOURCE_PROJECT, 1, "Bug X"));
    h.source.put_note(SOURCE_PROJECT, 1, note(1, "alice", "first"));
    h.run().await?;

    h.source.touch(SOURCE_PROJECT, 1);
    h.target.clear_calls();
    let outcome = h.run().await?;

    assert_eq!(outcome.counters.processed, 1);
    assert_eq!(outcome.counters.skipped, 1);
    assert_eq!(outcome.counters.created, 0);
    assert_eq!(h.target.call_count("create_issue"), 0);
    assert_eq!(h.target.call_count("update_issue"), 0);
    assert_eq!(h.target.call_count("create_issue_note"), 0);
    assert_eq!(h.target.issues(TARGET_PROJECT).len(), 1);
    Ok(())
}

#[tokio::test]
async fn edited_source_issue_updates_target_in_place() -> Result<()> {
    let h = Harness::new().await?;
    h.source.put_issue(issue(SOURCE_PROJECT, 1, "Bug X"));
    h.run().await?;
    let before = h.mappings().await?;

    h.source.edit_issue(SOURCE_PROJECT, 1, |issue| {
        issue.title = "Bug X: crash on save".to_string();
        issue.description = Some("Now with a stack trace".to_string());
    });
    let outcome = h.run().await?;

    assert_eq!(outcome.counters.updated, 1);
    let mirrored = h.target.issues(TARGET_PROJECT);
    assert_eq!(mirrored.len(), 1);
    assert_eq!(mirrored[0].title, "Bug X: crash on save");
    assert!(mirrored[0].description_text().starts_with("Now with a stack trace"));
    // Exactly one footer survives the rewrite.
    assert_eq!(
        mirrored[0].description_text().matches(footer::FOOTER_START).count(),
        1
    );

    let after = h.mappings().await?;
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].id, before[0].id);
    assert_ne!(after[0].source_content_hash, before[0].source_content_hash);
    Ok(())
}

#[tokio::test]
async fn issues_mirrored_from_target_are_never_sent_back() -> Result<()> {
    let h = Harness::new().await?;
    let mut echoed = issue(SOURCE_PROJECT, 1, "Came from B");
    echoed.labels = vec![footer::provenance_label("gitlab-b.example.com")];
    h.source.put_issue(echoed);
    let mut legacy = issue(SOURCE_PROJECT, 2, "Came from B long ago");
    legacy.labels = vec![footer::legacy_provenance_label(
        h.fixture.target_instance.id,
    )];
    h.source.put_issue(legacy);
    h.source.put_issue(issue(SOURCE_PROJECT, 3, "Native to A"));

    let outcome = h.run().await?;

    assert_eq!(outcome.counters.processed, 3);
    assert_eq!(outcome.counters.skipped, 2);
    assert_eq!(outcome.counters.created, 1);
    let mirrored = h.target.issues(TARGET_PROJECT);
    assert_eq!(mirrored.len(), 1);
    assert_eq!(mirrored[0].title, "Native to A");
    Ok(())
}

#[tokio::test]
async fn foreign_provenance_labels_are_replicated_and_kept() -> Result<()> {
    let h = Harness::new().await?;
    update_config(&h.db, h.config_id(), |c| c.sync_labels = Set(false)).await?;
    let upstream = footer::provenance_label("gitlab-c.example.com");
    let mut relayed = issue(SOURCE_PROJECT, 1, "Came from C");
    relayed.labels = vec![upstream.clone(), "bug".to_string()];
    h.source.put_issue(relayed);

    let outcome = h.run().await?;

    assert_eq!(outcome.counters.created, 1);
    assert_eq!(outcome.counters.skipped, 0);
    let mirrored = h.target.issues(TARGET_PROJECT);
    assert_eq!(mirrored.len(), 1);
    let mut labels = mirrored[0].labels.clone();
    labels.sort();
    assert_eq!(labels, vec![provenance(), upstream]);
    Ok(())
}

#[tokio::test]
async fn backfill_config_rescans_issues_older_than_checkpoint() -> Result<()> {
    let h = Harness::new().await?;
    h.source.put_issue(issue(SOURCE_PROJECT, 1, "Seen first"));
    h.run().await?;
    assert!(h.last_sync_at().await? > Some(Utc::now() - chrono::Duration::minutes(5)));

    // Older than the checkpoint, so an incremental fetch would never return it.
    h.source.put_issue(issue(SOURCE_PROJECT, 2, "Imported late"));
    let outcome = h.run().await?;

    assert_eq!(outcome.counters.processed, 2);
    assert_eq!(outcome.counters.created, 1);
    assert_eq!(outcome.counters.skipped, 1);
    assert_eq!(h.target.issues(TARGET_PROJECT).len(), 2);
    Ok(())
}

#[tokio::test]
async fn incremental_config_only_fetches_since_checkpoint() -> Result<()> {
    let h = Harness::new().await?;
    update_config(&h.db, h.config_id(), |c| {
        c.sync_existing_issues = Set(false);
        c.last_sync_at = Set(Some((Utc::now() - chrono::Duration::minutes(10)).fixed_offset()));
    })
    .await?;
    h.source.put_issue(issue(SOURCE_PROJECT, 1, "Stale"));
    h.source.put_issue(issue(SOURCE_PROJECT, 2, "Fresh"));
    h.source.touch(SOURCE_PROJECT, 2);

    let outcome = h.run().await?;

    assert_eq!(outcome.counters.processed, 1);
    assert_eq!(h.target.issues(TARGET_PROJECT)[0].title, "Fresh");
    Ok(())
}

#[tokio::test]
async fn lost_mapping_is_recovered_from_the_mirrored_issue() -> Result<()> {
    let h = Harness::new().await?;
    h.source.put_issue(issue(SOURCE_PROJECT, 4, "Mapping row lost"));
    h.run().await?;
    let original = h.mappings().await?;
    assert_eq!(original.len(), 1);

    MappingRepository::new(h.db.clone())
        .delete_issue_mapping(original[0].id)
        .await?;
    h.target.clear_calls();
    let outcome = h.run().await?;

    assert_eq!(outcome.counters.updated, 1);
    assert_eq!(h.target.call_count("create_issue"), 0);
    assert_eq!(h.target.issues(TARGET_PROJECT).len(), 1);
    let recovered = h.mappings().await?;
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].target_issue_iid, original[0].target_issue_iid);
    Ok(())
}

#[tokio::test]
async fn orphaned_target_issue_is_adopted_instead_of_duplicated() -> Result<()> {
    let h = Harness::new().await?;
    let source_issue = issue(SOURCE_PROJECT, 7, "Lost mapping");
    h.source.put_issue(source_issue.clone());

    // A previous run created the target issue but died before writing the mapping.
    let mut orphan = issue(TARGET_PROJECT, 1, "Lost mapping (stale)");
    orphan.description = Some(footer::compose_description(
        &source_issue,
        source_issue.description_text(),
        SOURCE_PATH,
    ));
    orphan.labels = vec![provenance()];
    h.target.put_issue(orphan);

    let outcome = h.run().await?;

    assert_eq!(outcome.counters.updated, 1);
    assert_eq!(outcome.counters.created, 0);
    assert_eq!(h.target.call_count("create_issue"), 0);
    let mirrored = h.target.issues(TARGET_PROJECT);
    assert_eq!(mirrored.len(), 1);
    assert_eq!(mirrored[0].title, "Lost mapping");

    let mappings = h.mappings().await?;
    assert_eq!(mappings.len(), 1);
    assert_eq!(mappings[0].target_issue_iid, 1);
    Ok(())
}

#[tokio::test]
async fn close_and_reopen_follow_the_source() -> Result<()> {
    let h = Harness::new().await?;
    let mut closed = issue(SOURCE_PROJECT, 1, "Already fixed");
    closed.state = IssueState::Closed;
    h.source.put_issue(closed);

    h.run().await?;
    let target_iid = h.mappings().await?[0].target_issue_iid;
    assert_eq!(
        h.target.issue(TARGET_PROJECT, target_iid).map(|i| i.state),
        Some(IssueState::Closed)
    );

    h.source
        .edit_issue(SOURCE_PROJECT, 1, |issue| issue.state = IssueState::Opened);
    let outcome = h.run().await?;

    assert_eq!(outcome.counters.updated, 1);
    assert_eq!(
        h.target.issue(TARGET_PROJECT, target_iid).map(|i| i.state),
        Some(IssueState::Opened)
    );
    assert_eq!(h.mappings().await?[0].source_state, "opened");
    Ok(())
}

#[tokio::test]
async fn closed_issues_are_ignored_when_disabled() -> Result<()> {
    let h = Harness::new().await?;
    update_config(&h.db, h.config_id(), |c| c.sync_closed_issues = Set(false)).await?;
    let mut closed = issue(SOURCE_PROJECT, 1, "Closed upstream");
    closed.state = IssueState::Closed;
    h.source.put_issue(closed);
    h.source.put_issue(issue(SOURCE_PROJECT, 2, "Still open"));

    let outcome = h.run().await?;

    assert_eq!(outcome.counters.processed, 1);
    let mirrored = h.target.issues(TARGET_PROJECT);
    assert_eq!(mirrored.len(), 1);
    assert_eq!(mirrored[0].title, "Still open");
    Ok(())
}

#[tokio::test]
async fn deleted_target_issue_is_recreated_and_remapped() -> Result<()> {
    let h = Harness::new().await?;
    h.source.put_issue(issue(SOURCE_PROJECT, 1, "Bug X"));
    h.run().await?;
    let original = h.mappings().await?[0].clone();

    h.target.remove_issue(TARGET_PROJECT, original.target_issue_iid);
    h.source
        .edit_issue(SOURCE_PROJECT, 1, |issue| issue.title = "Bug X (edited)".to_string());
    let outcome = h.run().await?;

    assert_eq!(outcome.counters.updated, 1);
    assert_eq!(outcome.counters.failed, 0);
    let mappings = h.mappings().await?;
    assert_eq!(mappings.len(), 1);
    assert_eq!(mappings[0].id, original.id);
    assert_ne!(mappings[0].target_issue_iid, original.target_issue_iid);
    let recreated = h
        .target
        .issue(TARGET_PROJECT, mappings[0].target_issue_iid)
        .expect("recreated issue exists");
    assert_eq!(recreated.title, "Bug X (edited)");
    Ok(())
}

#[tokio::test]
async fn failed_comment_tail_leaves_partial_mapping_and_is_retried() -> Result<()> {
    let h = Harness::new().await?;
    h.source.put_issue(issue(SOURCE_PROJECT, 1, "Bug X"));
    h.source.put_note(SOURCE_PROJECT, 1, note(1, "alice", "first"));
    h.target
        .fail_next("create_issue_note", forbidden("create_issue_note"));

    let outcome = h.run().await?;

    assert_eq!(outcome.counters.created, 1);
    assert_eq!(outcome.degraded, 1);
    assert_eq!(outcome.status(), SyncStatus::Partial);
    assert_eq!(h.mappings().await?[0].sync_status, "partial");
    let target_iid = h.mappings().await?[0].target_issue_iid;
    assert!(h.target.notes(TARGET_PROJECT, target_iid).is_empty());

    h.source.touch(SOURCE_PROJECT, 1);
    let retry = h.run().await?;

    assert_eq!(retry.counters.skipped, 1);
    assert_eq!(retry.degraded, 0);
    assert_eq!(retry.status(), SyncStatus::Success);
    assert_eq!(h.mappings().await?[0].sync_status, "synced");
    assert_eq!(h.target.notes(TARGET_PROJECT, target_iid).len(), 1);
    assert_eq!(h.target.issues(TARGET_PROJECT).len(), 1);
    Ok(())
}

#[tokio::test]
async fn edited_comments_update_their_mirror_and_system_notes_are_skipped() -> Result<()> {
    let h = Harness::new().await?;
    h.source.put_issue(issue(SOURCE_PROJECT, 1, "Bug X"));
    h.source.put_note(SOURCE_PROJECT, 1, note(1, "alice", "first draft"));
    let mut system = note(2, "bot", "changed the description");
    system.system = true;
    h.source.put_note(SOURCE_PROJECT, 1, system);
    h.run().await?;

    let target_iid = h.mappings().await?[0].target_issue_iid;
    assert_eq!(h.target.notes(TARGET_PROJECT, target_iid).len(), 1);

    h.source
        .put_note(SOURCE_PROJECT, 1, note(1, "alice", "final wording"));
    h.source.put_note(SOURCE_PROJECT, 1, note(3, "bob", "+1"));
    h.source.touch(SOURCE_PROJECT, 1);
    h.run().await?;

    let notes = h.target.notes(TARGET_PROJECT, target_iid);
    assert_eq!(notes.len(), 2);
    assert!(notes[0].body.ends_with("final wording"));
    assert!(notes[1].body.starts_with("**@bob**"));
    assert_eq!(h.target.call_count("update_issue_note"), 1);
    Ok(())
}

#[tokio::test]
async fn time_spent_is_reset_before_being_replayed() -> Result<()> {
    let h = Harness::new().await?;
    let mut tracked = issue(SOURCE_PROJECT, 1, "Tracked");
    tracked.time_stats = TimeStats {
        time_estimate: 5400,
        total_time_spent: 1800,
    };
    h.source.put_issue(tracked);
    h.run().await?;

    h.source.edit_issue(SOURCE_PROJECT, 1, |issue| {
        issue.time_stats.total_time_spent = 2700;
    });
    h.run().await?;

    let target_iid = h.mappings().await?[0].target_issue_iid;
    let calls: Vec<(String, String)> = h
        .target
        .time_calls()
        .into_iter()
        .filter(|(iid, _, _)| *iid == target_iid)
        .map(|(_, op, duration)| (op, duration))
        .collect();
    assert_eq!(
        calls,
        vec![
            ("estimate".to_string(), "1h30m".to_string()),
            ("spent".to_string(), "30m".to_string()),
            ("reset".to_string(), String::new()),
            ("spent".to_string(), "45m".to_string()),
        ]
    );
    let target = h.target.issue(TARGET_PROJECT, target_iid).expect("target");
    assert_eq!(target.time_stats.total_time_spent, 2700);
    Ok(())
}

#[tokio::test]
async fn update_existing_off_leaves_mirrored_issues_alone() -> Result<()> {
    let h = Harness::new().await?;
    h.source.put_issue(issue(SOURCE_PROJECT, 1, "Bug X"));
    h.run().await?;

    update_config(&h.db, h.config_id(), |c| c.update_existing = Set(false)).await?;
    h.source
        .edit_issue(SOURCE_PROJECT, 1, |issue| issue.title = "Renamed".to_string());
    let outcome = h.run().await?;

    assert_eq!(outcome.counters.skipped, 1);
    assert_eq!(h.target.issues(TARGET_PROJECT)[0].title, "Bug X");
    Ok(())
}

#[tokio::test]
async fn attachments_are_copied_once_and_links_rewritten() -> Result<()> {
    let h = Harness::new().await?;
    update_config(&h.db, h.config_id(), |c| c.sync_attachments = Set(true)).await?;
    let mut with_image = issue(SOURCE_PROJECT, 1, "Broken layout");
    with_image.description =
        Some("See ![shot](/uploads/abc123/shot.png) for details".to_string());
    h.source.put_issue(with_image);
    h.fetcher.serve(
        "https://gitlab-a.example.com/group/app/uploads/abc123/shot.png",
        b"\x89PNG fake image",
    );

    let outcome = h.run().await?;
    assert_eq!(outcome.status(), SyncStatus::Success);

    let requests = h.fetcher.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].1.as_deref(), Some("gitlab-a.example.com"));
    let uploads = h.target.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].1, "shot.png");

    let target = &h.target.issues(TARGET_PROJECT)[0];
    assert!(!target.description_text().contains("/uploads/abc123/shot.png"));
    assert!(target.description_text().contains("/shot.png)"));

    // A later edit reuses the recorded copy.
    h.source.edit_issue(SOURCE_PROJECT, 1, |issue| {
        issue.description = Some(format!("{}\n\nUpdated", issue.description_text()));
    });
    let outcome = h.run().await?;
    assert_eq!(outcome.counters.updated, 1);
    assert_eq!(h.fetcher.requests().len(), 1);
    assert_eq!(h.target.uploads().len(), 1);
    Ok(())
}

#[tokio::test]
async fn unavailable_attachment_keeps_original_link_and_marks_partial() -> Result<()> {
    let h = Harness::new().await?;
    update_config(&h.db, h.config_id(), |c| c.sync_attachments = Set(true)).await?;
    let mut with_link = issue(SOURCE_PROJECT, 1, "Missing file");
    with_link.description = Some("[log](https://files.example.net/build.log)".to_string());
    h.source.put_issue(with_link);

    let outcome = h.run().await?;

    assert_eq!(outcome.counters.created, 1);
    assert_eq!(outcome.degraded, 1);
    assert_eq!(h.mappings().await?[0].sync_status, "partial");
    let target = &h.target.issues(TARGET_PROJECT)[0];
    assert!(target
        .description_text()
        .contains("https://files.example.net/build.log"));
    assert_eq!(
        h.fetcher.requests()[0].0,
        "https://files.example.net/build.log"
    );
    Ok(())
}

#[tokio::test]
async fn per_issue_failures_do_not_stop_the_run() -> Result<()> {
    let h = Harness::new().await?;
    h.source.put_issue(issue(SOURCE_PROJECT, 1, "First"));
    h.source.put_issue(issue(SOURCE_PROJECT, 2, "Second"));
    h.target.fail_next("create_issue", transient("create_issue"));

    let outcome = h.run().await?;

    assert_eq!(outcome.counters.processed, 2);
    assert_eq!(outcome.counters.failed, 1);
    assert_eq!(outcome.counters.created, 1);
    assert_eq!(outcome.status(), SyncStatus::Partial);
    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(outcome.errors[0].kind, Some(GitLabErrorKind::Transient));
    assert!(outcome.summary_error().is_some());
    Ok(())
}

#[tokio::test]
async fn rate_limited_writes_are_retried() -> Result<()> {
    let h = Harness::new().await?;
    h.source.put_issue(issue(SOURCE_PROJECT, 1, "Bug X"));
    h.target.fail_next("create_issue", rate_limited("create_issue"));

    let outcome = h.run().await?;

    assert_eq!(outcome.counters.created, 1);
    assert_eq!(h.target.call_count("create_issue"), 2);
    assert_eq!(h.target.issues(TARGET_PROJECT).len(), 1);
    Ok(())
}

#[tokio::test]
async fn repeated_transient_failures_open_the_target_circuit() -> Result<()> {
    let mut config = test_config();
    config.circuit_breaker.failure_threshold = 2;
    config.circuit_breaker.recovery_timeout_seconds = 300;
    let h = Harness::with_config(config).await?;
    for iid in 1..=3 {
        h.source
            .put_issue(issue(SOURCE_PROJECT, iid, &format!("Issue {iid}")));
    }
    // Consecutive failures of the orphan search, before any success resets the count.
    h.target
        .fail_times("get_issues", 2, transient("get_issues"));

    let outcome = h.run().await?;

    assert_eq!(outcome.counters.failed, 3);
    assert_eq!(outcome.status(), SyncStatus::Failed);
    assert!(outcome.errors[2].error.contains("circuit"));
    assert_eq!(
        h.breakers.for_instance(TARGET_URL).state(),
        CircuitState::Open
    );
    assert_eq!(
        h.breakers.for_instance(SOURCE_URL).state(),
        CircuitState::Closed
    );
    assert!(h.target.issues(TARGET_PROJECT).is_empty());
    Ok(())
}

#[tokio::test]
async fn first_run_without_backfill_only_records_a_baseline() -> Result<()> {
    let h = Harness::new().await?;
    update_config(&h.db, h.config_id(), |c| c.sync_existing_issues = Set(false)).await?;
    h.source.put_issue(issue(SOURCE_PROJECT, 1, "Pre-existing"));

    let outcome = h.run().await?;

    assert!(outcome.baseline);
    assert_eq!(outcome.counters.processed, 0);
    assert_eq!(h.source.call_count("get_issues"), 0);
    assert!(h.target.issues(TARGET_PROJECT).is_empty());
    assert!(h.last_sync_at().await?.is_some());

    // Only issues touched after the baseline are picked up.
    h.source.put_issue(issue(SOURCE_PROJECT, 2, "New"));
    h.source.touch(SOURCE_PROJECT, 2);
    let outcome = h.run().await?;
    assert_eq!(outcome.counters.created, 1);
    assert_eq!(h.target.issues(TARGET_PROJECT)[0].title, "New");
    Ok(())
}

#[tokio::test]
async fn capped_run_checkpoints_high_water_mark_and_resumes() -> Result<()> {
    let mut config = test_config();
    config.issue_sync.max_issues_per_sync = 2;
    let h = Harness::with_config(config).await?;
    update_config(&h.db, h.config_id(), |c| {
        c.sync_existing_issues = Set(false);
        c.last_sync_at = Set(Some(at_hour(7).fixed_offset()));
    })
    .await?;
    for (iid, hour) in [(1, 8), (2, 9), (3, 10)] {
        let mut item = issue(SOURCE_PROJECT, iid, &format!("Issue {iid}"));
        item.updated_at = at_hour(hour);
        h.source.put_issue(item);
    }

    let outcome = h.run().await?;

    assert!(outcome.capped);
    assert_eq!(outcome.counters.created, 2);
    assert_eq!(h.last_sync_at().await?, Some(at_hour(9)));

    let outcome = h.run().await?;

    assert!(!outcome.capped);
    assert_eq!(outcome.counters.created, 1);
    assert_eq!(outcome.counters.skipped, 1);
    assert_eq!(h.target.issues(TARGET_PROJECT).len(), 3);
    assert!(h.last_sync_at().await? > Some(at_hour(10)));
    Ok(())
}

#[tokio::test]
async fn page_cap_stops_pagination() -> Result<()> {
    let mut config = test_config();
    config.issue_sync.per_page = 1;
    config.issue_sync.max_pages_per_request = 2;
    let h = Harness::with_config(config).await?;
    for iid in 1..=3 {
        h.source
            .put_issue(issue(SOURCE_PROJECT, iid, &format!("Issue {iid}")));
    }

    let outcome = h.run().await?;

    assert!(outcome.capped);
    assert_eq!(outcome.counters.processed, 2);
    assert_eq!(h.source.call_count("get_issues"), 2);
    Ok(())
}

#[tokio::test]
async fn cancelled_run_stops_before_the_next_issue() -> Result<()> {
    let h = Harness::new().await?;
    h.source.put_issue(issue(SOURCE_PROJECT, 1, "Never mirrored"));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = h.engine(cancel).await?.sync().await?;

    assert!(outcome.cancelled);
    assert_eq!(outcome.counters.processed, 0);
    assert_eq!(outcome.status(), SyncStatus::Failed);
    assert_eq!(
        outcome.summary_error().as_deref(),
        Some("interrupted by shutdown")
    );
    assert!(h.target.issues(TARGET_PROJECT).is_empty());
    assert_eq!(h.last_sync_at().await?, None);
    Ok(())
}
