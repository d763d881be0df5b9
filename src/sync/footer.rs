//! Provenance footer, provenance labels and content hashing for mirrored issues.
//!
//! A mirrored description is the source body with any earlier footer removed,
//! followed by one footer block:
//!
//! ```text
//! <source body>
//!
//! ---
//! <!-- issue-mirror:footer -->
//! *Mirrored from [group/project#12](https://src/group/project/-/issues/12)*
//!
//! - **Milestone:** v1.2
//! - **Assignees:** @alice, @bob
//!
//! <!-- issue-mirror:source=group/project#12 -->
//! <!-- /issue-mirror:footer -->
//! ```
//!
//! The `source=` token is what orphan recovery searches for.

use sha2::{Digest, Sha256};

use crate::gitlab::{Issue, Note};

pub const FOOTER_START: &str = "<!-- issue-mirror:footer -->";
pub const FOOTER_END: &str = "<!-- /issue-mirror:footer -->";
const FOOTER_SEPARATOR: &str = "\n\n---\n";

pub const PROVENANCE_PREFIX: &str = "Mirrored-From::";
pub const PROVENANCE_LABEL_COLOR: &str = "#6699cc";

/// Canonical marker embedding `source_project_path#source_iid`.
pub fn source_token(source_project_path: &str, source_iid: i64) -> String {
    format!("<!-- issue-mirror:source={source_project_path}#{source_iid} -->")
}

pub fn provenance_label(host_identity: &str) -> String {
    format!("{PROVENANCE_PREFIX}{host_identity}")
}

/// Label format used before host identities, keyed by local instance id.
pub fn legacy_provenance_label(instance_id: i32) -> String {
    format!("{PROVENANCE_PREFIX}instance-{instance_id}")
}

pub fn is_provenance_label(label: &str) -> bool {
    label.starts_with(PROVENANCE_PREFIX)
}

/// Whether `labels` mark an issue as mirrored from the instance identified by
/// `host_identity` (or, in the legacy format, by `instance_id`).
pub fn carries_provenance_of(labels: &[String], host_identity: &str, instance_id: i32) -> bool {
    let current = provenance_label(host_identity);
    let legacy = legacy_provenance_label(instance_id);
    labels
        .iter()
        .any(|label| label.eq_ignore_ascii_case(&current) || label == &legacy)
}

/// Source body without a previously appended footer.
pub fn strip_footer(description: &str) -> &str {
    let Some(start) = description.find(FOOTER_START) else {
        return description.trim_end();
    };
    let body = &description[..start];
    let body = body.strip_suffix(FOOTER_SEPARATOR).unwrap_or(body);
    body.trim_end()
}

/// Footer prose for `issue`, including the orphan-search token.
pub fn render_footer(issue: &Issue, source_project_path: &str) -> String {
    let mut footer = String::new();
    footer.push_str(FOOTER_SEPARATOR);
    footer.push_str(FOOTER_START);
    footer.push('\n');
    footer.push_str(&format!(
        "*Mirrored from [{}#{}]({})*\n",
        source_project_path, issue.iid, issue.web_url
    ));

    let mut fields = Vec::new();
    if let Some(milestone) = &issue.milestone {
        fields.push(format!("- **Milestone:** {}", milestone.title));
    }
    if let Some(iteration) = &issue.iteration {
        fields.push(format!("- **Iteration:** {}", iteration.display_name()));
    }
    if let Some(epic) = &issue.epic {
        fields.push(format!("- **Epic:** &{} {}", epic.iid, epic.title));
    }
    if !issue.assignees.is_empty() {
        let names: Vec<String> = issue
            .assignees
            .iter()
            .map(|user| format!("@{}", user.username))
            .collect();
        fields.push(format!("- **Assignees:** {}", names.join(", ")));
    }
    if !fields.is_empty() {
        footer.push('\n');
        footer.push_str(&fields.join("\n"));
        footer.push('\n');
    }

    footer.push('\n');
    footer.push_str(&source_token(source_project_path, issue.iid));
    footer.push('\n');
    footer.push_str(FOOTER_END);
    footer
}

/// Target description for a source issue whose body has already had its
/// attachment references rewritten.
pub fn compose_description(issue: &Issue, body: &str, source_project_path: &str) -> String {
    let body = strip_footer(body);
    format!("{}{}", body, render_footer(issue, source_project_path))
}

/// `Key::Value` labels echoing project-management fields.
pub fn pm_labels(issue: &Issue) -> Vec<String> {
    let mut labels = Vec::new();
    if let Some(milestone) = &issue.milestone {
        labels.push(format!("Milestone::{}", milestone.title));
    }
    if let Some(iteration) = &issue.iteration {
        labels.push(format!("Iteration::{}", iteration.display_name()));
    }
    if let Some(epic) = &issue.epic {
        labels.push(format!("Epic::{}", epic.title));
    }
    for assignee in &issue.assignees {
        labels.push(format!("Assignee::{}", assignee.username));
    }
    labels
}

/// Hash over every replicated issue field except open/closed state, which is
/// tracked separately on the mapping.
pub fn issue_content_hash(issue: &Issue) -> String {
    let mut labels = issue.labels.clone();
    labels.sort();

    let labels = labels.join(",");
    let weight = issue.weight.map(|w| w.to_string()).unwrap_or_default();
    let estimate = issue.time_stats.time_estimate.to_string();
    let spent = issue.time_stats.total_time_spent.to_string();
    let pm = pm_labels(issue).join(",");

    let mut hasher = Sha256::new();
    let parts: [&str; 7] = [
        &issue.title,
        strip_footer(issue.description_text()),
        &labels,
        &weight,
        &estimate,
        &spent,
        &pm,
    ];
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    hex::encode(hasher.finalize())
}

pub fn note_hash(body: &str) -> String {
    hex::encode(Sha256::digest(body.as_bytes()))
}

/// Mirrored note body with source author attribution.
pub fn comment_body(note: &Note) -> String {
    format!(
        "**@{}** commented on {}:\n\n{}",
        note.author.username,
        note.created_at.format("%Y-%m-%d %H:%M UTC"),
        note.body
    )
}

/// GitLab duration string using `h`, `m` and `s` units only, so GitLab's
/// 8-hour working day never applies.
pub fn format_duration(seconds: i64) -> String {
    if seconds <= 0 {
        return "0s".to_string();
    }
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{hours}h"));
    }
    if minutes > 0 {
        out.push_str(&format!("{minutes}m"));
    }
    if secs > 0 {
        out.push_str(&format!("{secs}s"));
    }
    out
}

/// Stable colour for labels created on the target.
pub fn label_color(name: &str) -> String {
    if is_provenance_label(name) {
        return PROVENANCE_LABEL_COLOR.to_string();
    }
    let digest = Sha256::digest(name.as_bytes());
    format!("#{}", hex::encode(&digest[..3]))
}
