//! Code generation tracking: branch naming, pull request drafts and the
//! mapping from GitHub outcomes onto generation statuses.

use crate::collab::{GeneratedCode, PullRequestDraft, PullRequestState};
use crate::conversation::Conversation;
use crate::types::GenerationStatus;

const BRANCH_PREFIX: &str = "issueflow";

/// Branch for a generation attempt. A name proposed by the model is used
/// when it survives sanitizing, otherwise one is derived from the issue.
pub fn branch_for(issue_number: u64, attempt: usize, suggested: Option<&str>) -> String {
    let base = suggested
        .map(sanitize_branch)
        .filter(|b| !b.is_empty())
        .unwrap_or_else(|| format!("{BRANCH_PREFIX}/issue-{issue_number}"));
    if attempt <= 1 {
        base
    } else {
        format!("{base}-attempt-{attempt}")
    }
}

/// Lowercased ref name that `git check-ref-format` accepts: no empty
/// components, no `..`, no component starting with `.` or ending in `.lock`.
fn sanitize_branch(name: &str) -> String {
    name.split('/')
        .filter_map(sanitize_component)
        .collect::<Vec<_>>()
        .join("/")
}

fn sanitize_component(part: &str) -> Option<String> {
    let mut out = String::with_capacity(part.len());
    for ch in part.trim().chars() {
        let ch = if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
            ch.to_ascii_lowercase()
        } else {
            '-'
        };
        // Runs of `-` or `.` collapse to one.
        if matches!(ch, '-' | '.') && out.ends_with(ch) {
            continue;
        }
        out.push(ch);
    }
    let edge = |c: char| c == '-' || c == '.';
    let mut part = out.trim_matches(edge);
    while let Some(stripped) = part.strip_suffix(".lock") {
        part = stripped.trim_end_matches(edge);
    }
    (!part.is_empty()).then(|| part.to_string())
}

pub fn draft(
    conversation: &Conversation,
    code: &GeneratedCode,
    branch: &str,
    base: &str,
) -> PullRequestDraft {
    let title = if code.pr_title.trim().is_empty() {
        format!("Implement #{}", conversation.issue_number)
    } else {
        code.pr_title.trim().to_string()
    };
    let mut body = code.pr_description.trim().to_string();
    if !body.is_empty() {
        body.push_str("\n\n");
    }
    body.push_str(&format!("Closes #{}", conversation.issue_number));

    let commit_message = if code.commit_message.trim().is_empty() {
        title.clone()
    } else {
        code.commit_message.trim().to_string()
    };

    let mut files = code.files.clone();
    files.extend(code.tests.iter().map(|t| crate::generation::FileChange {
        path: t.path.clone(),
        content: t.content.clone(),
        operation: crate::generation::FileOperation::Create,
        language: None,
        description: format!("{} tests", t.framework),
    }));

    PullRequestDraft {
        repo_full_name: conversation.repo_full_name.clone(),
        branch: branch.to_string(),
        base: base.to_string(),
        title,
        body,
        commit_message,
        files,
    }
}

/// Generation status implied by a pull request state. An open PR implies
/// nothing beyond `pr_created`.
pub fn status_from_pr_state(state: PullRequestState) -> Option<GenerationStatus> {
    match state {
        PullRequestState::Open => None,
        PullRequestState::Merged => Some(GenerationStatus::Merged),
        PullRequestState::Closed => Some(GenerationStatus::Closed),
    }
}

/// Generation status implied by a check suite conclusion.
pub fn status_from_ci(conclusion: &str) -> Option<GenerationStatus> {
    match conclusion {
        "success" => Some(GenerationStatus::CiPassed),
        "failure" | "timed_out" | "cancelled" | "action_required" | "startup_failure" => {
            Some(GenerationStatus::CiFailed)
        }
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusUpdate {
    Unchanged,
    Advance(GenerationStatus),
    /// The update arrived after the generation moved past it.
    Stale,
}

pub fn plan_status_update(current: GenerationStatus, to: GenerationStatus) -> StatusUpdate {
    if current == to {
        StatusUpdate::Unchanged
    } else if current.can_transition_to(to) {
        StatusUpdate::Advance(to)
    } else {
        StatusUpdate::Stale
    }
}
