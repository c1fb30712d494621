//! Log-only `IssueTracker`.
//!
//! Comments and label changes are written to the process log instead of
//! GitHub. Pull requests cannot be faked, so opening or polling one fails
//! permanently and the generation is recorded as failed.

use async_trait::async_trait;
use issueflow_core::collab::{
    CollabError, CollabResult, Collaborator, IssueTracker, OpenedPullRequest, PullRequestDraft,
    PullRequestState,
};

#[derive(Debug, Default)]
pub struct LogOnlyTracker;

impl LogOnlyTracker {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl IssueTracker for LogOnlyTracker {
    async fn post_comment(&self, repo: &str, issue_number: u64, body: &str) -> CollabResult<()> {
        tracing::info!(repo, issue = issue_number, chars = body.len(), "comment (log only)\n{body}");
        Ok(())
    }

    async fn add_labels(
        &self,
        repo: &str,
        issue_number: u64,
        labels: &[String],
    ) -> CollabResult<()> {
        tracing::info!(repo, issue = issue_number, labels = ?labels, "add labels (log only)");
        Ok(())
    }

    async fn remove_label(&self, repo: &str, issue_number: u64, label: &str) -> CollabResult<()> {
        tracing::info!(repo, issue = issue_number, label, "remove label (log only)");
        Ok(())
    }

    async fn open_pull_request(&self, draft: PullRequestDraft) -> CollabResult<OpenedPullRequest> {
        tracing::warn!(
            repo = %draft.repo_full_name,
            branch = %draft.branch,
            files = draft.files.len(),
            "cannot open pull request without a GitHub integration"
        );
        Err(CollabError::permanent(
            Collaborator::GitHub,
            "no GitHub integration is configured to open pull requests",
        ))
    }

    async fn pull_request_status(
        &self,
        _repo: &str,
        number: u64,
    ) -> CollabResult<PullRequestState> {
        Err(CollabError::permanent(
            Collaborator::GitHub,
            format!("no GitHub integration is configured to read pull request #{number}"),
        ))
    }

    fn is_configured(&self) -> bool {
        false
    }
}
