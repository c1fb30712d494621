//! Collaborator seams: the LLM and GitHub capabilities the core consumes but
//! does not implement.
//!
//! Only the orchestrator calls through these traits. Implementations live
//! outside the core (`issueflow-server` wires the HTTP LLM client and a
//! log-only GitHub adapter); tests use the fakes in [`crate::testing`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::config::DomainProfile;
use crate::conversation::{Analysis, Complexity, Turn};
use crate::generation::{CodeReview, FileChange, TestFile};

// ---------------------------------------------------------------------------
// CollabError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collaborator {
    Llm,
    GitHub,
}

impl fmt::Display for Collaborator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Collaborator::Llm => "llm",
            Collaborator::GitHub => "github",
        })
    }
}

#[derive(Debug, Clone, Error)]
#[error("{collaborator} call failed: {message}")]
pub struct CollabError {
    pub collaborator: Collaborator,
    pub message: String,
    /// Transient failures are retried with backoff; permanent ones are not.
    pub transient: bool,
}

impl CollabError {
    pub fn transient(collaborator: Collaborator, message: impl Into<String>) -> Self {
        Self {
            collaborator,
            message: message.into(),
            transient: true,
        }
    }

    pub fn permanent(collaborator: Collaborator, message: impl Into<String>) -> Self {
        Self {
            collaborator,
            message: message.into(),
            transient: false,
        }
    }
}

pub type CollabResult<T> = std::result::Result<T, CollabError>;

// ---------------------------------------------------------------------------
// LanguageModel
// ---------------------------------------------------------------------------

pub struct RefineRequest<'a> {
    pub repo_full_name: &'a str,
    pub issue_number: u64,
    pub turns: &'a [Turn],
    pub analysis: Option<&'a Analysis>,
    pub domain: &'a DomainProfile,
}

/// The refinement agent's decision for one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Refinement {
    pub needs_clarification: bool,
    #[serde(default)]
    pub questions: Vec<String>,
    #[serde(default)]
    pub refined_description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub suggested_labels: Vec<String>,
    #[serde(default)]
    pub complexity: Option<Complexity>,
}

pub struct CodeRequest<'a> {
    pub repo_full_name: &'a str,
    pub issue_number: u64,
    pub refined_description: &'a str,
    pub acceptance_criteria: &'a [String],
    pub domain: &'a DomainProfile,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedCode {
    #[serde(default)]
    pub files: Vec<FileChange>,
    #[serde(default)]
    pub tests: Vec<TestFile>,
    #[serde(default)]
    pub branch_name: Option<String>,
    pub pr_title: String,
    #[serde(default)]
    pub pr_description: String,
    #[serde(default)]
    pub commit_message: String,
    #[serde(default)]
    pub review: Option<CodeReview>,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn refine(&self, req: RefineRequest<'_>) -> CollabResult<Refinement>;

    async fn generate_code(&self, req: CodeRequest<'_>) -> CollabResult<GeneratedCode>;

    /// Whether the model is configured well enough to be called at all.
    fn is_configured(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// IssueTracker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct PullRequestDraft {
    pub repo_full_name: String,
    pub branch: String,
    pub base: String,
    pub title: String,
    pub body: String,
    pub commit_message: String,
    pub files: Vec<FileChange>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedPullRequest {
    pub number: u64,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullRequestState {
    Open,
    Merged,
    Closed,
}

/// GitHub mutations the agents perform.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn post_comment(&self, repo: &str, issue_number: u64, body: &str) -> CollabResult<()>;

    async fn add_labels(&self, repo: &str, issue_number: u64, labels: &[String])
        -> CollabResult<()>;

    async fn remove_label(&self, repo: &str, issue_number: u64, label: &str) -> CollabResult<()>;

    async fn open_pull_request(&self, draft: PullRequestDraft) -> CollabResult<OpenedPullRequest>;

    async fn pull_request_status(&self, repo: &str, number: u64)
        -> CollabResult<PullRequestState>;

    fn is_configured(&self) -> bool {
        true
    }
}
