//! In-process collaborator fakes for tests.
//!
//! `FakeLlm` replays scripted answers; `FakeTracker` records every GitHub
//! mutation so tests can assert on comments, labels and pull requests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::collab::{
    CodeRequest, CollabError, CollabResult, Collaborator, GeneratedCode, IssueTracker,
    LanguageModel, OpenedPullRequest, PullRequestDraft, PullRequestState, RefineRequest,
    Refinement,
};
use crate::conversation::Complexity;
use crate::generation::{FileChange, FileOperation, TestFile};

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub fn clarify(questions: &[&str]) -> Refinement {
    Refinement {
        needs_clarification: true,
        questions: questions.iter().map(|q| q.to_string()).collect(),
        refined_description: String::new(),
        acceptance_criteria: vec![],
        suggested_labels: vec![],
        complexity: Some(Complexity::Medium),
    }
}

pub fn ready(description: &str) -> Refinement {
    Refinement {
        needs_clarification: false,
        questions: vec![],
        refined_description: description.to_string(),
        acceptance_criteria: vec![
            "A test card payment succeeds".to_string(),
            "A declined card shows an error".to_string(),
        ],
        suggested_labels: vec!["payments".to_string()],
        complexity: Some(Complexity::Medium),
    }
}

pub fn sample_code() -> GeneratedCode {
    GeneratedCode {
        files: vec![FileChange {
            path: "src/payments.rs".to_string(),
            content: "pub fn charge(cents: u64) -> bool { cents > 0 }\n".to_string(),
            operation: FileOperation::Create,
            language: Some("rust".to_string()),
            description: "Payment service".to_string(),
        }],
        tests: vec![TestFile {
            path: "tests/payments.rs".to_string(),
            content: "#[test]\nfn charges() { assert!(shop::payments::charge(100)); }\n"
                .to_string(),
            framework: "cargo test".to_string(),
            test_count: 1,
        }],
        branch_name: Some("feature/payments".to_string()),
        pr_title: "Add payment processing".to_string(),
        pr_description: "Adds a Stripe-backed payment service.".to_string(),
        commit_message: "feat: add payment processing".to_string(),
        review: None,
    }
}

// ---------------------------------------------------------------------------
// FakeLlm
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeLlm {
    refinements: Mutex<VecDeque<CollabResult<Refinement>>>,
    code: Mutex<VecDeque<CollabResult<GeneratedCode>>>,
    refine_calls: AtomicUsize,
    generate_calls: AtomicUsize,
    unconfigured: AtomicBool,
}

impl FakeLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_refinement(&self, r: Refinement) -> &Self {
        self.refinements.lock().unwrap().push_back(Ok(r));
        self
    }

    pub fn push_refine_error(&self, e: CollabError) -> &Self {
        self.refinements.lock().unwrap().push_back(Err(e));
        self
    }

    pub fn push_code(&self, c: GeneratedCode) -> &Self {
        self.code.lock().unwrap().push_back(Ok(c));
        self
    }

    pub fn push_code_error(&self, e: CollabError) -> &Self {
        self.code.lock().unwrap().push_back(Err(e));
        self
    }

    pub fn set_configured(&self, configured: bool) {
        self.unconfigured.store(!configured, Ordering::SeqCst);
    }

    pub fn refine_calls(&self) -> usize {
        self.refine_calls.load(Ordering::SeqCst)
    }

    pub fn generate_calls(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LanguageModel for FakeLlm {
    async fn refine(&self, _req: RefineRequest<'_>) -> CollabResult<Refinement> {
        self.refine_calls.fetch_add(1, Ordering::SeqCst);
        self.refinements
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Err(CollabError::permanent(
                    Collaborator::Llm,
                    "no scripted refinement",
                ))
            })
    }

    async fn generate_code(&self, _req: CodeRequest<'_>) -> CollabResult<GeneratedCode> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        self.code
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(sample_code()))
    }

    fn is_configured(&self) -> bool {
        !self.unconfigured.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// FakeTracker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum TrackerCall {
    Comment {
        repo: String,
        issue_number: u64,
        body: String,
    },
    AddLabels {
        repo: String,
        issue_number: u64,
        labels: Vec<String>,
    },
    RemoveLabel {
        repo: String,
        issue_number: u64,
        label: String,
    },
    OpenPullRequest(PullRequestDraft),
    PullRequestStatus {
        repo: String,
        number: u64,
    },
}

pub struct FakeTracker {
    calls: Mutex<Vec<TrackerCall>>,
    pr_failures: Mutex<VecDeque<CollabError>>,
    comments_fail: AtomicBool,
    next_pr: AtomicU64,
    pr_states: Mutex<HashMap<u64, PullRequestState>>,
}

impl Default for FakeTracker {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            pr_failures: Mutex::new(VecDeque::new()),
            comments_fail: AtomicBool::new(false),
            next_pr: AtomicU64::new(100),
            pr_states: Mutex::new(HashMap::new()),
        }
    }
}

impl FakeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<TrackerCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn comments(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                TrackerCall::Comment { body, .. } => Some(body),
                _ => None,
            })
            .collect()
    }

    pub fn labels_added(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                TrackerCall::AddLabels { labels, .. } => Some(labels),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn labels_removed(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                TrackerCall::RemoveLabel { label, .. } => Some(label),
                _ => None,
            })
            .collect()
    }

    pub fn pull_requests(&self) -> Vec<PullRequestDraft> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                TrackerCall::OpenPullRequest(d) => Some(d),
                _ => None,
            })
            .collect()
    }

    pub fn fail_next_pull_request(&self, e: CollabError) {
        self.pr_failures.lock().unwrap().push_back(e);
    }

    pub fn fail_comments(&self, fail: bool) {
        self.comments_fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_pull_request_state(&self, number: u64, state: PullRequestState) {
        self.pr_states.lock().unwrap().insert(number, state);
    }

    fn record(&self, call: TrackerCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl IssueTracker for FakeTracker {
    async fn post_comment(&self, repo: &str, issue_number: u64, body: &str) -> CollabResult<()> {
        if self.comments_fail.load(Ordering::SeqCst) {
            return Err(CollabError::permanent(
                Collaborator::GitHub,
                "comment rejected",
            ));
        }
        self.record(TrackerCall::Comment {
            repo: repo.to_string(),
            issue_number,
            body: body.to_string(),
        });
        Ok(())
    }

    async fn add_labels(
        &self,
        repo: &str,
        issue_number: u64,
        labels: &[String],
    ) -> CollabResult<()> {
        self.record(TrackerCall::AddLabels {
            repo: repo.to_string(),
            issue_number,
            labels: labels.to_vec(),
        });
        Ok(())
    }

    async fn remove_label(&self, repo: &str, issue_number: u64, label: &str) -> CollabResult<()> {
        self.record(TrackerCall::RemoveLabel {
            repo: repo.to_string(),
            issue_number,
            label: label.to_string(),
        });
        Ok(())
    }

    async fn open_pull_request(&self, draft: PullRequestDraft) -> CollabResult<OpenedPullRequest> {
        if let Some(e) = self.pr_failures.lock().unwrap().pop_front() {
            return Err(e);
        }
        let repo = draft.repo_full_name.clone();
        self.record(TrackerCall::OpenPullRequest(draft));
        let number = self.next_pr.fetch_add(1, Ordering::SeqCst);
        self.pr_states
            .lock()
            .unwrap()
            .insert(number, PullRequestState::Open);
        Ok(OpenedPullRequest {
            number,
            url: format!("https://github.com/{repo}/pull/{number}"),
        })
    }

    async fn pull_request_status(
        &self,
        repo: &str,
        number: u64,
    ) -> CollabResult<PullRequestState> {
        self.record(TrackerCall::PullRequestStatus {
            repo: repo.to_string(),
            number,
        });
        self.pr_states
            .lock()
            .unwrap()
            .get(&number)
            .copied()
            .ok_or_else(|| {
                CollabError::permanent(Collaborator::GitHub, format!("pull request {number} not found"))
            })
    }
}
