//! Webhook ingress: signature verification and normalization of GitHub
//! deliveries into [`IssueEvent`]s.
//!
//! Nothing here touches the store or a collaborator. A delivery either
//! authenticates and becomes an event, is ignored with a reason, or is
//! rejected as malformed.

use std::sync::OnceLock;

use hmac::{Hmac, Mac};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{FlowError, Result};

pub const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";
pub const EVENT_HEADER: &str = "X-GitHub-Event";
pub const DELIVERY_HEADER: &str = "X-GitHub-Delivery";

const SIGNATURE_PREFIX: &str = "sha256=";

type HmacSha256 = Hmac<Sha256>;

// ---------------------------------------------------------------------------
// Canonical event
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueRef {
    pub number: u64,
    pub id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    IssueOpened {
        issue: IssueRef,
        author: Option<String>,
        text: String,
    },
    IssueLabeled {
        issue: IssueRef,
        label: String,
        /// Current issue text, used if the conversation does not exist yet.
        text: String,
    },
    CommentCreated {
        issue: IssueRef,
        comment_id: u64,
        author: Option<String>,
        text: String,
    },
    PullRequestOpened {
        number: u64,
        linked_issue: Option<u64>,
    },
    PullRequestClosed {
        number: u64,
        merged: bool,
        linked_issue: Option<u64>,
    },
    CheckSuiteCompleted {
        pull_requests: Vec<u64>,
        conclusion: String,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::IssueOpened { .. } => "issue_opened",
            EventKind::IssueLabeled { .. } => "issue_labeled",
            EventKind::CommentCreated { .. } => "comment_created",
            EventKind::PullRequestOpened { .. } => "pull_request_opened",
            EventKind::PullRequestClosed { .. } => "pull_request_closed",
            EventKind::CheckSuiteCompleted { .. } => "check_suite_completed",
        }
    }

    /// The issue this event is about, when it is an issue-side event.
    pub fn issue(&self) -> Option<IssueRef> {
        match self {
            EventKind::IssueOpened { issue, .. }
            | EventKind::IssueLabeled { issue, .. }
            | EventKind::CommentCreated { issue, .. } => Some(*issue),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueEvent {
    /// `X-GitHub-Delivery`, or the body digest when the header is missing.
    pub delivery_id: String,
    pub repo_full_name: String,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Event(IssueEvent),
    Ignored { delivery_id: String, reason: String },
}

// ---------------------------------------------------------------------------
// Signatures
// ---------------------------------------------------------------------------

fn keyed_mac(secret: &str, body: &[u8]) -> Result<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| FlowError::Authentication(e.to_string()))?;
    mac.update(body);
    Ok(mac)
}

/// `sha256=<hex>` signature GitHub would send for `body`.
pub fn sign(body: &[u8], secret: &str) -> Result<String> {
    let mac = keyed_mac(secret, body)?;
    Ok(format!(
        "{SIGNATURE_PREFIX}{}",
        hex::encode(mac.finalize().into_bytes())
    ))
}

/// Constant-time check of `signature` against the HMAC of `body`.
pub fn verify_signature(body: &[u8], signature: Option<&str>, secret: &str) -> Result<()> {
    if secret.is_empty() {
        return Err(FlowError::Authentication(
            "webhook secret is not configured".to_string(),
        ));
    }
    let signature = signature
        .ok_or_else(|| FlowError::Authentication(format!("missing {SIGNATURE_HEADER}")))?;
    let digest = signature
        .strip_prefix(SIGNATURE_PREFIX)
        .ok_or_else(|| FlowError::Authentication("signature must start with sha256=".into()))?;
    let expected = hex::decode(digest)
        .map_err(|_| FlowError::Authentication("signature is not hex".into()))?;

    keyed_mac(secret, body)?
        .verify_slice(&expected)
        .map_err(|_| FlowError::Authentication("signature mismatch".into()))
}

/// Delivery id used when GitHub did not send one.
pub fn body_digest(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

// ---------------------------------------------------------------------------
// Payload shapes
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct Envelope {
    action: Option<String>,
    repository: Option<Repository>,
    issue: Option<Issue>,
    comment: Option<Comment>,
    label: Option<Label>,
    pull_request: Option<PullRequest>,
    check_suite: Option<CheckSuite>,
}

#[derive(Deserialize)]
struct Repository {
    full_name: String,
}

#[derive(Deserialize)]
struct User {
    login: String,
    #[serde(rename = "type", default)]
    kind: String,
}

impl User {
    fn is_bot(&self) -> bool {
        self.kind.eq_ignore_ascii_case("bot") || self.login.ends_with("[bot]")
    }
}

#[derive(Deserialize)]
struct Issue {
    number: u64,
    id: u64,
    #[serde(default)]
    title: String,
    body: Option<String>,
    user: Option<User>,
    /// Present when the "issue" is a pull request.
    pull_request: Option<serde_json::Value>,
}

impl Issue {
    fn reference(&self) -> IssueRef {
        IssueRef {
            number: self.number,
            id: self.id,
        }
    }

    fn text(&self) -> String {
        match self.body.as_deref().map(str::trim).filter(|b| !b.is_empty()) {
            Some(body) => format!("{}\n\n{body}", self.title.trim()),
            None => self.title.trim().to_string(),
        }
    }
}

#[derive(Deserialize)]
struct Comment {
    id: u64,
    body: Option<String>,
    user: Option<User>,
}

#[derive(Deserialize)]
struct Label {
    name: String,
}

#[derive(Deserialize)]
struct PullRequest {
    number: u64,
    body: Option<String>,
    #[serde(default)]
    merged: bool,
}

#[derive(Deserialize)]
struct CheckSuite {
    conclusion: Option<String>,
    #[serde(default)]
    pull_requests: Vec<PullRequestRef>,
}

#[derive(Deserialize)]
struct PullRequestRef {
    number: u64,
}

static LINKED_ISSUE_RE: OnceLock<Option<Regex>> = OnceLock::new();

/// Issue closed by a pull request body (`Closes #12`, `fixes #12`, ...).
pub fn linked_issue(body: &str) -> Option<u64> {
    let re = LINKED_ISSUE_RE
        .get_or_init(|| {
            Regex::new(r"(?i)\b(?:close[sd]?|fix(?:e[sd])?|resolve[sd]?)\s*:?\s+#(\d+)\b").ok()
        })
        .as_ref()?;
    re.captures(body)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn missing(field: &str) -> FlowError {
    FlowError::MalformedPayload(format!("missing `{field}`"))
}

// ---------------------------------------------------------------------------
// normalize
// ---------------------------------------------------------------------------

/// Authenticate and normalize one delivery.
///
/// Only [`FlowError::Authentication`] and [`FlowError::MalformedPayload`] are
/// returned.
pub fn normalize(
    event_name: &str,
    delivery_id: Option<&str>,
    body: &[u8],
    signature: Option<&str>,
    secret: &str,
) -> Result<Inbound> {
    verify_signature(body, signature, secret)?;

    let delivery_id = delivery_id
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| body_digest(body));

    let ignored = |reason: String| -> Result<Inbound> {
        Ok(Inbound::Ignored {
            delivery_id: delivery_id.clone(),
            reason,
        })
    };

    if !matches!(
        event_name,
        "issues" | "issue_comment" | "pull_request" | "check_suite"
    ) {
        return ignored(format!("event '{event_name}' is not handled"));
    }

    let envelope: Envelope = serde_json::from_slice(body)
        .map_err(|e| FlowError::MalformedPayload(e.to_string()))?;
    let action = envelope.action.clone().ok_or_else(|| missing("action"))?;
    let repo_full_name = envelope
        .repository
        .as_ref()
        .map(|r| r.full_name.clone())
        .ok_or_else(|| missing("repository.full_name"))?;

    let kind = match (event_name, action.as_str()) {
        ("issues", "opened") => {
            let issue = envelope.issue.ok_or_else(|| missing("issue"))?;
            EventKind::IssueOpened {
                issue: issue.reference(),
                author: issue.user.as_ref().map(|u| u.login.clone()),
                text: issue.text(),
            }
        }
        ("issues", "labeled") => {
            let issue = envelope.issue.ok_or_else(|| missing("issue"))?;
            let label = envelope.label.ok_or_else(|| missing("label"))?;
            EventKind::IssueLabeled {
                issue: issue.reference(),
                label: label.name,
                text: issue.text(),
            }
        }
        ("issue_comment", "created") => {
            let issue = envelope.issue.ok_or_else(|| missing("issue"))?;
            let comment = envelope.comment.ok_or_else(|| missing("comment"))?;
            if issue.pull_request.is_some() {
                return ignored("comment on a pull request".to_string());
            }
            if let Some(user) = comment.user.as_ref().filter(|u| u.is_bot()) {
                return ignored(format!("comment by bot {}", user.login));
            }
            EventKind::CommentCreated {
                issue: issue.reference(),
                comment_id: comment.id,
                author: comment.user.map(|u| u.login),
                text: comment.body.unwrap_or_default().trim().to_string(),
            }
        }
        ("pull_request", "opened") => {
            let pr = envelope.pull_request.ok_or_else(|| missing("pull_request"))?;
            EventKind::PullRequestOpened {
                number: pr.number,
                linked_issue: pr.body.as_deref().and_then(linked_issue),
            }
        }
        ("pull_request", "closed") => {
            let pr = envelope.pull_request.ok_or_else(|| missing("pull_request"))?;
            EventKind::PullRequestClosed {
                number: pr.number,
                merged: pr.merged,
                linked_issue: pr.body.as_deref().and_then(linked_issue),
            }
        }
        ("check_suite", "completed") => {
            let suite = envelope.check_suite.ok_or_else(|| missing("check_suite"))?;
            EventKind::CheckSuiteCompleted {
                pull_requests: suite.pull_requests.iter().map(|p| p.number).collect(),
                conclusion: suite.conclusion.unwrap_or_default(),
            }
        }
        (name, action) => return ignored(format!("{name}.{action} is not handled")),
    };

    Ok(Inbound::Event(IssueEvent {
        delivery_id,
        repo_full_name,
        kind,
    }))
}
