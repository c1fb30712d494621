//! Conversation aggregate: one per (repository, issue number).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FlowError, Result};
use crate::types::{ConversationStatus, TurnRole};

// ---------------------------------------------------------------------------
// Turn
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    /// GitHub login of the author, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub text: String,
    /// Delivery that produced this turn. `(role, event_id)` is unique per
    /// conversation so replays never duplicate a turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    pub fn user(author: Option<String>, text: impl Into<String>, event_id: &str) -> Self {
        Self {
            role: TurnRole::User,
            author,
            text: text.into(),
            event_id: Some(event_id.to_string()),
            created_at: crate::now(),
        }
    }

    pub fn agent(text: impl Into<String>, event_id: &str) -> Self {
        Self {
            role: TurnRole::Agent,
            author: None,
            text: text.into(),
            event_id: Some(event_id.to_string()),
            created_at: crate::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Analysis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

/// Result of the last refinement pass. The variant must agree with the
/// conversation status; see [`Conversation::validate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Analysis {
    /// Requirements are unclear; these questions were posted to the issue.
    Clarifying {
        questions: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        complexity: Option<Complexity>,
    },
    /// Requirements are clear enough to build.
    Refined {
        refined_description: String,
        #[serde(default)]
        acceptance_criteria: Vec<String>,
        #[serde(default)]
        suggested_labels: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        complexity: Option<Complexity>,
    },
}

impl Analysis {
    pub fn refined_description(&self) -> Option<&str> {
        match self {
            Analysis::Refined {
                refined_description,
                ..
            } => Some(refined_description),
            Analysis::Clarifying { .. } => None,
        }
    }

    pub fn acceptance_criteria(&self) -> &[String] {
        match self {
            Analysis::Refined {
                acceptance_criteria,
                ..
            } => acceptance_criteria,
            Analysis::Clarifying { .. } => &[],
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Analysis::Clarifying { .. } => "clarifying",
            Analysis::Refined { .. } => "refined",
        }
    }
}

/// Check that `analysis` is the shape `status` requires.
pub fn check_analysis(status: ConversationStatus, analysis: Option<&Analysis>) -> Result<()> {
    use ConversationStatus::*;
    let ok = match (status, analysis) {
        (Analyzing, None) => true,
        (NeedsClarification, Some(Analysis::Clarifying { .. })) => true,
        (ReadyForDev | InDevelopment | Completed, Some(Analysis::Refined { .. })) => true,
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(FlowError::SchemaDrift(format!(
            "status {status} cannot carry analysis {}",
            analysis.map(Analysis::kind).unwrap_or("none")
        )))
    }
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub repo_full_name: String,
    pub issue_number: u64,
    pub issue_id: u64,
    pub status: ConversationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<Analysis>,
    #[serde(default)]
    pub turns: Vec<Turn>,
    /// Bumped on every status transition; the optimistic concurrency token.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(repo_full_name: impl Into<String>, issue_number: u64, issue_id: u64) -> Self {
        let now = crate::now();
        Self {
            id: Uuid::new_v4(),
            repo_full_name: repo_full_name.into(),
            issue_number,
            issue_id,
            status: ConversationStatus::Analyzing,
            analysis: None,
            turns: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn validate(&self) -> Result<()> {
        check_analysis(self.status, self.analysis.as_ref())
    }

    /// Text of the first user turn, normally the issue title and body.
    pub fn original_request(&self) -> Option<&str> {
        self.turns
            .iter()
            .find(|t| t.role == TurnRole::User)
            .map(|t| t.text.as_str())
    }
}

/// Validate a requested status change against the workflow table.
pub fn check_transition(from: ConversationStatus, to: ConversationStatus) -> Result<()> {
    if from.can_transition_to(to) {
        return Ok(());
    }
    let reason = if from.is_terminal() {
        format!("{from} is terminal")
    } else {
        let allowed: Vec<&str> = from.allowed_next().iter().map(|s| s.as_str()).collect();
        format!("allowed: {}", allowed.join(", "))
    };
    Err(FlowError::InvalidTransition {
        from: from.to_string(),
        to: to.to_string(),
        reason,
    })
}
