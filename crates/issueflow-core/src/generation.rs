use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FlowError, Result};
use crate::types::GenerationStatus;

// ---------------------------------------------------------------------------
// File descriptors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FileOperation {
    #[default]
    Create,
    Modify,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub operation: FileOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestFile {
    pub path: String,
    pub content: String,
    pub framework: String,
    #[serde(default)]
    pub test_count: u32,
}

// ---------------------------------------------------------------------------
// CodeReview
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewQuality {
    Excellent,
    Good,
    NeedsImprovement,
    Poor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewIssue {
    pub severity: String,
    pub description: String,
}

/// Self-review the developer agent attaches to its output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeReview {
    pub overall_quality: ReviewQuality,
    #[serde(default)]
    pub issues: Vec<ReviewIssue>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    pub approved: bool,
}

// ---------------------------------------------------------------------------
// CodeGeneration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeGeneration {
    pub id: Uuid,
    pub conversation_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    pub files_changed: Vec<FileChange>,
    pub tests_generated: Vec<TestFile>,
    pub status: GenerationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review: Option<CodeReview>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CodeGeneration {
    pub fn new(
        conversation_id: Uuid,
        files_changed: Vec<FileChange>,
        tests_generated: Vec<TestFile>,
        review: Option<CodeReview>,
    ) -> Self {
        let now = crate::now();
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            pr_number: None,
            pr_url: None,
            branch_name: None,
            files_changed,
            tests_generated,
            status: GenerationStatus::Generated,
            review,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `to`, enforcing the generation status table.
    pub fn advance(&mut self, to: GenerationStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(FlowError::InvalidTransition {
                from: self.status.to_string(),
                to: to.to_string(),
                reason: format!("code generation {} cannot move backwards", self.id),
            });
        }
        self.status = to;
        self.updated_at = crate::now();
        Ok(())
    }

    pub fn mark_pr_created(&mut self, number: u64, url: String, branch: String) -> Result<()> {
        self.advance(GenerationStatus::PrCreated)?;
        self.pr_number = Some(number);
        self.pr_url = Some(url);
        self.branch_name = Some(branch);
        Ok(())
    }

    pub fn mark_failed(&mut self, branch: String, error: impl Into<String>) -> Result<()> {
        self.advance(GenerationStatus::Failed)?;
        self.branch_name = Some(branch);
        self.error_message = Some(error.into());
        Ok(())
    }
}
