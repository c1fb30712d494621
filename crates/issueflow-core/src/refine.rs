//! Requirement refinement decisions.
//!
//! Pure logic: given the conversation and the refinement agent's answer,
//! decide what the conversation should become and what gets posted back to
//! the issue. The orchestrator performs the effects.

use crate::collab::{CollabError, Collaborator, Refinement};
use crate::conversation::{Analysis, Conversation};
use crate::types::ConversationStatus;

#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    /// Post questions and (re-)enter `needs_clarification`.
    AskQuestions {
        questions: Vec<String>,
        analysis: Analysis,
    },
    /// Post the refined requirements and enter `ready_for_dev`.
    MarkReady {
        analysis: Analysis,
        suggested_labels: Vec<String>,
    },
    /// Requirements are still clear while the work is already underway.
    KeepStatus,
}

impl Plan {
    /// Status the plan commits to, `None` when the status stays as is.
    pub fn target_status(&self) -> Option<ConversationStatus> {
        match self {
            Plan::AskQuestions { .. } => Some(ConversationStatus::NeedsClarification),
            Plan::MarkReady { .. } => Some(ConversationStatus::ReadyForDev),
            Plan::KeepStatus => None,
        }
    }

    pub fn question_count(&self) -> usize {
        match self {
            Plan::AskQuestions { questions, .. } => questions.len(),
            _ => 0,
        }
    }

    pub fn analysis(&self) -> Option<&Analysis> {
        match self {
            Plan::AskQuestions { analysis, .. } | Plan::MarkReady { analysis, .. } => {
                Some(analysis)
            }
            Plan::KeepStatus => None,
        }
    }
}

/// Turn a refinement decision into a plan for `conversation`.
///
/// A request for clarification that carries no questions is unusable and is
/// reported as a collaborator failure.
pub fn plan(conversation: &Conversation, decision: Refinement) -> Result<Plan, CollabError> {
    let complexity = decision.complexity;

    if decision.needs_clarification {
        let questions: Vec<String> = decision
            .questions
            .into_iter()
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
            .collect();
        if questions.is_empty() {
            return Err(CollabError::permanent(
                Collaborator::Llm,
                "refinement asked for clarification without any questions",
            ));
        }
        return Ok(Plan::AskQuestions {
            analysis: Analysis::Clarifying {
                questions: questions.clone(),
                complexity,
            },
            questions,
        });
    }

    match conversation.status {
        ConversationStatus::Analyzing | ConversationStatus::NeedsClarification => {
            let refined_description = if decision.refined_description.trim().is_empty() {
                conversation.original_request().unwrap_or_default().to_string()
            } else {
                decision.refined_description
            };
            Ok(Plan::MarkReady {
                analysis: Analysis::Refined {
                    refined_description,
                    acceptance_criteria: decision.acceptance_criteria,
                    suggested_labels: decision.suggested_labels.clone(),
                    complexity,
                },
                suggested_labels: decision.suggested_labels,
            })
        }
        _ => Ok(Plan::KeepStatus),
    }
}

// ---------------------------------------------------------------------------
// Issue comments
// ---------------------------------------------------------------------------

fn signed(body: String, signature: &str) -> String {
    format!("{body}\n\n---\n*{signature} 🤖*")
}

pub fn questions_comment(questions: &[String], signature: &str) -> String {
    let mut body = String::from("## 🤔 Clarification Needed\n\n");
    body.push_str("To better understand this requirement, I have some questions:\n\n");
    for (i, q) in questions.iter().enumerate() {
        body.push_str(&format!("{}. {q}\n", i + 1));
    }
    body.push_str("\nPlease answer in a comment so the requirements can be refined for development.");
    signed(body, signature)
}

pub fn ready_comment(analysis: &Analysis, signature: &str) -> String {
    let mut body = String::from("## ✅ Requirements Refined\n\n");
    body.push_str(&format!(
        "**Refined Description:**\n{}\n\n",
        analysis.refined_description().unwrap_or_default()
    ));
    let criteria = analysis.acceptance_criteria();
    if !criteria.is_empty() {
        body.push_str("**Acceptance Criteria:**\n");
        for (i, c) in criteria.iter().enumerate() {
            body.push_str(&format!("{}. {c}\n", i + 1));
        }
        body.push('\n');
    }
    body.push_str("This issue is now ready for development.");
    signed(body, signature)
}

pub fn pull_request_comment(
    pr_url: &str,
    branch: &str,
    files: usize,
    tests: usize,
    signature: &str,
) -> String {
    signed(
        format!(
            "## 🚀 Pull Request Created\n\n**PR:** {pr_url}\n**Branch:** `{branch}`\n\n\
             **Changes:**\n- {files} implementation files\n- {tests} test files\n\n\
             CI will run the generated tests before review."
        ),
        signature,
    )
}

pub fn unavailable_notice(signature: &str) -> String {
    signed(
        "## ⚠️ Automation Temporarily Unavailable\n\n\
         Automation is temporarily unavailable, so this issue could not be analyzed right now. \
         A maintainer can re-trigger analysis later by commenting again."
            .to_string(),
        signature,
    )
}

/// Whether `text` is a comment this service posted.
pub fn is_own_comment(text: &str, signature: &str) -> bool {
    text.trim_end().ends_with(&format!("*{signature} 🤖*"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{Complexity, Turn};

    fn conversation(status: ConversationStatus) -> Conversation {
        let mut c = Conversation::new("org/shop", 42, 9001);
        c.status = status;
        c.turns
            .push(Turn::user(None, "Add payment processing", "d1"));
        c
    }

    fn decision(needs: bool, questions: &[&str], description: &str) -> Refinement {
        Refinement {
            needs_clarification: needs,
            questions: questions.iter().map(|q| q.to_string()).collect(),
            refined_description: description.into(),
            acceptance_criteria: vec!["Cards are charged".into()],
            suggested_labels: vec!["payments".into()],
            complexity: Some(Complexity::High),
        }
    }

    #[test]
    fn clarification_targets_needs_clarification() {
        let p = plan(
            &conversation(ConversationStatus::Analyzing),
            decision(true, &["Which provider?", "  ", "Refunds?"], ""),
        )
        .unwrap();
        assert_eq!(p.target_status(), Some(ConversationStatus::NeedsClarification));
        assert_eq!(p.question_count(), 2);
    }

    #[test]
    fn clarification_without_questions_is_a_collaborator_failure() {
        let err = plan(
            &conversation(ConversationStatus::Analyzing),
            decision(true, &[], ""),
        )
        .unwrap_err();
        assert_eq!(err.collaborator, Collaborator::Llm);
        assert!(!err.transient);
    }

    #[test]
    fn empty_description_falls_back_to_issue_text() {
        let p = plan(
            &conversation(ConversationStatus::NeedsClarification),
            decision(false, &[], "  "),
        )
        .unwrap();
        assert_eq!(p.target_status(), Some(ConversationStatus::ReadyForDev));
        assert_eq!(
            p.analysis().and_then(Analysis::refined_description),
            Some("Add payment processing")
        );
    }

    #[test]
    fn clear_decision_during_development_keeps_status() {
        let p = plan(
            &conversation(ConversationStatus::InDevelopment),
            decision(false, &[], "Still Stripe"),
        )
        .unwrap();
        assert_eq!(p, Plan::KeepStatus);
        assert_eq!(p.target_status(), None);
    }

    #[test]
    fn reopening_from_ready_asks_again() {
        let p = plan(
            &conversation(ConversationStatus::ReadyForDev),
            decision(true, &["Should refunds be partial?"], ""),
        )
        .unwrap();
        assert_eq!(p.target_status(), Some(ConversationStatus::NeedsClarification));
    }

    #[test]
    fn comments_are_numbered_and_signed() {
        let body = questions_comment(&["A?".into(), "B?".into()], "issueflow");
        assert!(body.contains("1. A?\n2. B?"));
        assert!(is_own_comment(&body, "issueflow"));
        assert!(!is_own_comment("Use Stripe please", "issueflow"));

        let analysis = Analysis::Refined {
            refined_description: "Charge cards".into(),
            acceptance_criteria: vec!["Works".into()],
            suggested_labels: vec![],
            complexity: None,
        };
        let body = ready_comment(&analysis, "issueflow");
        assert!(body.contains("Charge cards"));
        assert!(body.contains("1. Works"));
        assert!(unavailable_notice("issueflow").contains("temporarily unavailable"));
    }
}
