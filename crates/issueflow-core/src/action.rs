//! Agent action data model.
//!
//! An `AgentAction` is the audit record of one decision or effect produced by
//! an agent. Actions are append-only: the store never updates or deletes one
//! except through the cascade when its conversation is removed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{ActionStatus, AgentKind, ConversationStatus, GenerationStatus};

// ---------------------------------------------------------------------------
// ActionPayload
// ---------------------------------------------------------------------------

/// Structured payload, one variant per action type.
///
/// Serialized adjacently tagged so the stored JSON carries the action type
/// next to its data and unknown shapes fail to load instead of drifting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action_type", content = "payload", rename_all = "snake_case")]
pub enum ActionPayload {
    /// The refinement agent reached a decision for an event.
    IssueAnalyzed {
        event_id: String,
        needs_clarification: bool,
        question_count: usize,
        /// Status the decision commits to; `None` when the status is kept.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_status: Option<ConversationStatus>,
    },
    QuestionsAsked {
        issue_number: u64,
        questions: Vec<String>,
    },
    MarkedReadyForDev {
        issue_number: u64,
        refined_description: String,
        acceptance_criteria_count: usize,
    },
    CodeGenerated {
        event_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        generation_id: Option<Uuid>,
        files: usize,
        tests: usize,
    },
    PrCreated {
        generation_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pr_number: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pr_url: Option<String>,
        branch_name: String,
    },
    PrStatusUpdated {
        generation_id: Uuid,
        pr_number: u64,
        status: GenerationStatus,
    },
    ConversationCompleted {
        generation_id: Uuid,
        pr_number: u64,
    },
    /// A delivery could not be parsed.
    EventRejected {
        event_name: String,
        delivery_id: String,
    },
    /// A requested status change violated the workflow table.
    TransitionRejected {
        event_id: String,
        from: ConversationStatus,
        to: ConversationStatus,
    },
    DuplicateDelivery {
        delivery_id: String,
    },
    EventIgnored {
        event_id: String,
        reason: String,
    },
    ConcurrencyConflict {
        event_id: String,
        expected_version: u64,
    },
    /// The refinement agent could not run; a notice was posted to the issue.
    AutomationUnavailable {
        event_id: String,
        notice_posted: bool,
    },
    /// Generation was requested while another attempt is still live.
    GenerationSkipped {
        event_id: String,
        in_flight: Uuid,
    },
    /// Handling a delivery exceeded the ingress time bound.
    TimedOut {
        delivery_id: String,
        limit_ms: u64,
    },
}

impl ActionPayload {
    pub fn action_type(&self) -> &'static str {
        match self {
            ActionPayload::IssueAnalyzed { .. } => "issue_analyzed",
            ActionPayload::QuestionsAsked { .. } => "questions_asked",
            ActionPayload::MarkedReadyForDev { .. } => "marked_ready_for_dev",
            ActionPayload::CodeGenerated { .. } => "code_generated",
            ActionPayload::PrCreated { .. } => "pr_created",
            ActionPayload::PrStatusUpdated { .. } => "pr_status_updated",
            ActionPayload::ConversationCompleted { .. } => "conversation_completed",
            ActionPayload::EventRejected { .. } => "event_rejected",
            ActionPayload::TransitionRejected { .. } => "transition_rejected",
            ActionPayload::DuplicateDelivery { .. } => "duplicate_delivery",
            ActionPayload::EventIgnored { .. } => "event_ignored",
            ActionPayload::ConcurrencyConflict { .. } => "concurrency_conflict",
            ActionPayload::AutomationUnavailable { .. } => "automation_unavailable",
            ActionPayload::GenerationSkipped { .. } => "generation_skipped",
            ActionPayload::TimedOut { .. } => "timed_out",
        }
    }
}

// ---------------------------------------------------------------------------
// AgentAction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentAction {
    pub id: Uuid,
    /// `None` for actions that never reached a conversation, such as
    /// rejected payloads.
    pub conversation_id: Option<Uuid>,
    pub agent: AgentKind,
    pub payload: ActionPayload,
    pub status: ActionStatus,
    /// Set iff `status` is `Failure` or `Partial`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub execution_time_ms: u64,
    pub created_at: DateTime<Utc>,
}

impl AgentAction {
    pub fn success(
        conversation_id: Option<Uuid>,
        agent: AgentKind,
        payload: ActionPayload,
        execution_time_ms: u64,
    ) -> Self {
        Self::build(
            conversation_id,
            agent,
            payload,
            ActionStatus::Success,
            None,
            execution_time_ms,
        )
    }

    pub fn failure(
        conversation_id: Option<Uuid>,
        agent: AgentKind,
        payload: ActionPayload,
        error_message: impl Into<String>,
        execution_time_ms: u64,
    ) -> Self {
        Self::build(
            conversation_id,
            agent,
            payload,
            ActionStatus::Failure,
            Some(error_message.into()),
            execution_time_ms,
        )
    }

    pub fn partial(
        conversation_id: Option<Uuid>,
        agent: AgentKind,
        payload: ActionPayload,
        error_message: impl Into<String>,
        execution_time_ms: u64,
    ) -> Self {
        Self::build(
            conversation_id,
            agent,
            payload,
            ActionStatus::Partial,
            Some(error_message.into()),
            execution_time_ms,
        )
    }

    fn build(
        conversation_id: Option<Uuid>,
        agent: AgentKind,
        payload: ActionPayload,
        status: ActionStatus,
        error_message: Option<String>,
        execution_time_ms: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            agent,
            payload,
            status,
            error_message,
            execution_time_ms,
            created_at: crate::now(),
        }
    }

    pub fn action_type(&self) -> &'static str {
        self.payload.action_type()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_is_adjacently_tagged() {
        let payload = ActionPayload::QuestionsAsked {
            issue_number: 42,
            questions: vec!["Which provider?".into()],
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["action_type"], "questions_asked");
        assert_eq!(json["payload"]["issue_number"], 42);
    }

    #[test]
    fn unknown_action_type_fails_to_load() {
        let json = serde_json::json!({"action_type": "launched_rocket", "payload": {}});
        assert!(serde_json::from_value::<ActionPayload>(json).is_err());
    }

    #[test]
    fn failure_and_partial_carry_error_message() {
        let p = ActionPayload::DuplicateDelivery {
            delivery_id: "abc".into(),
        };
        let ok = AgentAction::success(None, AgentKind::Orchestrator, p.clone(), 1);
        assert!(ok.error_message.is_none());
        let partial = AgentAction::partial(None, AgentKind::Orchestrator, p, "replayed", 1);
        assert_eq!(partial.status, ActionStatus::Partial);
        assert_eq!(partial.error_message.as_deref(), Some("replayed"));
        assert_eq!(partial.action_type(), "duplicate_delivery");
    }
}
