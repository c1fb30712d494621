//! Conversation store: the durable mapping (repository, issue number) to
//! conversation, plus the action log, code generation rows, transition
//! records and delivery claims.
//!
//! The store is the only serialization point between concurrent deliveries.
//! Status changes use optimistic concurrency: every [`Transition`] names the
//! version it was decided against, and the store refuses it when the row has
//! moved on.

mod sqlite;

pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::action::AgentAction;
use crate::conversation::{Analysis, Conversation, Turn};
use crate::error::Result;
use crate::generation::CodeGeneration;
use crate::types::ConversationStatus;

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

/// A requested status change for one conversation.
#[derive(Debug, Clone)]
pub struct Transition {
    pub conversation_id: Uuid,
    /// Version the caller read before deciding; must still be current.
    pub expected_version: u64,
    pub to: ConversationStatus,
    /// Replacement analysis. `None` keeps the stored one.
    pub analysis: Option<Analysis>,
    /// Delivery that caused the change. Together with the conversation and
    /// target status this is the idempotency key.
    pub event_id: String,
}

#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    Applied(Conversation),
    /// The same (conversation, target, event) was already committed; nothing
    /// changed.
    Replayed(Conversation),
}

impl TransitionOutcome {
    pub fn conversation(&self) -> &Conversation {
        match self {
            TransitionOutcome::Applied(c) | TransitionOutcome::Replayed(c) => c,
        }
    }

    pub fn into_conversation(self) -> Conversation {
        match self {
            TransitionOutcome::Applied(c) | TransitionOutcome::Replayed(c) => c,
        }
    }

    pub fn is_replay(&self) -> bool {
        matches!(self, TransitionOutcome::Replayed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub conversation_id: Uuid,
    pub from: ConversationStatus,
    pub to: ConversationStatus,
    pub event_id: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Generations
// ---------------------------------------------------------------------------

/// Atomic start of a code generation attempt: moves the conversation into
/// development (when it is ready) and inserts the `generated` row.
#[derive(Debug, Clone)]
pub struct GenerationStart {
    pub expected_version: u64,
    pub event_id: String,
    pub generation: CodeGeneration,
}

// ---------------------------------------------------------------------------
// Deliveries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryClaim {
    /// First sighting, or a stale claim taken over. Process it.
    Claimed,
    /// Already fully processed.
    Completed,
    /// Another worker holds a fresh claim.
    InProgress,
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ActionQuery {
    pub conversation_id: Option<Uuid>,
    pub action_type: Option<String>,
    /// Most recent `limit` actions, still returned oldest first.
    pub limit: Option<usize>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Store: Send + Sync {
    /// Return the conversation for (repo, issue), creating it in `analyzing`
    /// when absent. The flag is `true` only for the caller that created it.
    async fn get_or_create_conversation(
        &self,
        repo_full_name: &str,
        issue_number: u64,
        issue_id: u64,
    ) -> Result<(Conversation, bool)>;

    async fn find_conversation(
        &self,
        repo_full_name: &str,
        issue_number: u64,
    ) -> Result<Option<Conversation>>;

    async fn load_conversation(&self, id: Uuid) -> Result<Conversation>;

    async fn list_conversations(&self) -> Result<Vec<Conversation>>;

    /// Remove a conversation together with its turns, actions, generations
    /// and transition records.
    async fn delete_conversation(&self, id: Uuid) -> Result<()>;

    async fn transition(&self, transition: Transition) -> Result<TransitionOutcome>;

    /// Append a turn without touching the status version. A turn whose
    /// (role, event id) is already present is skipped.
    async fn append_turn(&self, conversation_id: Uuid, turn: Turn) -> Result<Conversation>;

    async fn list_transitions(&self, conversation_id: Uuid) -> Result<Vec<TransitionRecord>>;

    async fn append_action(&self, action: &AgentAction) -> Result<()>;

    async fn list_actions(&self, query: ActionQuery) -> Result<Vec<AgentAction>>;

    async fn begin_generation(
        &self,
        start: GenerationStart,
    ) -> Result<(Conversation, CodeGeneration)>;

    /// Persist status, PR linkage, review and error of an existing row. The
    /// stored status must be allowed to move to the new one.
    async fn update_generation(&self, generation: &CodeGeneration) -> Result<()>;

    async fn load_generation(&self, id: Uuid) -> Result<CodeGeneration>;

    async fn list_generations(&self, conversation_id: Uuid) -> Result<Vec<CodeGeneration>>;

    async fn find_generation_by_pr(
        &self,
        repo_full_name: &str,
        pr_number: u64,
    ) -> Result<Option<CodeGeneration>>;

    async fn claim_delivery(&self, delivery_id: &str) -> Result<DeliveryClaim>;

    async fn complete_delivery(&self, delivery_id: &str) -> Result<()>;

    /// Drop a claim so a redelivery is processed again.
    async fn release_delivery(&self, delivery_id: &str) -> Result<()>;

    async fn ping(&self) -> Result<()>;
}
