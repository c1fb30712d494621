use thiserror::Error;
use uuid::Uuid;

use crate::collab::CollabError;

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("webhook signature rejected: {0}")]
    Authentication(String),

    #[error("malformed webhook payload: {0}")]
    MalformedPayload(String),

    #[error("invalid transition from {from} to {to}: {reason}")]
    InvalidTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error(transparent)]
    Collaborator(#[from] CollabError),

    #[error("conversation {conversation_id} changed concurrently (expected version {expected_version})")]
    ConcurrencyConflict {
        conversation_id: Uuid,
        expected_version: u64,
    },

    #[error("code generation {generation_id} is still in flight for conversation {conversation_id}")]
    GenerationInFlight {
        conversation_id: Uuid,
        generation_id: Uuid,
    },

    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("code generation not found: {0}")]
    GenerationNotFound(String),

    #[error("invalid status: {0}")]
    InvalidStatus(String),

    #[error("stored record does not match its schema: {0}")]
    SchemaDrift(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

impl FlowError {
    /// Errors that lost a race or hit an in-flight guard. These are logged as
    /// `partial` actions rather than failures.
    pub fn is_contention(&self) -> bool {
        matches!(
            self,
            FlowError::ConcurrencyConflict { .. } | FlowError::GenerationInFlight { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;
