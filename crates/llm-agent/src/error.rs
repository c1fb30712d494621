use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM API key is not configured")]
    NotConfigured,

    #[error("unsupported LLM provider '{0}': expected openai, anthropic or ollama")]
    UnsupportedProvider(String),

    #[error("LLM request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("LLM API returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("LLM response contained no message content")]
    EmptyResponse,

    #[error("Failed to parse LLM reply as JSON: {source}\n  reply: {content}")]
    Parse {
        content: String,
        #[source]
        source: serde_json::Error,
    },
}

impl LlmError {
    /// Whether retrying the same request may succeed: timeouts, connection
    /// failures, rate limits and server errors.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::Transport(e) => e.is_timeout() || e.is_connect(),
            LlmError::Status { status, .. } => *status == 429 || *status >= 500,
            LlmError::NotConfigured
            | LlmError::UnsupportedProvider(_)
            | LlmError::EmptyResponse
            | LlmError::Parse { .. } => false,
        }
    }
}
