//! `llm-agent`: a small client for chat completion APIs.
//!
//! OpenAI and Ollama are reached through the chat completions endpoint;
//! Anthropic through its Messages API. [`Provider`] picks the wire format,
//! default endpoint and default model, and expands short model aliases.
//!
//! Agents describe their reply as a JSON object in the system prompt; the
//! client requests JSON mode, strips any markdown fence the model wraps the
//! object in, and deserializes it into the caller's type.
//!
//! ```text
//! ChatConfig ──► ChatClient::complete_json::<T>(system, user)
//!                    │  POST {base_url}/chat/completions   (openai, ollama)
//!                    │  POST {base_url}/messages           (anthropic)
//!                    ▼
//!                reply text ──► extract_json ──► T
//! ```
//!
//! # Quick start
//!
//! ```rust,ignore
//! use llm_agent::{ChatClient, ChatConfig};
//!
//! #[derive(serde::Deserialize)]
//! struct Verdict { approved: bool }
//!
//! let client = ChatClient::new(ChatConfig {
//!     api_key: std::env::var("OPENAI_API_KEY")?,
//!     ..Default::default()
//! })?;
//! let v: Verdict = client
//!     .complete_json("Answer as {\"approved\": bool}.", "Ship it?")
//!     .await?
//!     .value;
//! ```

pub mod client;
pub mod error;
pub mod provider;
pub mod types;


pub use client::{extract_json, ChatClient, ChatConfig, JsonReply, ANTHROPIC_VERSION};
pub use error::LlmError;
pub use provider::Provider;
pub use types::{
    ChatMessage, ChatRequest, ChatResponse, Completion, MessagesRequest, MessagesResponse,
    ResponseFormat, Role, Usage,
};

/// Convenience `Result` alias for this crate.
pub type Result<T> = std::result::Result<T, LlmError>;
