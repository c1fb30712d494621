use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::provider::Provider;
use crate::types::{
    ChatMessage, ChatRequest, ChatResponse, Completion, ErrorEnvelope, MessagesRequest,
    MessagesResponse, ResponseFormat, Usage,
};
use crate::{LlmError, Result};

/// `anthropic-version` header sent with every Messages request.
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

// ─── ChatConfig ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub provider: Provider,
    /// API root, with or without the trailing `/v1`. Blank means the
    /// provider's public endpoint.
    pub base_url: String,
    pub api_key: String,
    /// Model id or alias; blank means the provider's default model.
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Whole-request timeout, connect included.
    pub timeout: Duration,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            provider: Provider::OpenAi,
            base_url: Provider::OpenAi.default_base_url().to_string(),
            api_key: String::new(),
            model: Provider::OpenAi.default_model().to_string(),
            temperature: 0.7,
            max_tokens: 2000,
            timeout: Duration::from_secs(60),
        }
    }
}

// ─── ChatClient ───────────────────────────────────────────────────────────

/// A deserialized JSON reply with the usage it cost.
#[derive(Debug, Clone)]
pub struct JsonReply<T> {
    pub value: T,
    pub usage: Usage,
}

#[derive(Debug, Clone)]
pub struct ChatClient {
    http: reqwest::Client,
    config: ChatConfig,
    endpoint: String,
}

impl ChatClient {
    pub fn new(mut config: ChatConfig) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        if config.base_url.trim().is_empty() {
            config.base_url = config.provider.default_base_url().to_string();
        }
        config.model = config.provider.resolve_model(&config.model);
        let endpoint = match config.provider {
            Provider::OpenAi | Provider::Ollama => completions_url(&config.base_url),
            Provider::Anthropic => messages_url(&config.base_url),
        };
        Ok(Self {
            http,
            config,
            endpoint,
        })
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_configured(&self) -> bool {
        !self.config.provider.requires_api_key() || !self.config.api_key.trim().is_empty()
    }

    /// Send `messages` and return the first non-blank reply.
    ///
    /// `json_mode` maps to `response_format` on chat completions; the
    /// Messages API has no equivalent, so there the system prompt alone
    /// asks for JSON.
    pub async fn complete(&self, messages: Vec<ChatMessage>, json_mode: bool) -> Result<Completion> {
        if !self.is_configured() {
            return Err(LlmError::NotConfigured);
        }
        match self.config.provider {
            Provider::OpenAi | Provider::Ollama => self.complete_chat(messages, json_mode).await,
            Provider::Anthropic => self.complete_messages(messages).await,
        }
    }

    async fn complete_chat(
        &self,
        messages: Vec<ChatMessage>,
        json_mode: bool,
    ) -> Result<Completion> {
        let request = ChatRequest {
            model: self.config.model.clone(),
            messages,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            response_format: json_mode.then_some(ResponseFormat::JSON_OBJECT),
        };

        tracing::debug!(
            model = %request.model,
            messages = request.messages.len(),
            json_mode,
            "chat completion request"
        );
        let mut builder = self.http.post(&self.endpoint).json(&request);
        if !self.config.api_key.trim().is_empty() {
            builder = builder.bearer_auth(&self.config.api_key);
        }
        let response = check_status(builder.send().await?).await?;

        let data: ChatResponse = response.json().await?;
        let content = data.content().ok_or(LlmError::EmptyResponse)?.to_string();
        let usage = data.usage.unwrap_or_default();
        tracing::debug!(
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            "chat completion finished"
        );
        Ok(Completion {
            content,
            model: data.model,
            usage,
        })
    }

    async fn complete_messages(&self, messages: Vec<ChatMessage>) -> Result<Completion> {
        let request = MessagesRequest::from_chat(
            self.config.model.clone(),
            messages,
            self.config.max_tokens,
            self.config.temperature,
        );
        tracing::debug!(
            model = %request.model,
            messages = request.messages.len(),
            "messages request"
        );
        let response = self
            .http
            .post(&self.endpoint)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await?;
        let response = check_status(response).await?;

        let data: MessagesResponse = response.json().await?;
        let content = data.text().ok_or(LlmError::EmptyResponse)?;
        let usage: Usage = data.usage.unwrap_or_default().into();
        tracing::debug!(
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            stop_reason = data.stop_reason.as_deref().unwrap_or(""),
            "messages request finished"
        );
        Ok(Completion {
            content,
            model: data.model,
            usage,
        })
    }

    /// Ask for a JSON object and deserialize it into `T`.
    pub async fn complete_json<T: DeserializeOwned>(
        &self,
        system: &str,
        user: &str,
    ) -> Result<JsonReply<T>> {
        let completion = self
            .complete(vec![ChatMessage::system(system), ChatMessage::user(user)], true)
            .await?;
        let value = serde_json::from_str(extract_json(&completion.content)).map_err(|source| {
            LlmError::Parse {
                content: completion.content.clone(),
                source,
            }
        })?;
        Ok(JsonReply {
            value,
            usage: completion.usage,
        })
    }
}

// ─── Helpers ──────────────────────────────────────────────────────────────

pub(crate) fn completions_url(base: &str) -> String {
    let trimmed = base.trim().trim_end_matches('/');
    if trimmed.ends_with("/v1") {
        format!("{trimmed}/chat/completions")
    } else {
        format!("{trimmed}/v1/chat/completions")
    }
}

pub(crate) fn messages_url(base: &str) -> String {
    let trimmed = base.trim().trim_end_matches('/');
    if trimmed.ends_with("/v1") {
        format!("{trimmed}/messages")
    } else {
        format!("{trimmed}/v1/messages")
    }
}

/// Pass a successful response through; turn anything else into
/// [`LlmError::Status`] carrying the API's own message when it sent one.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = error_message(&body)
        .unwrap_or_else(|| body.trim().to_string())
        .trim()
        .to_string();
    let message = if message.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    } else {
        message
    };
    tracing::warn!(status = status.as_u16(), %message, "LLM request rejected");
    Err(LlmError::Status {
        status: status.as_u16(),
        message,
    })
}

fn error_message(body: &str) -> Option<String> {
    let parsed: ErrorEnvelope = serde_json::from_str(body).ok()?;
    parsed.error.and_then(|e| e.message)
}

/// The JSON object inside a model reply.
///
/// Models sometimes wrap JSON-mode output in a ```` ```json ```` fence or add
/// a sentence around it; the outermost `{...}` span is returned in that case.
pub fn extract_json(reply: &str) -> &str {
    let trimmed = reply.trim();
    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        return trimmed;
    }
    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => trimmed,
    }
}
