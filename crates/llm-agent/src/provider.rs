use std::fmt;
use std::str::FromStr;

use crate::LlmError;

/// Chat API family. OpenAI and Ollama share the chat completions wire
/// format; Anthropic speaks the Messages API.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Provider {
    #[default]
    OpenAi,
    Anthropic,
    Ollama,
}

/// Short names accepted in place of a full model id.
const MODEL_ALIASES: &[(&str, &str)] = &[
    ("gpt4", "gpt-4"),
    ("gpt-4-turbo", "gpt-4-turbo-preview"),
    ("gpt3.5", "gpt-3.5-turbo"),
    ("claude", "claude-3-opus-20240229"),
    ("claude-opus", "claude-3-opus-20240229"),
    ("claude-sonnet", "claude-3-sonnet-20240229"),
    ("claude-haiku", "claude-3-haiku-20240307"),
];

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::OpenAi, Provider::Anthropic, Provider::Ollama];

    pub fn as_str(self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Ollama => "ollama",
        }
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            Provider::OpenAi => "https://api.openai.com/v1",
            Provider::Anthropic => "https://api.anthropic.com/v1",
            Provider::Ollama => "http://localhost:11434/v1",
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            Provider::OpenAi => "gpt-4o",
            Provider::Anthropic => "claude-3-opus-20240229",
            Provider::Ollama => "llama2",
        }
    }

    /// Local servers accept unauthenticated requests.
    pub fn requires_api_key(self) -> bool {
        !matches!(self, Provider::Ollama)
    }

    /// The model id to send: the provider default for a blank name, the
    /// expansion of a known alias, or the name itself.
    pub fn resolve_model(self, model: &str) -> String {
        let model = model.trim();
        if model.is_empty() {
            return self.default_model().to_string();
        }
        MODEL_ALIASES
            .iter()
            .find(|(alias, _)| *alias == model)
            .map(|(_, full)| (*full).to_string())
            .unwrap_or_else(|| model.to_string())
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = LlmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Provider::ALL
            .into_iter()
            .find(|p| p.as_str() == wanted)
            .ok_or(LlmError::UnsupportedProvider(wanted))
    }
}
