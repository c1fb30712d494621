use crate::error::{FlowError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "issueflow.yaml";

pub const ENV_WEBHOOK_SECRET: &str = "GITHUB_WEBHOOK_SECRET";
pub const ENV_GITHUB_TOKEN: &str = "GITHUB_TOKEN";
pub const ENV_LLM_API_KEY: &str = "ISSUEFLOW_LLM_API_KEY";
pub const ENV_DATABASE_PATH: &str = "ISSUEFLOW_DATABASE";

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// ServerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Upper bound on handling one webhook delivery.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_request_timeout() -> u64 {
    55
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

// ---------------------------------------------------------------------------
// DatabaseConfig / WebhookConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

fn default_database_path() -> PathBuf {
    PathBuf::from(".issueflow/issueflow.db")
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub secret: String,
}

// ---------------------------------------------------------------------------
// LlmConfig
// ---------------------------------------------------------------------------

/// Which chat API the agent speaks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    /// OpenAI chat completions.
    #[default]
    OpenAi,
    /// Anthropic Messages API.
    Anthropic,
    /// A local Ollama server through its OpenAI-compatible endpoint.
    Ollama,
}

impl LlmProvider {
    pub fn requires_api_key(self) -> bool {
        !matches!(self, LlmProvider::Ollama)
    }
}

impl std::fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            LlmProvider::OpenAi => "openai",
            LlmProvider::Anthropic => "anthropic",
            LlmProvider::Ollama => "ollama",
        })
    }
}

/// Chat model settings. A blank `base_url` or `model` means the provider's
/// default; `model` may also be a short alias such as `claude-sonnet`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: LlmProvider,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    2000
}

fn default_llm_timeout() -> u64 {
    60
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::default(),
            base_url: String::new(),
            model: String::new(),
            api_key: String::new(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_llm_timeout(),
        }
    }
}

// ---------------------------------------------------------------------------
// GithubConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubConfig {
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
}

fn default_base_branch() -> String {
    "main".to_string()
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            base_branch: default_base_branch(),
        }
    }
}

// ---------------------------------------------------------------------------
// AgentSettings
// ---------------------------------------------------------------------------

/// Describes the target project so agents can be specialized through
/// configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TechStack {
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub framework: String,
    #[serde(default)]
    pub test_framework: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainProfile {
    #[serde(default)]
    pub domain_context: String,
    #[serde(default)]
    pub tech_stack: TechStack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelConfig {
    #[serde(default = "default_needs_clarification_label")]
    pub needs_clarification: String,
    #[serde(default = "default_ready_label")]
    pub ready_for_dev: String,
}

fn default_needs_clarification_label() -> String {
    "needs-clarification".to_string()
}

fn default_ready_label() -> String {
    "ready-for-dev".to_string()
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            needs_clarification: default_needs_clarification_label(),
            ready_for_dev: default_ready_label(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Start code generation as soon as a conversation becomes ready instead
    /// of waiting for the ready label event.
    #[serde(default)]
    pub auto_generate: bool,
    #[serde(default = "default_bot_signature")]
    pub bot_signature: String,
    #[serde(flatten)]
    pub profile: DomainProfile,
    #[serde(default)]
    pub labels: LabelConfig,
    /// Mirrors `github.base_branch`; filled in by [`Config::apply_env`].
    #[serde(skip, default = "default_base_branch")]
    pub base_branch: String,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_bot_signature() -> String {
    "issueflow".to_string()
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            auto_generate: false,
            bot_signature: default_bot_signature(),
            profile: DomainProfile::default(),
            labels: LabelConfig::default(),
            base_branch: default_base_branch(),
        }
    }
}

impl AgentSettings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

// ---------------------------------------------------------------------------
// LogConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub github: GithubConfig,
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Load from `path`, falling back to defaults when the file is absent,
    /// then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut cfg = Self::load_file(path)?;
        cfg.apply_env(|key| std::env::var(key).ok());
        Ok(cfg)
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    /// Overlay secrets and paths from the environment. Empty values are
    /// ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(v) = get(ENV_WEBHOOK_SECRET) {
            self.webhook.secret = v;
        }
        if let Some(v) = get(ENV_GITHUB_TOKEN) {
            self.github.token = v;
        }
        if let Some(v) = get(ENV_LLM_API_KEY) {
            self.llm.api_key = v;
        }
        if let Some(v) = get(ENV_DATABASE_PATH) {
            self.database.path = PathBuf::from(v);
        }
        // The agent's base branch follows the github section.
        self.agent.base_branch = self.github.base_branch.clone();
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, data)?;
        Ok(())
    }

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.webhook.secret.trim().is_empty() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: format!(
                    "webhook secret is empty: set webhook.secret or {ENV_WEBHOOK_SECRET}"
                ),
            });
        }

        if self.llm.provider.requires_api_key() && self.llm.api_key.trim().is_empty() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "llm api key is empty for provider {}: set llm.api_key or {ENV_LLM_API_KEY}",
                    self.llm.provider
                ),
            });
        }

        if !(0.0..=2.0).contains(&self.llm.temperature) {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: format!(
                    "llm.temperature={} is outside 0.0..=2.0",
                    self.llm.temperature
                ),
            });
        }

        if self.llm.max_tokens == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "llm.max_tokens must be greater than 0".to_string(),
            });
        }

        if self.github.token.trim().is_empty() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "github token is empty: GitHub mutations are logged only ({ENV_GITHUB_TOKEN})"
                ),
            });
        }

        if self.agent.max_retries > 10 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "agent.max_retries={} (>10 is unusual)",
                    self.agent.max_retries
                ),
            });
        }

        if self.agent.labels.needs_clarification == self.agent.labels.ready_for_dev {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "agent.labels must use distinct names".to_string(),
            });
        }

        warnings
    }

    /// Return an error if any warning is an `Error`.
    pub fn ensure_valid(&self) -> Result<()> {
        let errors: Vec<String> = self
            .validate()
            .into_iter()
            .filter(|w| w.level == WarnLevel::Error)
            .map(|w| w.message)
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(FlowError::Config(errors.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = Config::load_file(&dir.path().join("nope.yaml")).unwrap();
        assert_eq!(cfg.server.port, 8000);
        assert_eq!(cfg.agent.max_retries, 3);
        assert_eq!(cfg.agent.labels.ready_for_dev, "ready-for-dev");
        assert!(!cfg.agent.auto_generate);
    }

    #[test]
    fn partial_yaml_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("issueflow.yaml");
        std::fs::write(
            &path,
            "server:\n  port: 9100\nagent:\n  auto_generate: true\n  domain_context: fintech\n  tech_stack:\n    language: rust\n",
        )
        .unwrap();
        let cfg = Config::load_file(&path).unwrap();
        assert_eq!(cfg.server.port, 9100);
        assert_eq!(cfg.server.host, "0.0.0.0");
        assert!(cfg.agent.auto_generate);
        assert_eq!(cfg.agent.profile.domain_context, "fintech");
        assert_eq!(cfg.agent.profile.tech_stack.language, "rust");
    }

    #[test]
    fn env_overrides_secrets_but_ignores_blank_values() {
        let mut cfg = Config::default();
        cfg.webhook.secret = "from-file".into();
        let env: HashMap<&str, &str> = [
            (ENV_WEBHOOK_SECRET, "  "),
            (ENV_LLM_API_KEY, "sk-test"),
            (ENV_DATABASE_PATH, "/tmp/flow.db"),
        ]
        .into_iter()
        .collect();
        cfg.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.webhook.secret, "from-file");
        assert_eq!(cfg.llm.api_key, "sk-test");
        assert_eq!(cfg.database.path, PathBuf::from("/tmp/flow.db"));
    }

    #[test]
    fn empty_secret_is_an_error() {
        let cfg = Config::default();
        let warnings = cfg.validate();
        assert!(warnings
            .iter()
            .any(|w| w.level == WarnLevel::Error && w.message.contains("webhook secret")));
        assert!(cfg.ensure_valid().is_err());
    }

    #[test]
    fn configured_values_pass_validation() {
        let mut cfg = Config::default();
        cfg.webhook.secret = "s3cret".into();
        cfg.llm.api_key = "sk".into();
        cfg.github.token = "ghp".into();
        assert!(cfg.validate().is_empty());
        assert!(cfg.ensure_valid().is_ok());
    }

    #[test]
    fn llm_provider_defaults_to_openai_and_parses_lowercase() {
        assert_eq!(Config::default().llm.provider, LlmProvider::OpenAi);
        let cfg: Config =
            serde_yaml::from_str("llm:\n  provider: anthropic\n  model: claude-sonnet\n").unwrap();
        assert_eq!(cfg.llm.provider, LlmProvider::Anthropic);
        assert_eq!(cfg.llm.model, "claude-sonnet");
        assert!(cfg.llm.base_url.is_empty());
        assert!(serde_yaml::from_str::<Config>("llm:\n  provider: bard\n").is_err());
    }

    #[test]
    fn ollama_does_not_need_an_api_key() {
        let mut cfg = Config::default();
        cfg.webhook.secret = "s3cret".into();
        cfg.github.token = "ghp".into();
        assert!(cfg.validate().iter().any(|w| w.message.contains("llm api key")));
        cfg.llm.provider = LlmProvider::Ollama;
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("conf/issueflow.yaml");
        let mut cfg = Config::default();
        cfg.llm.model = "local-model".into();
        cfg.save(&path).unwrap();
        let back = Config::load_file(&path).unwrap();
        assert_eq!(back.llm.model, "local-model");
    }
}
