use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use issueflow_core::config::Config;
use issueflow_core::orchestrator::Orchestrator;
use issueflow_core::store::{SqliteStore, Store};

use crate::agents::ChatModel;
use crate::github::LogOnlyTracker;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub webhook_secret: Arc<str>,
    /// Upper bound on handling one webhook delivery.
    pub request_timeout: Duration,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        webhook_secret: impl Into<Arc<str>>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            orchestrator,
            webhook_secret: webhook_secret.into(),
            request_timeout,
            started_at: Utc::now(),
        }
    }

    /// Open the database and wire the configured collaborators.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let store = SqliteStore::open(&config.database.path).with_context(|| {
            format!("failed to open database {}", config.database.path.display())
        })?;
        let llm = ChatModel::from_config(&config.llm).context("failed to build LLM client")?;
        let orchestrator = Orchestrator::new(
            Arc::new(store),
            Arc::new(llm),
            Arc::new(LogOnlyTracker::new()),
            config.agent.clone(),
        );
        Ok(Self::new(
            Arc::new(orchestrator),
            config.webhook.secret.as_str(),
            Duration::from_secs(config.server.request_timeout_secs),
        ))
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        self.orchestrator.store()
    }
}
