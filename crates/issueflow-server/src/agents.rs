//! `LanguageModel` over the configured chat provider.
//!
//! Prompts are deliberately short: each names the role, the domain profile
//! from configuration, and the exact JSON shape expected back.

use async_trait::async_trait;
use issueflow_core::collab::{
    CodeRequest, CollabError, CollabResult, Collaborator, GeneratedCode, LanguageModel,
    RefineRequest, Refinement,
};
use issueflow_core::config::{DomainProfile, LlmConfig, LlmProvider};
use issueflow_core::conversation::Analysis;
use issueflow_core::types::TurnRole;
use llm_agent::{ChatClient, ChatConfig, LlmError, Provider};
use std::fmt::Write as _;
use std::time::Duration;

const REFINE_ROLE: &str = "You are an experienced product owner. Decide whether a GitHub issue \
is clear enough to implement. Ask specific, focused questions when it is not; otherwise rewrite \
it as a precise requirement with testable acceptance criteria.";

const REFINE_SHAPE: &str = r#"Reply with one JSON object:
{"needs_clarification": bool, "questions": [string], "refined_description": string,
 "acceptance_criteria": [string], "suggested_labels": [string],
 "complexity": "low" | "medium" | "high"}"#;

const CODE_ROLE: &str = "You are a senior software engineer. Implement the requirement with \
small, readable changes and tests for both success and failure paths.";

const CODE_SHAPE: &str = r#"Reply with one JSON object:
{"files": [{"path": string, "content": string, "operation": "create" | "modify" | "delete",
            "language": string, "description": string}],
 "tests": [{"path": string, "content": string, "framework": string, "test_count": number}],
 "branch_name": string, "pr_title": string, "pr_description": string,
 "commit_message": string}"#;

pub struct ChatModel {
    client: ChatClient,
}

impl ChatModel {
    pub fn new(client: ChatClient) -> Self {
        Self { client }
    }

    pub fn from_config(cfg: &LlmConfig) -> Result<Self, LlmError> {
        let provider = match cfg.provider {
            LlmProvider::OpenAi => Provider::OpenAi,
            LlmProvider::Anthropic => Provider::Anthropic,
            LlmProvider::Ollama => Provider::Ollama,
        };
        let client = ChatClient::new(ChatConfig {
            provider,
            base_url: cfg.base_url.clone(),
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
            temperature: cfg.temperature,
            max_tokens: cfg.max_tokens,
            timeout: Duration::from_secs(cfg.timeout_secs),
        })?;
        tracing::info!(
            provider = %provider,
            model = %client.config().model,
            endpoint = client.endpoint(),
            "chat model configured"
        );
        Ok(Self::new(client))
    }
}

#[async_trait]
impl LanguageModel for ChatModel {
    async fn refine(&self, req: RefineRequest<'_>) -> CollabResult<Refinement> {
        let system = system_prompt(REFINE_ROLE, req.domain, REFINE_SHAPE);
        let user = refine_prompt(&req);
        self.client
            .complete_json::<Refinement>(&system, &user)
            .await
            .map(|reply| reply.value)
            .map_err(collab_error)
    }

    async fn generate_code(&self, req: CodeRequest<'_>) -> CollabResult<GeneratedCode> {
        let system = system_prompt(CODE_ROLE, req.domain, CODE_SHAPE);
        let user = code_prompt(&req);
        self.client
            .complete_json::<GeneratedCode>(&system, &user)
            .await
            .map(|reply| reply.value)
            .map_err(collab_error)
    }

    fn is_configured(&self) -> bool {
        self.client.is_configured()
    }
}

fn collab_error(e: LlmError) -> CollabError {
    if e.is_transient() {
        CollabError::transient(Collaborator::Llm, e.to_string())
    } else {
        CollabError::permanent(Collaborator::Llm, e.to_string())
    }
}

fn system_prompt(role: &str, domain: &DomainProfile, shape: &str) -> String {
    let mut out = String::from(role);
    if !domain.domain_context.trim().is_empty() {
        let _ = write!(out, "\n\nDomain context:\n{}", domain.domain_context.trim());
    }
    let stack = &domain.tech_stack;
    let parts: Vec<String> = [
        ("Language", &stack.language),
        ("Framework", &stack.framework),
        ("Tests", &stack.test_framework),
    ]
    .iter()
    .filter(|(_, v)| !v.trim().is_empty())
    .map(|(k, v)| format!("{k}: {}", v.trim()))
    .collect();
    if !parts.is_empty() {
        let _ = write!(out, "\n\nTech stack: {}", parts.join(", "));
    }
    let _ = write!(out, "\n\n{shape}");
    out
}

fn refine_prompt(req: &RefineRequest<'_>) -> String {
    let mut out = format!(
        "Issue #{} in {}.\n\nConversation so far:\n",
        req.issue_number, req.repo_full_name
    );
    for turn in req.turns {
        let who = match (turn.role, turn.author.as_deref()) {
            (TurnRole::Agent, _) => "assistant".to_string(),
            (TurnRole::User, Some(author)) => format!("@{author}"),
            (TurnRole::User, None) => "user".to_string(),
        };
        let _ = writeln!(out, "--- {who}\n{}", turn.text.trim());
    }
    if let Some(Analysis::Clarifying { questions, .. }) = req.analysis {
        out.push_str("\nQuestions asked previously:\n");
        for (i, q) in questions.iter().enumerate() {
            let _ = writeln!(out, "{}. {q}", i + 1);
        }
        out.push_str("Decide whether the replies answer them.\n");
    }
    out
}

fn code_prompt(req: &CodeRequest<'_>) -> String {
    let mut out = format!(
        "Implement issue #{} in {}.\n\nRequirement:\n{}\n",
        req.issue_number,
        req.repo_full_name,
        req.refined_description.trim()
    );
    if !req.acceptance_criteria.is_empty() {
        out.push_str("\nAcceptance criteria:\n");
        for (i, c) in req.acceptance_criteria.iter().enumerate() {
            let _ = writeln!(out, "{}. {c}", i + 1);
        }
    }
    out
}
