//! Orchestrator: wires ingress, the store, refinement and code generation
//! together.
//!
//! This is the only component that calls the LLM and GitHub collaborators.
//! Every call is timed into the action log and retried with exponential
//! backoff when the collaborator reports a transient failure. Apart from
//! authentication failures, nothing escapes [`Orchestrator::handle_delivery`]
//! as an error: each problem is recorded as an [`AgentAction`] and reported
//! through the returned [`Outcome`].
//!
//! [`AgentAction`]: crate::action::AgentAction

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::action::{ActionPayload, AgentAction};
use crate::action_log::{ActionLogger, Stopwatch};
use crate::collab::{
    CodeRequest, CollabError, CollabResult, IssueTracker, LanguageModel, RefineRequest,
};
use crate::config::{AgentSettings, LabelConfig};
use crate::conversation::{Analysis, Conversation, Turn};
use crate::error::{FlowError, Result};
use crate::generation::CodeGeneration;
use crate::ingress::{self, EventKind, Inbound, IssueEvent, IssueRef};
use crate::refine::{self, Plan};
use crate::store::{
    ActionQuery, DeliveryClaim, GenerationStart, Store, Transition, TransitionRecord,
};
use crate::tracker::{self, StatusUpdate};
use crate::types::{AgentKind, ConversationStatus, GenerationStatus};

/// How many times a decision that lost a version race is recomputed.
const CONFLICT_REANALYSES: u32 = 2;

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// What handling one delivery amounted to.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Ignored {
        reason: String,
    },
    Duplicate {
        delivery_id: String,
    },
    InProgress {
        delivery_id: String,
    },
    Rejected {
        error: String,
    },
    QuestionsAsked {
        conversation_id: Uuid,
        questions: usize,
    },
    MarkedReady {
        conversation_id: Uuid,
    },
    Unchanged {
        conversation_id: Uuid,
    },
    Generated {
        conversation_id: Uuid,
        generation_id: Uuid,
        status: GenerationStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        pr_number: Option<u64>,
    },
    GenerationUpdated {
        generation_id: Uuid,
        status: GenerationStatus,
    },
    Completed {
        conversation_id: Uuid,
    },
    Conflict {
        conversation_id: Uuid,
        reason: String,
    },
    Failed {
        error: String,
        /// The delivery claim was released so a redelivery runs again.
        retryable: bool,
    },
}

impl Outcome {
    fn releases_delivery(&self) -> bool {
        matches!(
            self,
            Outcome::Failed {
                retryable: true,
                ..
            } | Outcome::Conflict { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationSummary {
    pub id: Uuid,
    pub status: GenerationStatus,
    pub pr_number: Option<u64>,
    pub pr_url: Option<String>,
    pub branch_name: Option<String>,
    pub error_message: Option<String>,
}

impl From<&CodeGeneration> for GenerationSummary {
    fn from(g: &CodeGeneration) -> Self {
        Self {
            id: g.id,
            status: g.status,
            pr_number: g.pr_number,
            pr_url: g.pr_url.clone(),
            branch_name: g.branch_name.clone(),
            error_message: g.error_message.clone(),
        }
    }
}

/// Where an issue stands in the workflow.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowStatus {
    pub exists: bool,
    /// Conversation status, or `not_started`.
    pub stage: String,
    pub repo_full_name: String,
    pub issue_number: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<Uuid>,
    pub version: u64,
    pub turn_count: usize,
    pub action_count: usize,
    pub generation_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_generation: Option<GenerationSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<Analysis>,
    pub transitions: Vec<TransitionRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// A logged refinement decision whose transition never committed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconcileCase {
    pub conversation_id: Uuid,
    pub repo_full_name: String,
    pub issue_number: u64,
    pub event_id: String,
    pub target_status: ConversationStatus,
    pub current_status: ConversationStatus,
    pub logged_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    store: Arc<dyn Store>,
    llm: Arc<dyn LanguageModel>,
    tracker: Arc<dyn IssueTracker>,
    settings: AgentSettings,
    log: ActionLogger,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        llm: Arc<dyn LanguageModel>,
        tracker: Arc<dyn IssueTracker>,
        settings: AgentSettings,
    ) -> Self {
        let log = ActionLogger::new(Arc::clone(&store));
        Self {
            store,
            llm,
            tracker,
            settings,
            log,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    pub fn llm_configured(&self) -> bool {
        self.llm.is_configured()
    }

    pub fn tracker_configured(&self) -> bool {
        self.tracker.is_configured()
    }

    // -----------------------------------------------------------------------
    // Ingress
    // -----------------------------------------------------------------------

    /// Authenticate, normalize and handle one webhook delivery.
    ///
    /// Returns `Err` only for [`FlowError::Authentication`].
    pub async fn handle_delivery(
        &self,
        event_name: &str,
        delivery_id: Option<&str>,
        body: &[u8],
        signature: Option<&str>,
        secret: &str,
    ) -> Result<Outcome> {
        let watch = Stopwatch::start();
        let inbound = match ingress::normalize(event_name, delivery_id, body, signature, secret) {
            Ok(inbound) => inbound,
            Err(e @ FlowError::Authentication(_)) => return Err(e),
            Err(e) => {
                let delivery_id = delivery_id
                    .map(str::to_string)
                    .unwrap_or_else(|| ingress::body_digest(body));
                let payload = ActionPayload::EventRejected {
                    event_name: event_name.to_string(),
                    delivery_id,
                };
                if let Err(log_err) = self
                    .log
                    .failure(None, AgentKind::Orchestrator, payload, &e, &watch)
                    .await
                {
                    tracing::error!(error = %log_err, "could not record rejected delivery");
                }
                return Ok(Outcome::Rejected {
                    error: e.to_string(),
                });
            }
        };

        match inbound {
            Inbound::Ignored {
                delivery_id,
                reason,
            } => {
                tracing::debug!(delivery = %delivery_id, event = event_name, %reason, "delivery ignored");
                Ok(Outcome::Ignored { reason })
            }
            Inbound::Event(event) => match self.handle_event(&event).await {
                Ok(outcome) => Ok(outcome),
                Err(e) => {
                    tracing::error!(
                        delivery = %event.delivery_id,
                        repo = %event.repo_full_name,
                        error = %e,
                        "delivery handling failed"
                    );
                    Ok(Outcome::Failed {
                        error: e.to_string(),
                        retryable: true,
                    })
                }
            },
        }
    }

    /// Handle a normalized event under its delivery claim.
    pub async fn handle_event(&self, event: &IssueEvent) -> Result<Outcome> {
        let watch = Stopwatch::start();
        let claim = self.store.claim_delivery(&event.delivery_id).await?;
        if claim != DeliveryClaim::Claimed {
            let conversation_id = self.conversation_for(event).await?.map(|c| c.id);
            let reason = if claim == DeliveryClaim::Completed {
                "delivery already processed"
            } else {
                "delivery is being processed"
            };
            self.log
                .partial(
                    conversation_id,
                    AgentKind::Orchestrator,
                    ActionPayload::DuplicateDelivery {
                        delivery_id: event.delivery_id.clone(),
                    },
                    reason,
                    &watch,
                )
                .await?;
            let delivery_id = event.delivery_id.clone();
            return Ok(if claim == DeliveryClaim::Completed {
                Outcome::Duplicate { delivery_id }
            } else {
                Outcome::InProgress { delivery_id }
            });
        }

        tracing::info!(
            delivery = %event.delivery_id,
            repo = %event.repo_full_name,
            event = event.kind.name(),
            "handling delivery"
        );

        match self.dispatch(event).await {
            Ok(outcome) => {
                if outcome.releases_delivery() {
                    self.store.release_delivery(&event.delivery_id).await?;
                } else {
                    self.store.complete_delivery(&event.delivery_id).await?;
                }
                Ok(outcome)
            }
            Err(e) => {
                if let Err(release_err) = self.store.release_delivery(&event.delivery_id).await {
                    tracing::error!(error = %release_err, "could not release delivery claim");
                }
                Err(e)
            }
        }
    }

    /// Record that handling `delivery_id` exceeded `limit` and free its claim.
    pub async fn record_timeout(&self, delivery_id: &str, limit: Duration) -> Result<()> {
        let watch = Stopwatch::start();
        self.log
            .failure(
                None,
                AgentKind::Orchestrator,
                ActionPayload::TimedOut {
                    delivery_id: delivery_id.to_string(),
                    limit_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                },
                format!("handling exceeded {}ms", limit.as_millis()),
                &watch,
            )
            .await?;
        self.store.release_delivery(delivery_id).await
    }

    async fn conversation_for(&self, event: &IssueEvent) -> Result<Option<Conversation>> {
        if let Some(issue) = event.kind.issue() {
            return self
                .store
                .find_conversation(&event.repo_full_name, issue.number)
                .await;
        }
        let linked = match &event.kind {
            EventKind::PullRequestOpened { linked_issue, .. }
            | EventKind::PullRequestClosed { linked_issue, .. } => *linked_issue,
            _ => None,
        };
        match linked {
            Some(n) => self.store.find_conversation(&event.repo_full_name, n).await,
            None => Ok(None),
        }
    }

    async fn dispatch(&self, event: &IssueEvent) -> Result<Outcome> {
        let repo = event.repo_full_name.as_str();
        match &event.kind {
            EventKind::IssueOpened {
                issue,
                author,
                text,
            } => self.on_issue_text(event, *issue, author.clone(), text).await,
            EventKind::CommentCreated {
                issue,
                author,
                text,
                ..
            } => {
                if refine::is_own_comment(text, &self.settings.bot_signature) {
                    return Ok(Outcome::Ignored {
                        reason: "comment posted by issueflow".to_string(),
                    });
                }
                self.on_issue_text(event, *issue, author.clone(), text).await
            }
            EventKind::IssueLabeled { issue, label, text } => {
                if *label != self.settings.labels.ready_for_dev {
                    return Ok(Outcome::Ignored {
                        reason: format!("label '{label}' does not trigger anything"),
                    });
                }
                self.on_ready_label(event, *issue, text).await
            }
            EventKind::PullRequestOpened { number, .. } => {
                match self.store.find_generation_by_pr(repo, *number).await? {
                    Some(g) => Ok(Outcome::Unchanged {
                        conversation_id: g.conversation_id,
                    }),
                    None => Ok(Outcome::Ignored {
                        reason: format!("pull request #{number} is not tracked"),
                    }),
                }
            }
            EventKind::PullRequestClosed { number, merged, .. } => {
                let to = if *merged {
                    GenerationStatus::Merged
                } else {
                    GenerationStatus::Closed
                };
                self.apply_pr_status(repo, *number, to, &event.delivery_id)
                    .await
            }
            EventKind::CheckSuiteCompleted {
                pull_requests,
                conclusion,
            } => {
                let Some(to) = tracker::status_from_ci(conclusion) else {
                    return Ok(Outcome::Ignored {
                        reason: format!("check suite concluded '{conclusion}'"),
                    });
                };
                let mut last = Outcome::Ignored {
                    reason: "check suite has no tracked pull request".to_string(),
                };
                for number in pull_requests {
                    let outcome = self
                        .apply_pr_status(repo, *number, to, &event.delivery_id)
                        .await?;
                    if !matches!(outcome, Outcome::Ignored { .. }) {
                        last = outcome;
                    }
                }
                Ok(last)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Refinement
    // -----------------------------------------------------------------------

    async fn on_issue_text(
        &self,
        event: &IssueEvent,
        issue: IssueRef,
        author: Option<String>,
        text: &str,
    ) -> Result<Outcome> {
        let watch = Stopwatch::start();
        let (conversation, created) = self
            .store
            .get_or_create_conversation(&event.repo_full_name, issue.number, issue.id)
            .await?;
        if created {
            tracing::info!(
                repo = %event.repo_full_name,
                issue = issue.number,
                conversation = %conversation.id,
                "started conversation"
            );
        }

        if conversation.status.is_terminal() {
            let reason = format!("conversation is {}", conversation.status);
            self.log
                .partial(
                    Some(conversation.id),
                    AgentKind::Orchestrator,
                    ActionPayload::EventIgnored {
                        event_id: event.delivery_id.clone(),
                        reason: reason.clone(),
                    },
                    &reason,
                    &watch,
                )
                .await?;
            return Ok(Outcome::Ignored { reason });
        }

        let conversation = self
            .store
            .append_turn(conversation.id, Turn::user(author, text, &event.delivery_id))
            .await?;
        self.analyze(conversation, &event.delivery_id).await
    }

    /// Run the refinement agent over `conversation` and apply its decision.
    ///
    /// A decision that loses the version race to a concurrent event is
    /// recomputed against the reloaded conversation, so every user turn feeds
    /// a committed analysis. Contention beyond `CONFLICT_REANALYSES` is
    /// reported as a conflict.
    async fn analyze(&self, mut conversation: Conversation, event_id: &str) -> Result<Outcome> {
        let mut reanalyses = 0;
        loop {
            let outcome = self.analyze_once(&conversation, event_id).await?;
            if !matches!(outcome, Outcome::Conflict { .. }) || reanalyses >= CONFLICT_REANALYSES {
                return Ok(outcome);
            }
            reanalyses += 1;
            conversation = self.store.load_conversation(conversation.id).await?;
            tracing::info!(
                conversation = %conversation.id,
                event = event_id,
                version = conversation.version,
                attempt = reanalyses,
                "re-analyzing after concurrent update"
            );
        }
    }

    async fn analyze_once(&self, conversation: &Conversation, event_id: &str) -> Result<Outcome> {
        let watch = Stopwatch::start();

        let already_applied = self
            .store
            .list_transitions(conversation.id)
            .await?
            .iter()
            .any(|t| t.event_id == event_id);
        if already_applied {
            self.log
                .partial(
                    Some(conversation.id),
                    AgentKind::Orchestrator,
                    ActionPayload::DuplicateDelivery {
                        delivery_id: event_id.to_string(),
                    },
                    "decision for this delivery was already applied",
                    &watch,
                )
                .await?;
            return Ok(Outcome::Duplicate {
                delivery_id: event_id.to_string(),
            });
        }

        let decision = self
            .with_retries("refine", || {
                self.llm.refine(RefineRequest {
                    repo_full_name: &conversation.repo_full_name,
                    issue_number: conversation.issue_number,
                    turns: &conversation.turns,
                    analysis: conversation.analysis.as_ref(),
                    domain: &self.settings.profile,
                })
            })
            .await
            .and_then(|r| refine::plan(conversation, r));

        let plan = match decision {
            Ok(plan) => plan,
            Err(e) => {
                return self
                    .automation_unavailable(conversation, event_id, e, &watch)
                    .await
            }
        };

        // The decision is logged before the transition commits.
        self.log
            .success(
                Some(conversation.id),
                AgentKind::ProductOwner,
                ActionPayload::IssueAnalyzed {
                    event_id: event_id.to_string(),
                    needs_clarification: matches!(plan, Plan::AskQuestions { .. }),
                    question_count: plan.question_count(),
                    target_status: plan.target_status(),
                },
                &watch,
            )
            .await?;

        let Some(target) = plan.target_status() else {
            return Ok(Outcome::Unchanged {
                conversation_id: conversation.id,
            });
        };

        let previous = conversation.status;
        let transition = Transition {
            conversation_id: conversation.id,
            expected_version: conversation.version,
            to: target,
            analysis: plan.analysis().cloned(),
            event_id: event_id.to_string(),
        };
        let conversation = match self.commit(transition, previous, &watch).await? {
            Committed::Applied(c) => c,
            Committed::Replayed(c) => {
                return Ok(Outcome::Unchanged {
                    conversation_id: c.id,
                })
            }
            Committed::Declined(outcome) => return Ok(outcome),
        };

        match plan {
            Plan::AskQuestions { questions, .. } => {
                self.post_questions(&conversation, previous, &questions, event_id)
                    .await
            }
            Plan::MarkReady {
                analysis,
                suggested_labels,
            } => {
                self.post_ready(&conversation, &analysis, &suggested_labels, event_id)
                    .await
            }
            Plan::KeepStatus => Ok(Outcome::Unchanged {
                conversation_id: conversation.id,
            }),
        }
    }

    /// Commit a transition, turning contention and table violations into
    /// logged outcomes.
    async fn commit(
        &self,
        transition: Transition,
        from: ConversationStatus,
        watch: &Stopwatch,
    ) -> Result<Committed> {
        let conversation_id = transition.conversation_id;
        let event_id = transition.event_id.clone();
        let expected_version = transition.expected_version;
        let to = transition.to;

        match self.store.transition(transition).await {
            Ok(outcome) if outcome.is_replay() => {
                Ok(Committed::Replayed(outcome.into_conversation()))
            }
            Ok(outcome) => {
                let c = outcome.into_conversation();
                tracing::info!(
                    conversation = %c.id,
                    from = %from,
                    to = %c.status,
                    version = c.version,
                    "conversation transitioned"
                );
                Ok(Committed::Applied(c))
            }
            Err(e @ FlowError::ConcurrencyConflict { .. }) => {
                self.log
                    .partial(
                        Some(conversation_id),
                        AgentKind::Orchestrator,
                        ActionPayload::ConcurrencyConflict {
                            event_id,
                            expected_version,
                        },
                        &e,
                        watch,
                    )
                    .await?;
                Ok(Committed::Declined(Outcome::Conflict {
                    conversation_id,
                    reason: e.to_string(),
                }))
            }
            Err(e @ FlowError::InvalidTransition { .. }) => {
                self.log
                    .failure(
                        Some(conversation_id),
                        AgentKind::Orchestrator,
                        ActionPayload::TransitionRejected { event_id, from, to },
                        &e,
                        watch,
                    )
                    .await?;
                Ok(Committed::Declined(Outcome::Failed {
                    error: e.to_string(),
                    retryable: false,
                }))
            }
            Err(e) => Err(e),
        }
    }

    async fn automation_unavailable(
        &self,
        conversation: &Conversation,
        event_id: &str,
        error: CollabError,
        watch: &Stopwatch,
    ) -> Result<Outcome> {
        let notice = refine::unavailable_notice(&self.settings.bot_signature);
        let notice_posted = match self
            .tracker
            .post_comment(&conversation.repo_full_name, conversation.issue_number, &notice)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "could not post unavailable notice");
                false
            }
        };
        self.log
            .failure(
                Some(conversation.id),
                AgentKind::ProductOwner,
                ActionPayload::AutomationUnavailable {
                    event_id: event_id.to_string(),
                    notice_posted,
                },
                &error,
                watch,
            )
            .await?;
        Ok(Outcome::Failed {
            error: error.to_string(),
            retryable: true,
        })
    }

    async fn post_questions(
        &self,
        conversation: &Conversation,
        previous: ConversationStatus,
        questions: &[String],
        event_id: &str,
    ) -> Result<Outcome> {
        let watch = Stopwatch::start();
        let repo = conversation.repo_full_name.as_str();
        let issue = conversation.issue_number;
        let body = refine::questions_comment(questions, &self.settings.bot_signature);
        let labels = [self.settings.labels.needs_clarification.clone()];

        let posted: CollabResult<()> = async {
            self.with_retries("post_comment", || self.tracker.post_comment(repo, issue, &body))
                .await?;
            self.with_retries("add_labels", || self.tracker.add_labels(repo, issue, &labels))
                .await?;
            Ok(())
        }
        .await;

        if matches!(
            previous,
            ConversationStatus::ReadyForDev | ConversationStatus::InDevelopment
        ) {
            self.remove_label_best_effort(repo, issue, &self.settings.labels.ready_for_dev)
                .await;
        }

        let payload = ActionPayload::QuestionsAsked {
            issue_number: issue,
            questions: questions.to_vec(),
        };
        match posted {
            Ok(()) => {
                self.store
                    .append_turn(conversation.id, Turn::agent(body, event_id))
                    .await?;
                self.log
                    .success(Some(conversation.id), AgentKind::ProductOwner, payload, &watch)
                    .await?;
                Ok(Outcome::QuestionsAsked {
                    conversation_id: conversation.id,
                    questions: questions.len(),
                })
            }
            Err(e) => {
                self.log
                    .failure(Some(conversation.id), AgentKind::ProductOwner, payload, &e, &watch)
                    .await?;
                Ok(Outcome::Failed {
                    error: e.to_string(),
                    retryable: false,
                })
            }
        }
    }

    async fn post_ready(
        &self,
        conversation: &Conversation,
        analysis: &Analysis,
        suggested_labels: &[String],
        event_id: &str,
    ) -> Result<Outcome> {
        let watch = Stopwatch::start();
        let repo = conversation.repo_full_name.as_str();
        let issue = conversation.issue_number;
        let body = refine::ready_comment(analysis, &self.settings.bot_signature);

        let labels = ready_labels(suggested_labels, &self.settings.labels);

        self.remove_label_best_effort(repo, issue, &self.settings.labels.needs_clarification)
            .await;
        let posted: CollabResult<()> = async {
            self.with_retries("post_comment", || self.tracker.post_comment(repo, issue, &body))
                .await?;
            self.with_retries("add_labels", || self.tracker.add_labels(repo, issue, &labels))
                .await?;
            Ok(())
        }
        .await;

        let payload = ActionPayload::MarkedReadyForDev {
            issue_number: issue,
            refined_description: analysis.refined_description().unwrap_or_default().to_string(),
            acceptance_criteria_count: analysis.acceptance_criteria().len(),
        };
        if let Err(e) = posted {
            self.log
                .failure(Some(conversation.id), AgentKind::ProductOwner, payload, &e, &watch)
                .await?;
            return Ok(Outcome::Failed {
                error: e.to_string(),
                retryable: false,
            });
        }

        self.store
            .append_turn(conversation.id, Turn::agent(body, event_id))
            .await?;
        self.log
            .success(Some(conversation.id), AgentKind::ProductOwner, payload, &watch)
            .await?;

        if self.settings.auto_generate {
            if let outcome @ Outcome::Generated { .. } =
                self.run_generation(conversation.id, event_id).await?
            {
                return Ok(outcome);
            }
        }
        Ok(Outcome::MarkedReady {
            conversation_id: conversation.id,
        })
    }

    async fn remove_label_best_effort(&self, repo: &str, issue: u64, label: &str) {
        // GitHub answers 404 when the label is not present.
        if let Err(e) = self.tracker.remove_label(repo, issue, label).await {
            tracing::debug!(repo, issue, label, error = %e, "label removal failed");
        }
    }

    // -----------------------------------------------------------------------
    // Code generation
    // -----------------------------------------------------------------------

    async fn on_ready_label(
        &self,
        event: &IssueEvent,
        issue: IssueRef,
        text: &str,
    ) -> Result<Outcome> {
        let Some(conversation) = self
            .store
            .find_conversation(&event.repo_full_name, issue.number)
            .await?
        else {
            // Labeled before issueflow ever saw the issue: analyze it first.
            return self.on_issue_text(event, issue, None, text).await;
        };

        match conversation.status {
            ConversationStatus::ReadyForDev | ConversationStatus::InDevelopment => {
                self.run_generation(conversation.id, &event.delivery_id)
                    .await
            }
            status => {
                let watch = Stopwatch::start();
                let reason = format!("conversation is {status}, not ready for development");
                self.log
                    .partial(
                        Some(conversation.id),
                        AgentKind::Developer,
                        ActionPayload::EventIgnored {
                            event_id: event.delivery_id.clone(),
                            reason: reason.clone(),
                        },
                        &reason,
                        &watch,
                    )
                    .await?;
                Ok(Outcome::Ignored { reason })
            }
        }
    }

    async fn run_generation(&self, conversation_id: Uuid, event_id: &str) -> Result<Outcome> {
        match self.generate(conversation_id, event_id).await {
            Ok(g) => Ok(Outcome::Generated {
                conversation_id,
                generation_id: g.id,
                status: g.status,
                pr_number: g.pr_number,
            }),
            Err(e) if e.is_contention() => Ok(Outcome::Conflict {
                conversation_id,
                reason: e.to_string(),
            }),
            Err(e @ FlowError::InvalidTransition { .. }) => Ok(Outcome::Failed {
                error: e.to_string(),
                retryable: false,
            }),
            Err(FlowError::Collaborator(e)) => Ok(Outcome::Failed {
                error: e.to_string(),
                retryable: e.transient,
            }),
            Err(e) => Err(e),
        }
    }

    /// Generate code for a ready conversation and open its pull request.
    ///
    /// The conversation enters `in_development` together with the new
    /// `generated` row. A failure to open the pull request marks the row
    /// `failed` and still returns it; the conversation stays in development
    /// so generation can be retried.
    pub async fn generate(&self, conversation_id: Uuid, event_id: &str) -> Result<CodeGeneration> {
        let watch = Stopwatch::start();
        let conversation = self.store.load_conversation(conversation_id).await?;

        if !matches!(
            conversation.status,
            ConversationStatus::ReadyForDev | ConversationStatus::InDevelopment
        ) {
            let err = FlowError::InvalidTransition {
                from: conversation.status.to_string(),
                to: ConversationStatus::InDevelopment.to_string(),
                reason: "code generation needs a conversation that is ready for development"
                    .to_string(),
            };
            self.log_generation_error(&conversation, event_id, &err, &watch)
                .await?;
            return Err(err);
        }

        let previous = self.store.list_generations(conversation_id).await?;
        if let Some(live) = previous.iter().find(|g| g.status.is_in_flight()) {
            let err = FlowError::GenerationInFlight {
                conversation_id,
                generation_id: live.id,
            };
            self.log_generation_error(&conversation, event_id, &err, &watch)
                .await?;
            return Err(err);
        }

        let description = conversation
            .analysis
            .as_ref()
            .and_then(Analysis::refined_description)
            .or_else(|| conversation.original_request())
            .unwrap_or_default()
            .to_string();
        let criteria: Vec<String> = conversation
            .analysis
            .as_ref()
            .map(|a| a.acceptance_criteria().to_vec())
            .unwrap_or_default();

        let code = match self
            .with_retries("generate_code", || {
                self.llm.generate_code(CodeRequest {
                    repo_full_name: &conversation.repo_full_name,
                    issue_number: conversation.issue_number,
                    refined_description: &description,
                    acceptance_criteria: &criteria,
                    domain: &self.settings.profile,
                })
            })
            .await
        {
            Ok(code) => code,
            Err(e) => {
                let err = FlowError::Collaborator(e);
                self.log_generation_error(&conversation, event_id, &err, &watch)
                    .await?;
                return Err(err);
            }
        };

        let start = GenerationStart {
            expected_version: conversation.version,
            event_id: event_id.to_string(),
            generation: CodeGeneration::new(
                conversation_id,
                code.files.clone(),
                code.tests.clone(),
                code.review.clone(),
            ),
        };
        let (conversation, mut generation) = match self.store.begin_generation(start).await {
            Ok(started) => started,
            Err(e) => {
                if e.is_contention() || matches!(e, FlowError::InvalidTransition { .. }) {
                    self.log_generation_error(&conversation, event_id, &e, &watch)
                        .await?;
                }
                return Err(e);
            }
        };
        self.log
            .success(
                Some(conversation_id),
                AgentKind::Developer,
                ActionPayload::CodeGenerated {
                    event_id: event_id.to_string(),
                    generation_id: Some(generation.id),
                    files: generation.files_changed.len(),
                    tests: generation.tests_generated.len(),
                },
                &watch,
            )
            .await?;

        let branch = tracker::branch_for(
            conversation.issue_number,
            previous.len() + 1,
            code.branch_name.as_deref(),
        );
        let draft = tracker::draft(&conversation, &code, &branch, &self.settings.base_branch);
        let pr_watch = Stopwatch::start();
        let opened = self
            .with_retries("open_pull_request", || {
                self.tracker.open_pull_request(draft.clone())
            })
            .await;

        match opened {
            Ok(pr) => {
                generation.mark_pr_created(pr.number, pr.url.clone(), branch.clone())?;
                self.store.update_generation(&generation).await?;
                self.log
                    .success(
                        Some(conversation_id),
                        AgentKind::Developer,
                        ActionPayload::PrCreated {
                            generation_id: generation.id,
                            pr_number: Some(pr.number),
                            pr_url: Some(pr.url.clone()),
                            branch_name: branch.clone(),
                        },
                        &pr_watch,
                    )
                    .await?;

                let body = refine::pull_request_comment(
                    &pr.url,
                    &branch,
                    generation.files_changed.len(),
                    generation.tests_generated.len(),
                    &self.settings.bot_signature,
                );
                match self
                    .tracker
                    .post_comment(&conversation.repo_full_name, conversation.issue_number, &body)
                    .await
                {
                    Ok(()) => {
                        // Keyed apart from the ready comment posted for the same event.
                        let turn_event = format!("{event_id}:pr-{}", pr.number);
                        self.store
                            .append_turn(conversation_id, Turn::agent(body, &turn_event))
                            .await?;
                    }
                    Err(e) => tracing::warn!(error = %e, "could not announce pull request"),
                }
            }
            Err(e) => {
                generation.mark_failed(branch.clone(), e.to_string())?;
                self.store.update_generation(&generation).await?;
                self.log
                    .failure(
                        Some(conversation_id),
                        AgentKind::Developer,
                        ActionPayload::PrCreated {
                            generation_id: generation.id,
                            pr_number: None,
                            pr_url: None,
                            branch_name: branch,
                        },
                        &e,
                        &pr_watch,
                    )
                    .await?;
            }
        }

        Ok(generation)
    }

    async fn log_generation_error(
        &self,
        conversation: &Conversation,
        event_id: &str,
        error: &FlowError,
        watch: &Stopwatch,
    ) -> Result<()> {
        let id = Some(conversation.id);
        let event_id = event_id.to_string();
        match error {
            FlowError::GenerationInFlight { generation_id, .. } => {
                self.log
                    .partial(
                        id,
                        AgentKind::Developer,
                        ActionPayload::GenerationSkipped {
                            event_id,
                            in_flight: *generation_id,
                        },
                        error,
                        watch,
                    )
                    .await?;
            }
            FlowError::ConcurrencyConflict {
                expected_version, ..
            } => {
                self.log
                    .partial(
                        id,
                        AgentKind::Orchestrator,
                        ActionPayload::ConcurrencyConflict {
                            event_id,
                            expected_version: *expected_version,
                        },
                        error,
                        watch,
                    )
                    .await?;
            }
            FlowError::InvalidTransition { .. } => {
                self.log
                    .failure(
                        id,
                        AgentKind::Developer,
                        ActionPayload::TransitionRejected {
                            event_id,
                            from: conversation.status,
                            to: ConversationStatus::InDevelopment,
                        },
                        error,
                        watch,
                    )
                    .await?;
            }
            _ => {
                self.log
                    .failure(
                        id,
                        AgentKind::Developer,
                        ActionPayload::CodeGenerated {
                            event_id,
                            generation_id: None,
                            files: 0,
                            tests: 0,
                        },
                        error,
                        watch,
                    )
                    .await?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Pull request lifecycle
    // -----------------------------------------------------------------------

    async fn apply_pr_status(
        &self,
        repo: &str,
        pr_number: u64,
        to: GenerationStatus,
        event_id: &str,
    ) -> Result<Outcome> {
        let watch = Stopwatch::start();
        let Some(mut generation) = self.store.find_generation_by_pr(repo, pr_number).await? else {
            return Ok(Outcome::Ignored {
                reason: format!("pull request #{pr_number} is not tracked"),
            });
        };
        let payload = ActionPayload::PrStatusUpdated {
            generation_id: generation.id,
            pr_number,
            status: to,
        };

        match tracker::plan_status_update(generation.status, to) {
            StatusUpdate::Unchanged => Ok(Outcome::Unchanged {
                conversation_id: generation.conversation_id,
            }),
            StatusUpdate::Stale => {
                self.log
                    .partial(
                        Some(generation.conversation_id),
                        AgentKind::Developer,
                        payload,
                        format!("generation is already {}", generation.status),
                        &watch,
                    )
                    .await?;
                Ok(Outcome::Unchanged {
                    conversation_id: generation.conversation_id,
                })
            }
            StatusUpdate::Advance(to) => {
                generation.advance(to)?;
                self.store.update_generation(&generation).await?;
                self.log
                    .success(
                        Some(generation.conversation_id),
                        AgentKind::Developer,
                        payload,
                        &watch,
                    )
                    .await?;
                if to == GenerationStatus::Merged {
                    self.complete_conversation(&generation, pr_number, event_id)
                        .await
                } else {
                    Ok(Outcome::GenerationUpdated {
                        generation_id: generation.id,
                        status: to,
                    })
                }
            }
        }
    }

    async fn complete_conversation(
        &self,
        generation: &CodeGeneration,
        pr_number: u64,
        event_id: &str,
    ) -> Result<Outcome> {
        let watch = Stopwatch::start();
        let conversation = self.store.load_conversation(generation.conversation_id).await?;
        let transition = Transition {
            conversation_id: conversation.id,
            expected_version: conversation.version,
            to: ConversationStatus::Completed,
            analysis: None,
            event_id: event_id.to_string(),
        };
        match self.commit(transition, conversation.status, &watch).await? {
            Committed::Applied(c) => {
                self.log
                    .success(
                        Some(c.id),
                        AgentKind::Orchestrator,
                        ActionPayload::ConversationCompleted {
                            generation_id: generation.id,
                            pr_number,
                        },
                        &watch,
                    )
                    .await?;
                Ok(Outcome::Completed {
                    conversation_id: c.id,
                })
            }
            Committed::Replayed(c) => Ok(Outcome::Unchanged {
                conversation_id: c.id,
            }),
            Committed::Declined(outcome) => Ok(outcome),
        }
    }

    /// Poll GitHub for the state of `pr_number` and apply it, for webhooks
    /// that never arrived.
    pub async fn sync_pull_request(&self, repo: &str, pr_number: u64) -> Result<Outcome> {
        let state = self
            .with_retries("pull_request_status", || {
                self.tracker.pull_request_status(repo, pr_number)
            })
            .await?;
        match tracker::status_from_pr_state(state) {
            Some(to) => {
                let event_id = format!("sync:{repo}#{pr_number}:{to}");
                self.apply_pr_status(repo, pr_number, to, &event_id).await
            }
            None => Ok(Outcome::Ignored {
                reason: format!("pull request #{pr_number} is still open"),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    pub async fn workflow_status(&self, repo: &str, issue_number: u64) -> Result<WorkflowStatus> {
        let Some(c) = self.store.find_conversation(repo, issue_number).await? else {
            return Ok(WorkflowStatus {
                exists: false,
                stage: "not_started".to_string(),
                repo_full_name: repo.to_string(),
                issue_number,
                conversation_id: None,
                version: 0,
                turn_count: 0,
                action_count: 0,
                generation_count: 0,
                latest_generation: None,
                analysis: None,
                transitions: Vec::new(),
                created_at: None,
                updated_at: None,
            });
        };

        let actions = self
            .store
            .list_actions(ActionQuery {
                conversation_id: Some(c.id),
                ..Default::default()
            })
            .await?;
        let generations = self.store.list_generations(c.id).await?;
        let transitions = self.store.list_transitions(c.id).await?;

        Ok(WorkflowStatus {
            exists: true,
            stage: c.status.to_string(),
            repo_full_name: c.repo_full_name.clone(),
            issue_number: c.issue_number,
            conversation_id: Some(c.id),
            version: c.version,
            turn_count: c.turns.len(),
            action_count: actions.len(),
            generation_count: generations.len(),
            latest_generation: generations.last().map(GenerationSummary::from),
            analysis: c.analysis.clone(),
            transitions,
            created_at: Some(c.created_at),
            updated_at: Some(c.updated_at),
        })
    }

    /// Refinement decisions that were logged but whose transition never
    /// committed. Only the latest decision per event counts, and decisions
    /// the workflow table rejected are final.
    pub async fn reconcile(&self) -> Result<Vec<ReconcileCase>> {
        let analyzed = self
            .store
            .list_actions(ActionQuery {
                action_type: Some("issue_analyzed".to_string()),
                ..Default::default()
            })
            .await?;

        let mut rejected: HashSet<(Uuid, String)> = HashSet::new();
        for action in self
            .store
            .list_actions(ActionQuery {
                action_type: Some("transition_rejected".to_string()),
                ..Default::default()
            })
            .await?
        {
            if let (Some(id), ActionPayload::TransitionRejected { event_id, .. }) =
                (action.conversation_id, action.payload)
            {
                rejected.insert((id, event_id));
            }
        }

        // Actions come back oldest first, so later decisions replace earlier ones.
        let mut order: Vec<(Uuid, String)> = Vec::new();
        let mut latest: HashMap<(Uuid, String), AgentAction> = HashMap::new();
        for action in analyzed {
            let (Some(conversation_id), ActionPayload::IssueAnalyzed { event_id, .. }) =
                (action.conversation_id, &action.payload)
            else {
                continue;
            };
            let key = (conversation_id, event_id.clone());
            if latest.insert(key.clone(), action).is_none() {
                order.push(key);
            }
        }

        let mut conversations: HashMap<Uuid, (Conversation, Vec<TransitionRecord>)> =
            HashMap::new();
        let mut cases = Vec::new();
        for key in order {
            if rejected.contains(&key) {
                continue;
            }
            let Some(action) = latest.get(&key) else {
                continue;
            };
            let ActionPayload::IssueAnalyzed {
                target_status: Some(target),
                ..
            } = &action.payload
            else {
                continue;
            };
            let (conversation_id, event_id) = key;
            if !conversations.contains_key(&conversation_id) {
                let c = self.store.load_conversation(conversation_id).await?;
                let t = self.store.list_transitions(conversation_id).await?;
                conversations.insert(conversation_id, (c, t));
            }
            let Some((conversation, transitions)) = conversations.get(&conversation_id) else {
                continue;
            };
            let committed = transitions
                .iter()
                .any(|t| t.event_id == event_id && t.to == *target);
            if !committed {
                cases.push(ReconcileCase {
                    conversation_id,
                    repo_full_name: conversation.repo_full_name.clone(),
                    issue_number: conversation.issue_number,
                    event_id,
                    target_status: *target,
                    current_status: conversation.status,
                    logged_at: action.created_at,
                });
            }
        }
        Ok(cases)
    }

    // -----------------------------------------------------------------------
    // Retries
    // -----------------------------------------------------------------------

    async fn with_retries<T, F, Fut>(&self, call: &str, mut f: F) -> CollabResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CollabResult<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if e.transient && attempt < self.settings.max_retries => {
                    let delay = self
                        .settings
                        .retry_delay()
                        .saturating_mul(2u32.saturating_pow(attempt));
                    attempt += 1;
                    tracing::warn!(
                        call,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "collaborator call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

enum Committed {
    Applied(Conversation),
    Replayed(Conversation),
    Declined(Outcome),
}

/// Labels for a ready issue: the model's suggestions in order, blank and
/// repeated names dropped, the clarification label excluded, and the ready
/// label last.
fn ready_labels(suggested: &[String], labels: &LabelConfig) -> Vec<String> {
    let mut seen = HashSet::new();
    suggested
        .iter()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty() && *l != labels.needs_clarification)
        .chain(std::iter::once(labels.ready_for_dev.as_str()))
        .filter(|l| seen.insert(*l))
        .map(str::to_string)
        .collect()
}
