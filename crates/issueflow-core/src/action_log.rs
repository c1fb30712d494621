//! Append-only log of agent actions.
//!
//! Every decision or effect an agent produces lands here exactly once. The
//! logger also mirrors each entry as a `tracing` event so the process log and
//! the audit table tell the same story.

use std::fmt::Display;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::action::{ActionPayload, AgentAction};
use crate::error::Result;
use crate::store::Store;
use crate::types::{ActionStatus, AgentKind};

/// Wall-clock timer feeding `execution_time_ms`.
#[derive(Debug, Clone, Copy)]
pub struct Stopwatch(Instant);

impl Stopwatch {
    pub fn start() -> Self {
        Self(Instant::now())
    }

    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.0.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

#[derive(Clone)]
pub struct ActionLogger {
    store: Arc<dyn Store>,
    last_stamp: Arc<Mutex<DateTime<Utc>>>,
}

impl ActionLogger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            last_stamp: Arc::new(Mutex::new(DateTime::<Utc>::MIN_UTC)),
        }
    }

    /// Bump `at` past the previous stamp so actions logged through this
    /// logger sort by `(created_at, id)` in the order they were recorded.
    fn stamp(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let mut last = self
            .last_stamp
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let next = if at > *last {
            at
        } else {
            *last + Duration::microseconds(1)
        };
        *last = next;
        next
    }

    pub async fn record(&self, mut action: AgentAction) -> Result<AgentAction> {
        action.created_at = self.stamp(action.created_at);
        self.store.append_action(&action).await?;
        match action.status {
            ActionStatus::Success => tracing::info!(
                action = action.action_type(),
                agent = %action.agent,
                conversation = ?action.conversation_id,
                ms = action.execution_time_ms,
                "agent action"
            ),
            ActionStatus::Partial => tracing::info!(
                action = action.action_type(),
                agent = %action.agent,
                conversation = ?action.conversation_id,
                reason = action.error_message.as_deref().unwrap_or_default(),
                "agent action (partial)"
            ),
            ActionStatus::Failure => tracing::warn!(
                action = action.action_type(),
                agent = %action.agent,
                conversation = ?action.conversation_id,
                error = action.error_message.as_deref().unwrap_or_default(),
                "agent action failed"
            ),
        }
        Ok(action)
    }

    pub async fn success(
        &self,
        conversation_id: Option<Uuid>,
        agent: AgentKind,
        payload: ActionPayload,
        watch: &Stopwatch,
    ) -> Result<AgentAction> {
        self.record(AgentAction::success(
            conversation_id,
            agent,
            payload,
            watch.elapsed_ms(),
        ))
        .await
    }

    pub async fn failure(
        &self,
        conversation_id: Option<Uuid>,
        agent: AgentKind,
        payload: ActionPayload,
        error: impl Display,
        watch: &Stopwatch,
    ) -> Result<AgentAction> {
        self.record(AgentAction::failure(
            conversation_id,
            agent,
            payload,
            error.to_string(),
            watch.elapsed_ms(),
        ))
        .await
    }

    pub async fn partial(
        &self,
        conversation_id: Option<Uuid>,
        agent: AgentKind,
        payload: ActionPayload,
        reason: impl Display,
        watch: &Stopwatch,
    ) -> Result<AgentAction> {
        self.record(AgentAction::partial(
            conversation_id,
            agent,
            payload,
            reason.to_string(),
            watch.elapsed_ms(),
        ))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ActionQuery, SqliteStore};

    #[tokio::test]
    async fn logged_actions_are_readable_in_order() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let log = ActionLogger::new(store.clone());
        let watch = Stopwatch::start();

        log.success(
            None,
            AgentKind::Orchestrator,
            ActionPayload::DuplicateDelivery {
                delivery_id: "a".into(),
            },
            &watch,
        )
        .await
        .unwrap();
        log.failure(
            None,
            AgentKind::Orchestrator,
            ActionPayload::EventRejected {
                event_name: "issues".into(),
                delivery_id: "b".into(),
            },
            "missing field `repository`",
            &watch,
        )
        .await
        .unwrap();

        let actions = store.list_actions(ActionQuery::default()).await.unwrap();
        let types: Vec<_> = actions.iter().map(|a| a.action_type()).collect();
        assert_eq!(types, vec!["duplicate_delivery", "event_rejected"]);
        assert_eq!(
            actions[1].error_message.as_deref(),
            Some("missing field `repository`")
        );
    }

    #[tokio::test]
    async fn stamps_never_go_backwards() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let log = ActionLogger::new(store);
        let now = crate::now();

        let first = log.stamp(now);
        let same = log.stamp(now);
        let earlier = log.stamp(now - Duration::seconds(5));
        assert_eq!(first, now);
        assert!(same > first);
        assert!(earlier > same);
    }
}
