//! End-to-end issue workflows driven through signed webhook deliveries.

use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use issueflow_core::collab::{
    CodeRequest, CollabError, CollabResult, Collaborator, GeneratedCode, LanguageModel,
    RefineRequest, Refinement,
};
use issueflow_core::config::AgentSettings;
use issueflow_core::ingress::sign;
use issueflow_core::orchestrator::{Orchestrator, Outcome};
use issueflow_core::store::{ActionQuery, SqliteStore, Store};
use issueflow_core::testing::{clarify, ready, FakeLlm, FakeTracker};
use issueflow_core::types::{ActionStatus, ConversationStatus, GenerationStatus, TurnRole};
use issueflow_core::FlowError;
use serde_json::{json, Value};
use tempfile::TempDir;

const SECRET: &str = "webhook-secret";
const REPO: &str = "org/shop";

struct World {
    orch: Arc<Orchestrator>,
    store: Arc<SqliteStore>,
    llm: Arc<FakeLlm>,
    tracker: Arc<FakeTracker>,
}

fn world_with(store: SqliteStore) -> World {
    let store = Arc::new(store);
    let llm = Arc::new(FakeLlm::new());
    let tracker = Arc::new(FakeTracker::new());
    let settings = AgentSettings {
        retry_delay_ms: 1,
        ..AgentSettings::default()
    };
    let orch = Arc::new(Orchestrator::new(
        store.clone(),
        llm.clone(),
        tracker.clone(),
        settings,
    ));
    World {
        orch,
        store,
        llm,
        tracker,
    }
}

fn world() -> World {
    world_with(SqliteStore::open_in_memory().unwrap())
}

async fn deliver(w: &World, event: &str, delivery: &str, payload: Value) -> Outcome {
    let body = serde_json::to_vec(&payload).unwrap();
    let sig = sign(&body, SECRET).unwrap();
    w.orch
        .handle_delivery(event, Some(delivery), &body, Some(&sig), SECRET)
        .await
        .unwrap()
}

fn issue_opened(number: u64) -> Value {
    json!({
        "action": "opened",
        "repository": { "full_name": REPO },
        "issue": {
            "number": number,
            "id": 9000 + number,
            "title": "Add payment processing",
            "body": null,
            "user": { "login": "alice", "type": "User" }
        }
    })
}

fn comment(number: u64, body: &str) -> Value {
    json!({
        "action": "created",
        "repository": { "full_name": REPO },
        "issue": { "number": number, "id": 9000 + number, "title": "Add payment processing" },
        "comment": { "id": 77, "body": body, "user": { "login": "alice", "type": "User" } }
    })
}

fn pr_closed(number: u64, merged: bool, issue: u64) -> Value {
    json!({
        "action": "closed",
        "repository": { "full_name": REPO },
        "pull_request": { "number": number, "merged": merged, "body": format!("Closes #{issue}") }
    })
}

async fn status_of(w: &World, issue: u64) -> ConversationStatus {
    w.store
        .find_conversation(REPO, issue)
        .await
        .unwrap()
        .unwrap()
        .status
}

async fn assert_walk_on_graph(w: &World) {
    for c in w.store.list_conversations().await.unwrap() {
        let transitions = w.store.list_transitions(c.id).await.unwrap();
        let mut current = ConversationStatus::Analyzing;
        for t in &transitions {
            assert_eq!(t.from, current, "transition log has a gap");
            assert!(t.from.can_transition_to(t.to), "{} -> {}", t.from, t.to);
            current = t.to;
        }
        assert_eq!(current, c.status);
    }
}

#[tokio::test]
async fn issue_runs_from_question_to_merged_pull_request() {
    let w = world();

    // Opened: four questions come back.
    w.llm.push_refinement(clarify(&[
        "Which payment provider?",
        "Which currencies?",
        "Are refunds needed?",
        "Is there a spending limit?",
    ]));
    let outcome = deliver(&w, "issues", "d-open", issue_opened(42)).await;
    assert!(matches!(outcome, Outcome::QuestionsAsked { questions: 4, .. }));
    assert_eq!(status_of(&w, 42).await, ConversationStatus::NeedsClarification);
    assert!(w.tracker.comments()[0].contains("4. Is there a spending limit?"));
    assert_eq!(w.tracker.labels_added(), vec!["needs-clarification"]);

    // Answered: requirements become ready and the labels swap.
    w.llm.push_refinement(ready("Charge cards through Stripe in USD"));
    let outcome = deliver(
        &w,
        "issue_comment",
        "d-answer",
        comment(42, "Stripe, USD only, refunds yes, no limit"),
    )
    .await;
    assert!(matches!(outcome, Outcome::MarkedReady { .. }));
    assert_eq!(status_of(&w, 42).await, ConversationStatus::ReadyForDev);
    assert_eq!(w.tracker.labels_removed(), vec!["needs-clarification"]);
    assert!(w
        .tracker
        .labels_added()
        .contains(&"ready-for-dev".to_string()));

    // Generation opens a pull request and development starts.
    let c = w.store.find_conversation(REPO, 42).await.unwrap().unwrap();
    let g = w.orch.generate(c.id, "manual-1").await.unwrap();
    assert_eq!(g.status, GenerationStatus::PrCreated);
    assert_eq!(g.pr_number, Some(100));
    assert_eq!(status_of(&w, 42).await, ConversationStatus::InDevelopment);
    let prs = w.tracker.pull_requests();
    assert_eq!(prs.len(), 1);
    assert!(prs[0].body.ends_with("Closes #42"));
    assert_eq!(prs[0].base, "main");

    // Merged: the generation and the conversation both finish.
    let outcome = deliver(&w, "pull_request", "d-merge", pr_closed(100, true, 42)).await;
    assert_eq!(outcome, Outcome::Completed { conversation_id: c.id });
    let g = w.store.load_generation(g.id).await.unwrap();
    assert_eq!(g.status, GenerationStatus::Merged);
    assert_eq!(status_of(&w, 42).await, ConversationStatus::Completed);

    let types: Vec<&str> = w
        .store
        .list_actions(ActionQuery {
            conversation_id: Some(c.id),
            ..Default::default()
        })
        .await
        .unwrap()
        .iter()
        .map(|a| a.action_type())
        .collect();
    assert_eq!(
        types,
        vec![
            "issue_analyzed",
            "questions_asked",
            "issue_analyzed",
            "marked_ready_for_dev",
            "code_generated",
            "pr_created",
            "pr_status_updated",
            "conversation_completed",
        ]
    );
    assert_walk_on_graph(&w).await;
}

#[tokio::test]
async fn ready_label_triggers_generation() {
    let w = world();
    w.llm.push_refinement(ready("Charge cards through Stripe"));
    deliver(&w, "issues", "d-open", issue_opened(7)).await;

    let labeled = json!({
        "action": "labeled",
        "repository": { "full_name": REPO },
        "label": { "name": "ready-for-dev" },
        "issue": { "number": 7, "id": 9007, "title": "Add payment processing" }
    });
    let outcome = deliver(&w, "issues", "d-label", labeled.clone()).await;
    assert!(matches!(
        outcome,
        Outcome::Generated {
            status: GenerationStatus::PrCreated,
            pr_number: Some(100),
            ..
        }
    ));

    // The same label seen again while the pull request is open is skipped.
    let outcome = deliver(&w, "issues", "d-label-2", labeled).await;
    assert!(matches!(outcome, Outcome::Conflict { .. }));
    assert_eq!(w.tracker.pull_requests().len(), 1);
}

#[tokio::test]
async fn closed_pull_request_allows_a_fresh_attempt() {
    let w = world();
    w.llm.push_refinement(ready("Charge cards through Stripe"));
    deliver(&w, "issues", "d-open", issue_opened(5)).await;
    let c = w.store.find_conversation(REPO, 5).await.unwrap().unwrap();
    w.orch.generate(c.id, "g-1").await.unwrap();

    let outcome = deliver(&w, "pull_request", "d-close", pr_closed(100, false, 5)).await;
    assert!(matches!(
        outcome,
        Outcome::GenerationUpdated {
            status: GenerationStatus::Closed,
            ..
        }
    ));
    assert_eq!(status_of(&w, 5).await, ConversationStatus::InDevelopment);

    let retry = w.orch.generate(c.id, "g-2").await.unwrap();
    assert_eq!(retry.pr_number, Some(101));
}

#[tokio::test]
async fn ci_results_advance_the_generation() {
    let w = world();
    w.llm.push_refinement(ready("Charge cards through Stripe"));
    deliver(&w, "issues", "d-open", issue_opened(8)).await;
    let c = w.store.find_conversation(REPO, 8).await.unwrap().unwrap();
    let g = w.orch.generate(c.id, "g-1").await.unwrap();

    let suite = |conclusion: &str| {
        json!({
            "action": "completed",
            "repository": { "full_name": REPO },
            "check_suite": { "conclusion": conclusion, "pull_requests": [{ "number": 100 }] }
        })
    };
    let outcome = deliver(&w, "check_suite", "d-ci-1", suite("failure")).await;
    assert_eq!(
        outcome,
        Outcome::GenerationUpdated {
            generation_id: g.id,
            status: GenerationStatus::CiFailed
        }
    );
    deliver(&w, "check_suite", "d-ci-2", suite("success")).await;
    let g = w.store.load_generation(g.id).await.unwrap();
    assert_eq!(g.status, GenerationStatus::CiPassed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_openings_share_one_conversation() {
    let w = world();
    // The delivery that loses the version race re-analyzes.
    for _ in 0..4 {
        w.llm.push_refinement(clarify(&["Which provider?"]));
    }

    let first = {
        let orch = w.orch.clone();
        let body = serde_json::to_vec(&issue_opened(42)).unwrap();
        tokio::spawn(async move {
            let sig = sign(&body, SECRET).unwrap();
            orch.handle_delivery("issues", Some("d-a"), &body, Some(&sig), SECRET)
                .await
                .unwrap()
        })
    };
    let second = {
        let orch = w.orch.clone();
        let body = serde_json::to_vec(&issue_opened(42)).unwrap();
        tokio::spawn(async move {
            let sig = sign(&body, SECRET).unwrap();
            orch.handle_delivery("issues", Some("d-b"), &body, Some(&sig), SECRET)
                .await
                .unwrap()
        })
    };
    let outcomes = [first.await.unwrap(), second.await.unwrap()];

    let conversations = w.store.list_conversations().await.unwrap();
    assert_eq!(conversations.len(), 1);
    let id = conversations[0].id;
    for outcome in &outcomes {
        match outcome {
            Outcome::QuestionsAsked {
                conversation_id, ..
            }
            | Outcome::Conflict {
                conversation_id, ..
            } => assert_eq!(*conversation_id, id),
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!(status_of(&w, 42).await, ConversationStatus::NeedsClarification);
    assert_walk_on_graph(&w).await;
}

#[tokio::test]
async fn replayed_delivery_adds_only_a_duplicate_action() {
    let w = world();
    w.llm.push_refinement(ready("Charge cards through Stripe"));
    deliver(&w, "issues", "d-open", issue_opened(42)).await;
    let c = w.store.find_conversation(REPO, 42).await.unwrap().unwrap();
    w.orch.generate(c.id, "g-1").await.unwrap();

    let before = w.store.list_actions(ActionQuery::default()).await.unwrap();
    let outcome = deliver(&w, "issues", "d-open", issue_opened(42)).await;
    assert_eq!(
        outcome,
        Outcome::Duplicate {
            delivery_id: "d-open".into()
        }
    );

    let after = w.store.list_actions(ActionQuery::default()).await.unwrap();
    assert_eq!(after.len(), before.len() + 1);
    let last = after.last().unwrap();
    assert_eq!(last.action_type(), "duplicate_delivery");
    assert_eq!(last.status, ActionStatus::Partial);

    assert_eq!(w.store.list_conversations().await.unwrap().len(), 1);
    let in_flight = w
        .store
        .list_generations(c.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|g| g.status.is_in_flight())
        .count();
    assert_eq!(in_flight, 1);
    assert_eq!(w.llm.refine_calls(), 1);
}

#[tokio::test]
async fn failed_actions_never_move_the_conversation() {
    let w = world();
    w.llm
        .push_refine_error(CollabError::permanent(Collaborator::Llm, "model offline"));
    let outcome = deliver(&w, "issues", "d-open", issue_opened(42)).await;
    assert!(matches!(outcome, Outcome::Failed { retryable: true, .. }));
    assert_eq!(status_of(&w, 42).await, ConversationStatus::Analyzing);
    assert!(w.tracker.comments()[0].contains("temporarily unavailable"));

    // Generation from an unready conversation is refused and logged.
    let c = w.store.find_conversation(REPO, 42).await.unwrap().unwrap();
    let err = w.orch.generate(c.id, "g-1").await.unwrap_err();
    assert!(matches!(err, FlowError::InvalidTransition { .. }));

    let failures: Vec<_> = w
        .store
        .list_actions(ActionQuery::default())
        .await
        .unwrap()
        .into_iter()
        .filter(|a| a.status == ActionStatus::Failure)
        .collect();
    assert_eq!(failures.len(), 2);
    assert!(w.store.list_transitions(c.id).await.unwrap().is_empty());
    assert_eq!(status_of(&w, 42).await, ConversationStatus::Analyzing);
}

#[tokio::test]
async fn malformed_and_unsigned_deliveries() {
    let w = world();
    let body = br#"{"action": "opened"}"#;
    let sig = sign(body, SECRET).unwrap();
    let outcome = w
        .orch
        .handle_delivery("issues", Some("d-bad"), body, Some(&sig), SECRET)
        .await
        .unwrap();
    assert!(matches!(outcome, Outcome::Rejected { .. }));
    let rejected = w.store.list_actions(ActionQuery::default()).await.unwrap();
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].conversation_id, None);
    assert_eq!(rejected[0].status, ActionStatus::Failure);

    let err = w
        .orch
        .handle_delivery("issues", Some("d-forged"), body, Some("sha256=00"), SECRET)
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::Authentication(_)));
    assert_eq!(w.store.list_actions(ActionQuery::default()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn conversation_survives_reopening_the_database() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("issueflow.db");

    let before = {
        let w = world_with(SqliteStore::open(&path).unwrap());
        w.llm.push_refinement(clarify(&["Which provider?", "Which currencies?"]));
        deliver(&w, "issues", "d-open", issue_opened(42)).await;
        w.llm.push_refinement(ready("Charge cards through Stripe"));
        deliver(&w, "issue_comment", "d-answer", comment(42, "Stripe, USD")).await;
        w.store.find_conversation(REPO, 42).await.unwrap().unwrap()
    };

    let reopened = SqliteStore::open(&path).unwrap();
    let after = reopened.find_conversation(REPO, 42).await.unwrap().unwrap();
    assert_eq!(after.status, before.status);
    assert_eq!(after.analysis, before.analysis);
    assert_eq!(after.turns, before.turns);
    assert_eq!(after.turns.len(), 4);
}

/// Runs a second delivery to completion while the first refine call is in
/// flight, so the outer decision is computed from a stale conversation.
struct InterleavingLlm {
    inner: FakeLlm,
    orch: OnceLock<Arc<Orchestrator>>,
    pending: Mutex<Option<(String, Vec<u8>)>>,
    seen: Mutex<Vec<Vec<String>>>,
}

#[async_trait]
impl LanguageModel for InterleavingLlm {
    async fn refine(&self, req: RefineRequest<'_>) -> CollabResult<Refinement> {
        let user_texts = req
            .turns
            .iter()
            .filter(|t| t.role == TurnRole::User)
            .map(|t| t.text.clone())
            .collect();
        self.seen.lock().unwrap().push(user_texts);

        let pending = self.pending.lock().unwrap().take();
        if let Some((delivery, body)) = pending {
            let orch = self.orch.get().unwrap().clone();
            let sig = sign(&body, SECRET).unwrap();
            orch.handle_delivery("issue_comment", Some(&delivery), &body, Some(&sig), SECRET)
                .await
                .unwrap();
        }
        self.inner.refine(req).await
    }

    async fn generate_code(&self, req: CodeRequest<'_>) -> CollabResult<GeneratedCode> {
        self.inner.generate_code(req).await
    }
}

#[tokio::test]
async fn comment_losing_the_race_is_reanalyzed_with_every_turn() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let llm = Arc::new(InterleavingLlm {
        inner: FakeLlm::new(),
        orch: OnceLock::new(),
        pending: Mutex::new(None),
        seen: Mutex::new(Vec::new()),
    });
    let settings = AgentSettings {
        retry_delay_ms: 1,
        ..AgentSettings::default()
    };
    let orch = Arc::new(Orchestrator::new(
        store.clone(),
        llm.clone(),
        Arc::new(FakeTracker::new()),
        settings,
    ));
    assert!(llm.orch.set(orch.clone()).is_ok());

    llm.inner
        .push_refinement(clarify(&["Which provider?"]))
        .push_refinement(clarify(&["Are refunds needed?"]))
        .push_refinement(ready("Charge cards through Stripe"))
        .push_refinement(ready("Charge cards through Stripe in USD with refunds"));

    let body = serde_json::to_vec(&issue_opened(42)).unwrap();
    let sig = sign(&body, SECRET).unwrap();
    orch.handle_delivery("issues", Some("d-open"), &body, Some(&sig), SECRET)
        .await
        .unwrap();

    // Comment A lands while comment B is being refined.
    let a = serde_json::to_vec(&comment(42, "USD only")).unwrap();
    *llm.pending.lock().unwrap() = Some(("d-a".to_string(), a));
    let b = serde_json::to_vec(&comment(42, "Stripe, with refunds")).unwrap();
    let sig = sign(&b, SECRET).unwrap();
    let outcome = orch
        .handle_delivery("issue_comment", Some("d-b"), &b, Some(&sig), SECRET)
        .await
        .unwrap();

    let c = store.find_conversation(REPO, 42).await.unwrap().unwrap();
    assert_eq!(outcome, Outcome::MarkedReady { conversation_id: c.id });
    assert_eq!(c.status, ConversationStatus::ReadyForDev);
    assert_eq!(c.version, 3);
    assert_eq!(llm.inner.refine_calls(), 4);

    let seen = llm.seen.lock().unwrap().clone();
    let stale = &seen[1];
    assert!(stale.iter().any(|t| t.contains("with refunds")));
    assert!(!stale.iter().any(|t| t.contains("USD only")));
    let fresh = seen.last().unwrap();
    assert!(fresh.iter().any(|t| t.contains("with refunds")));
    assert!(fresh.iter().any(|t| t.contains("USD only")));

    let conflicts = store
        .list_actions(ActionQuery {
            conversation_id: Some(c.id),
            action_type: Some("concurrency_conflict".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(conflicts.len(), 1);
    assert!(orch.reconcile().await.unwrap().is_empty());
}

#[tokio::test]
async fn events_after_completion_are_logged_and_ignored() {
    let w = world();
    w.llm.push_refinement(ready("Charge cards through Stripe"));
    deliver(&w, "issues", "d-open", issue_opened(42)).await;
    let c = w.store.find_conversation(REPO, 42).await.unwrap().unwrap();
    w.orch.generate(c.id, "g-1").await.unwrap();
    let outcome = deliver(&w, "pull_request", "d-merge", pr_closed(100, true, 42)).await;
    assert_eq!(outcome, Outcome::Completed { conversation_id: c.id });

    let before = w.store.load_conversation(c.id).await.unwrap();
    assert_eq!(before.status, ConversationStatus::Completed);

    let outcome = deliver(&w, "issue_comment", "d-late", comment(42, "Also support PayPal?")).await;
    assert!(matches!(outcome, Outcome::Ignored { .. }));
    assert_eq!(w.llm.refine_calls(), 1);

    let after = w.store.load_conversation(c.id).await.unwrap();
    assert_eq!(after.status, ConversationStatus::Completed);
    assert_eq!(after.version, before.version);
    assert_eq!(after.turns.len(), before.turns.len());

    let ignored = w
        .store
        .list_actions(ActionQuery {
            conversation_id: Some(c.id),
            action_type: Some("event_ignored".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(ignored.len(), 1);
    assert_eq!(ignored[0].status, ActionStatus::Partial);
    assert!(ignored[0]
        .error_message
        .as_deref()
        .unwrap()
        .contains("completed"));
    assert_walk_on_graph(&w).await;
}
