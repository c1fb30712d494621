//! SQLite implementation of [`Store`].
//!
//! # Schema
//!
//! ```text
//! conversations        one row per (repo_full_name, issue_number)
//! conversation_turns   ordered by seq, unique on (conversation, role, event)
//! agent_actions        append-only, nullable conversation reference
//! code_generations     at most one in-flight row per conversation
//! status_transitions   unique on (conversation, to_status, event)
//! deliveries           webhook delivery claims
//! ```
//!
//! Every child table cascades from `conversations`. Status columns carry
//! CHECK constraints so the database refuses values outside the enums.
//!
//! rusqlite is synchronous; each call runs on `tokio::task::spawn_blocking`
//! and holds the connection mutex for the duration of one transaction.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use uuid::Uuid;

use super::{
    ActionQuery, DeliveryClaim, GenerationStart, Store, Transition, TransitionOutcome,
    TransitionRecord,
};
use crate::action::{ActionPayload, AgentAction};
use crate::conversation::{check_analysis, check_transition, Analysis, Conversation, Turn};
use crate::error::{FlowError, Result};
use crate::generation::{CodeGeneration, CodeReview, FileChange, TestFile};
use crate::types::{ConversationStatus, GenerationStatus};

const CURRENT_SCHEMA_VERSION: i64 = 1;

/// A `processing` claim older than this is considered abandoned.
const DEFAULT_CLAIM_TTL_SECS: i64 = 600;

const IN_FLIGHT_STATUSES: &str = "('generated', 'pr_created', 'ci_passed', 'ci_failed')";

// ---------------------------------------------------------------------------
// SqliteStore
// ---------------------------------------------------------------------------

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    claim_ttl: chrono::Duration,
}

impl SqliteStore {
    /// Open or create the database at `path`, running pending migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init(conn, false)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?, true)
    }

    pub fn with_claim_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.claim_ttl = ttl;
        self
    }

    fn init(conn: Connection, in_memory: bool) -> Result<Self> {
        let journal_mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        let journal_ok = journal_mode.eq_ignore_ascii_case("wal")
            || (in_memory && journal_mode.eq_ignore_ascii_case("memory"));
        if !journal_ok {
            return Err(FlowError::Storage(format!(
                "could not enable WAL mode, sqlite reported '{journal_mode}'"
            )));
        }

        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;

            CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );
            "#,
        )?;

        let current: i64 = conn
            .query_row("SELECT version FROM schema_version WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()?
            .unwrap_or(0);

        Self::run_migrations(&conn, current)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            claim_ttl: chrono::Duration::seconds(DEFAULT_CLAIM_TTL_SECS),
        })
    }

    fn run_migrations(conn: &Connection, from_version: i64) -> Result<()> {
        if from_version > CURRENT_SCHEMA_VERSION {
            return Err(FlowError::Storage(format!(
                "database schema version {from_version} is newer than supported version {CURRENT_SCHEMA_VERSION}"
            )));
        }
        if from_version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }

        tracing::info!(
            from = from_version,
            to = CURRENT_SCHEMA_VERSION,
            "migrating issueflow database"
        );

        if from_version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS conversations (
                    id TEXT PRIMARY KEY,
                    repo_full_name TEXT NOT NULL,
                    issue_number INTEGER NOT NULL,
                    issue_id INTEGER NOT NULL,
                    status TEXT NOT NULL CHECK (status IN (
                        'analyzing', 'needs_clarification', 'ready_for_dev',
                        'in_development', 'completed')),
                    analysis_json TEXT,
                    version INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    UNIQUE (repo_full_name, issue_number)
                );

                CREATE TABLE IF NOT EXISTS conversation_turns (
                    conversation_id TEXT NOT NULL
                        REFERENCES conversations(id) ON DELETE CASCADE,
                    seq INTEGER NOT NULL,
                    role TEXT NOT NULL CHECK (role IN ('user', 'agent')),
                    author TEXT,
                    text TEXT NOT NULL,
                    event_id TEXT,
                    created_at TEXT NOT NULL,
                    PRIMARY KEY (conversation_id, seq),
                    UNIQUE (conversation_id, role, event_id)
                );

                CREATE TABLE IF NOT EXISTS agent_actions (
                    id TEXT PRIMARY KEY,
                    conversation_id TEXT
                        REFERENCES conversations(id) ON DELETE CASCADE,
                    agent TEXT NOT NULL CHECK (agent IN (
                        'product_owner', 'developer', 'orchestrator')),
                    action_type TEXT NOT NULL,
                    payload_json TEXT NOT NULL,
                    status TEXT NOT NULL CHECK (status IN ('success', 'failure', 'partial')),
                    error_message TEXT,
                    execution_time_ms INTEGER NOT NULL,
                    created_at TEXT NOT NULL,
                    CHECK ((status = 'success') = (error_message IS NULL))
                );
                CREATE INDEX IF NOT EXISTS idx_actions_order
                    ON agent_actions(created_at, id);
                CREATE INDEX IF NOT EXISTS idx_actions_conversation
                    ON agent_actions(conversation_id, created_at);

                CREATE TABLE IF NOT EXISTS code_generations (
                    id TEXT PRIMARY KEY,
                    conversation_id TEXT NOT NULL
                        REFERENCES conversations(id) ON DELETE CASCADE,
                    pr_number INTEGER,
                    pr_url TEXT,
                    branch_name TEXT,
                    files_json TEXT NOT NULL,
                    tests_json TEXT NOT NULL,
                    status TEXT NOT NULL CHECK (status IN (
                        'generated', 'pr_created', 'ci_passed', 'ci_failed',
                        'merged', 'closed', 'failed')),
                    review_json TEXT,
                    error_message TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE UNIQUE INDEX IF NOT EXISTS idx_generation_in_flight
                    ON code_generations(conversation_id)
                    WHERE status IN ('generated', 'pr_created', 'ci_passed', 'ci_failed');
                CREATE INDEX IF NOT EXISTS idx_generation_pr
                    ON code_generations(pr_number) WHERE pr_number IS NOT NULL;

                CREATE TABLE IF NOT EXISTS status_transitions (
                    conversation_id TEXT NOT NULL
                        REFERENCES conversations(id) ON DELETE CASCADE,
                    from_status TEXT NOT NULL CHECK (from_status IN (
                        'analyzing', 'needs_clarification', 'ready_for_dev',
                        'in_development', 'completed')),
                    to_status TEXT NOT NULL CHECK (to_status IN (
                        'analyzing', 'needs_clarification', 'ready_for_dev',
                        'in_development', 'completed')),
                    event_id TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    UNIQUE (conversation_id, to_status, event_id)
                );

                CREATE TABLE IF NOT EXISTS deliveries (
                    delivery_id TEXT PRIMARY KEY,
                    state TEXT NOT NULL CHECK (state IN ('processing', 'completed')),
                    claimed_at TEXT NOT NULL,
                    completed_at TEXT
                );
                "#,
            )?;
        }

        conn.execute(
            "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?1)",
            params![CURRENT_SCHEMA_VERSION],
        )?;
        Ok(())
    }

    /// Run `f` against the connection on the blocking pool.
    async fn call<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| FlowError::Storage("connection mutex poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| FlowError::Storage(format!("blocking task failed: {e}")))?
    }
}

// ---------------------------------------------------------------------------
// Encoding helpers
// ---------------------------------------------------------------------------

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| FlowError::SchemaDrift(format!("bad timestamp '{s}': {e}")))
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| FlowError::SchemaDrift(format!("bad id '{s}': {e}")))
}

fn drift(what: &str, e: serde_json::Error) -> FlowError {
    FlowError::SchemaDrift(format!("{what}: {e}"))
}

/// SQLite integers are signed; values past `i64::MAX` cannot be stored.
fn to_sql_int(value: u64, what: &str) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| FlowError::Storage(format!("{what} {value} does not fit an INTEGER column")))
}

fn from_sql_int(value: i64, what: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| FlowError::SchemaDrift(format!("{what} is negative: {value}")))
}

// ---------------------------------------------------------------------------
// Conversations
// ---------------------------------------------------------------------------

const CONVERSATION_COLUMNS: &str = "id, repo_full_name, issue_number, issue_id, status, \
     analysis_json, version, created_at, updated_at";

struct ConversationRow {
    id: String,
    repo_full_name: String,
    issue_number: i64,
    issue_id: i64,
    status: String,
    analysis_json: Option<String>,
    version: i64,
    created_at: String,
    updated_at: String,
}

fn conversation_row(row: &Row<'_>) -> rusqlite::Result<ConversationRow> {
    Ok(ConversationRow {
        id: row.get(0)?,
        repo_full_name: row.get(1)?,
        issue_number: row.get(2)?,
        issue_id: row.get(3)?,
        status: row.get(4)?,
        analysis_json: row.get(5)?,
        version: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn read_turns(conn: &Connection, conversation_id: &str) -> Result<Vec<Turn>> {
    let mut stmt = conn.prepare(
        "SELECT role, author, text, event_id, created_at FROM conversation_turns
         WHERE conversation_id = ?1 ORDER BY seq",
    )?;
    let raw = stmt
        .query_map(params![conversation_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    raw.into_iter()
        .map(|(role, author, text, event_id, created_at)| {
            Ok(Turn {
                role: role.parse()?,
                author,
                text,
                event_id,
                created_at: parse_ts(&created_at)?,
            })
        })
        .collect()
}

fn hydrate_conversation(conn: &Connection, raw: ConversationRow) -> Result<Conversation> {
    let analysis: Option<Analysis> = raw
        .analysis_json
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|e| drift("conversation analysis", e))?;
    let conversation = Conversation {
        id: parse_uuid(&raw.id)?,
        turns: read_turns(conn, &raw.id)?,
        repo_full_name: raw.repo_full_name,
        issue_number: from_sql_int(raw.issue_number, "issue number")?,
        issue_id: from_sql_int(raw.issue_id, "issue id")?,
        status: raw.status.parse()?,
        analysis,
        version: from_sql_int(raw.version, "conversation version")?,
        created_at: parse_ts(&raw.created_at)?,
        updated_at: parse_ts(&raw.updated_at)?,
    };
    conversation.validate()?;
    Ok(conversation)
}

fn read_conversation(conn: &Connection, id: &str) -> Result<Option<Conversation>> {
    let raw = conn
        .query_row(
            &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
            params![id],
            conversation_row,
        )
        .optional()?;
    raw.map(|r| hydrate_conversation(conn, r)).transpose()
}

fn read_conversation_by_issue(
    conn: &Connection,
    repo_full_name: &str,
    issue_number: u64,
) -> Result<Option<Conversation>> {
    let raw = conn
        .query_row(
            &format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations
                 WHERE repo_full_name = ?1 AND issue_number = ?2"
            ),
            params![repo_full_name, to_sql_int(issue_number, "issue number")?],
            conversation_row,
        )
        .optional()?;
    raw.map(|r| hydrate_conversation(conn, r)).transpose()
}

fn require_conversation(conn: &Connection, id: &str) -> Result<Conversation> {
    read_conversation(conn, id)?.ok_or_else(|| FlowError::ConversationNotFound(id.to_string()))
}

fn insert_transition_record(
    conn: &Connection,
    conversation_id: &str,
    from: ConversationStatus,
    to: ConversationStatus,
    event_id: &str,
    at: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO status_transitions (conversation_id, from_status, to_status, event_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![conversation_id, from.as_str(), to.as_str(), event_id, fmt_ts(at)],
    )?;
    Ok(())
}

fn apply_transition(conn: &mut Connection, t: Transition) -> Result<TransitionOutcome> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let id = t.conversation_id.to_string();
    let current = require_conversation(&tx, &id)?;

    let replayed: bool = tx.query_row(
        "SELECT EXISTS(SELECT 1 FROM status_transitions
         WHERE conversation_id = ?1 AND to_status = ?2 AND event_id = ?3)",
        params![id, t.to.as_str(), t.event_id],
        |row| row.get(0),
    )?;
    if replayed {
        return Ok(TransitionOutcome::Replayed(current));
    }

    if current.version != t.expected_version {
        return Err(FlowError::ConcurrencyConflict {
            conversation_id: t.conversation_id,
            expected_version: t.expected_version,
        });
    }

    check_transition(current.status, t.to)?;
    let analysis = t.analysis.or(current.analysis);
    check_analysis(t.to, analysis.as_ref())?;
    let analysis_json = analysis.as_ref().map(serde_json::to_string).transpose()?;

    let now = crate::now();
    tx.execute(
        "UPDATE conversations
         SET status = ?1, analysis_json = ?2, version = version + 1, updated_at = ?3
         WHERE id = ?4",
        params![t.to.as_str(), analysis_json, fmt_ts(now), id],
    )?;
    insert_transition_record(&tx, &id, current.status, t.to, &t.event_id, now)?;

    let updated = require_conversation(&tx, &id)?;
    tx.commit()?;
    Ok(TransitionOutcome::Applied(updated))
}

fn insert_turn(conn: &mut Connection, conversation_id: Uuid, turn: Turn) -> Result<Conversation> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let id = conversation_id.to_string();
    require_conversation(&tx, &id)?;

    let next_seq: i64 = tx.query_row(
        "SELECT COALESCE(MAX(seq), 0) + 1 FROM conversation_turns WHERE conversation_id = ?1",
        params![id],
        |row| row.get(0),
    )?;
    let inserted = tx.execute(
        "INSERT INTO conversation_turns
             (conversation_id, seq, role, author, text, event_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT (conversation_id, role, event_id) DO NOTHING",
        params![
            id,
            next_seq,
            turn.role.as_str(),
            turn.author,
            turn.text,
            turn.event_id,
            fmt_ts(turn.created_at)
        ],
    )?;
    if inserted > 0 {
        tx.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
            params![fmt_ts(crate::now()), id],
        )?;
    }

    let updated = require_conversation(&tx, &id)?;
    tx.commit()?;
    Ok(updated)
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

struct ActionRow {
    id: String,
    conversation_id: Option<String>,
    agent: String,
    action_type: String,
    payload_json: String,
    status: String,
    error_message: Option<String>,
    execution_time_ms: i64,
    created_at: String,
}

fn hydrate_action(raw: ActionRow) -> Result<AgentAction> {
    let payload: ActionPayload =
        serde_json::from_str(&raw.payload_json).map_err(|e| drift("action payload", e))?;
    if payload.action_type() != raw.action_type {
        return Err(FlowError::SchemaDrift(format!(
            "action {} is stored as {} but carries a {} payload",
            raw.id,
            raw.action_type,
            payload.action_type()
        )));
    }
    Ok(AgentAction {
        id: parse_uuid(&raw.id)?,
        conversation_id: raw.conversation_id.as_deref().map(parse_uuid).transpose()?,
        agent: raw.agent.parse()?,
        payload,
        status: raw.status.parse()?,
        error_message: raw.error_message,
        execution_time_ms: from_sql_int(raw.execution_time_ms, "execution time")?,
        created_at: parse_ts(&raw.created_at)?,
    })
}

// ---------------------------------------------------------------------------
// Generations
// ---------------------------------------------------------------------------

const GENERATION_COLUMNS: &str = "g.id, g.conversation_id, g.pr_number, g.pr_url, g.branch_name, \
     g.files_json, g.tests_json, g.status, g.review_json, g.error_message, g.created_at, g.updated_at";

struct GenerationRow {
    id: String,
    conversation_id: String,
    pr_number: Option<i64>,
    pr_url: Option<String>,
    branch_name: Option<String>,
    files_json: String,
    tests_json: String,
    status: String,
    review_json: Option<String>,
    error_message: Option<String>,
    created_at: String,
    updated_at: String,
}

fn generation_row(row: &Row<'_>) -> rusqlite::Result<GenerationRow> {
    Ok(GenerationRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        pr_number: row.get(2)?,
        pr_url: row.get(3)?,
        branch_name: row.get(4)?,
        files_json: row.get(5)?,
        tests_json: row.get(6)?,
        status: row.get(7)?,
        review_json: row.get(8)?,
        error_message: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn hydrate_generation(raw: GenerationRow) -> Result<CodeGeneration> {
    let files_changed: Vec<FileChange> =
        serde_json::from_str(&raw.files_json).map_err(|e| drift("generation files", e))?;
    let tests_generated: Vec<TestFile> =
        serde_json::from_str(&raw.tests_json).map_err(|e| drift("generation tests", e))?;
    let review: Option<CodeReview> = raw
        .review_json
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|e| drift("generation review", e))?;
    Ok(CodeGeneration {
        id: parse_uuid(&raw.id)?,
        conversation_id: parse_uuid(&raw.conversation_id)?,
        pr_number: raw
            .pr_number
            .map(|n| from_sql_int(n, "pull request number"))
            .transpose()?,
        pr_url: raw.pr_url,
        branch_name: raw.branch_name,
        files_changed,
        tests_generated,
        status: raw.status.parse()?,
        review,
        error_message: raw.error_message,
        created_at: parse_ts(&raw.created_at)?,
        updated_at: parse_ts(&raw.updated_at)?,
    })
}

fn insert_generation(conn: &Connection, g: &CodeGeneration) -> Result<()> {
    conn.execute(
        "INSERT INTO code_generations
             (id, conversation_id, pr_number, pr_url, branch_name, files_json, tests_json,
              status, review_json, error_message, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            g.id.to_string(),
            g.conversation_id.to_string(),
            g.pr_number
                .map(|n| to_sql_int(n, "pull request number"))
                .transpose()?,
            g.pr_url,
            g.branch_name,
            serde_json::to_string(&g.files_changed)?,
            serde_json::to_string(&g.tests_generated)?,
            g.status.as_str(),
            g.review.as_ref().map(serde_json::to_string).transpose()?,
            g.error_message,
            fmt_ts(g.created_at),
            fmt_ts(g.updated_at),
        ],
    )?;
    Ok(())
}

fn start_generation(
    conn: &mut Connection,
    start: GenerationStart,
) -> Result<(Conversation, CodeGeneration)> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let conversation_id = start.generation.conversation_id;
    let id = conversation_id.to_string();
    let current = require_conversation(&tx, &id)?;

    if !matches!(
        current.status,
        ConversationStatus::ReadyForDev | ConversationStatus::InDevelopment
    ) {
        return Err(FlowError::InvalidTransition {
            from: current.status.to_string(),
            to: ConversationStatus::InDevelopment.to_string(),
            reason: "code generation needs a conversation that is ready for development"
                .to_string(),
        });
    }

    if current.version != start.expected_version {
        return Err(FlowError::ConcurrencyConflict {
            conversation_id,
            expected_version: start.expected_version,
        });
    }

    let in_flight: Option<String> = tx
        .query_row(
            &format!(
                "SELECT id FROM code_generations
                 WHERE conversation_id = ?1 AND status IN {IN_FLIGHT_STATUSES} LIMIT 1"
            ),
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(generation_id) = in_flight {
        return Err(FlowError::GenerationInFlight {
            conversation_id,
            generation_id: parse_uuid(&generation_id)?,
        });
    }

    if current.status == ConversationStatus::ReadyForDev {
        let now = crate::now();
        tx.execute(
            "UPDATE conversations
             SET status = ?1, version = version + 1, updated_at = ?2
             WHERE id = ?3",
            params![ConversationStatus::InDevelopment.as_str(), fmt_ts(now), id],
        )?;
        insert_transition_record(
            &tx,
            &id,
            ConversationStatus::ReadyForDev,
            ConversationStatus::InDevelopment,
            &start.event_id,
            now,
        )?;
    }

    insert_generation(&tx, &start.generation)?;
    let updated = require_conversation(&tx, &id)?;
    tx.commit()?;
    Ok((updated, start.generation))
}

fn write_generation(conn: &mut Connection, g: CodeGeneration) -> Result<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let id = g.id.to_string();
    let stored: String = tx
        .query_row(
            "SELECT status FROM code_generations WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| FlowError::GenerationNotFound(id.clone()))?;
    let stored: GenerationStatus = stored.parse()?;
    if stored != g.status && !stored.can_transition_to(g.status) {
        return Err(FlowError::InvalidTransition {
            from: stored.to_string(),
            to: g.status.to_string(),
            reason: format!("code generation {id} cannot leave {stored}"),
        });
    }

    tx.execute(
        "UPDATE code_generations
         SET pr_number = ?1, pr_url = ?2, branch_name = ?3, status = ?4,
             review_json = ?5, error_message = ?6, updated_at = ?7
         WHERE id = ?8",
        params![
            g.pr_number
                .map(|n| to_sql_int(n, "pull request number"))
                .transpose()?,
            g.pr_url,
            g.branch_name,
            g.status.as_str(),
            g.review.as_ref().map(serde_json::to_string).transpose()?,
            g.error_message,
            fmt_ts(g.updated_at),
            id,
        ],
    )?;
    tx.commit()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Store impl
// ---------------------------------------------------------------------------

#[async_trait]
impl Store for SqliteStore {
    async fn get_or_create_conversation(
        &self,
        repo_full_name: &str,
        issue_number: u64,
        issue_id: u64,
    ) -> Result<(Conversation, bool)> {
        let repo = repo_full_name.to_string();
        self.call(move |conn| {
            let fresh = Conversation::new(repo.clone(), issue_number, issue_id);
            let created = conn.execute(
                "INSERT INTO conversations
                     (id, repo_full_name, issue_number, issue_id, status, analysis_json,
                      version, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, NULL, 0, ?6, ?6)
                 ON CONFLICT (repo_full_name, issue_number) DO NOTHING",
                params![
                    fresh.id.to_string(),
                    repo,
                    to_sql_int(issue_number, "issue number")?,
                    to_sql_int(issue_id, "issue id")?,
                    fresh.status.as_str(),
                    fmt_ts(fresh.created_at),
                ],
            )? > 0;
            let conversation = read_conversation_by_issue(conn, &repo, issue_number)?
                .ok_or_else(|| FlowError::ConversationNotFound(format!("{repo}#{issue_number}")))?;
            if created {
                tracing::debug!(repo = %repo, issue = issue_number, id = %conversation.id, "conversation created");
            }
            Ok((conversation, created))
        })
        .await
    }

    async fn find_conversation(
        &self,
        repo_full_name: &str,
        issue_number: u64,
    ) -> Result<Option<Conversation>> {
        let repo = repo_full_name.to_string();
        self.call(move |conn| read_conversation_by_issue(conn, &repo, issue_number))
            .await
    }

    async fn load_conversation(&self, id: Uuid) -> Result<Conversation> {
        self.call(move |conn| require_conversation(conn, &id.to_string()))
            .await
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        self.call(|conn| {
            let raws = {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {CONVERSATION_COLUMNS} FROM conversations
                     ORDER BY updated_at DESC, id"
                ))?;
                let rows = stmt
                    .query_map([], conversation_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            };
            raws.into_iter()
                .map(|raw| hydrate_conversation(conn, raw))
                .collect()
        })
        .await
    }

    async fn delete_conversation(&self, id: Uuid) -> Result<()> {
        self.call(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM conversations WHERE id = ?1",
                params![id.to_string()],
            )?;
            if deleted == 0 {
                return Err(FlowError::ConversationNotFound(id.to_string()));
            }
            Ok(())
        })
        .await
    }

    async fn transition(&self, transition: Transition) -> Result<TransitionOutcome> {
        self.call(move |conn| apply_transition(conn, transition))
            .await
    }

    async fn append_turn(&self, conversation_id: Uuid, turn: Turn) -> Result<Conversation> {
        self.call(move |conn| insert_turn(conn, conversation_id, turn))
            .await
    }

    async fn list_transitions(&self, conversation_id: Uuid) -> Result<Vec<TransitionRecord>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT from_status, to_status, event_id, created_at FROM status_transitions
                 WHERE conversation_id = ?1 ORDER BY rowid",
            )?;
            let raw = stmt
                .query_map(params![conversation_id.to_string()], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            raw.into_iter()
                .map(|(from, to, event_id, created_at)| {
                    Ok(TransitionRecord {
                        conversation_id,
                        from: from.parse()?,
                        to: to.parse()?,
                        event_id,
                        created_at: parse_ts(&created_at)?,
                    })
                })
                .collect()
        })
        .await
    }

    async fn append_action(&self, action: &AgentAction) -> Result<()> {
        let action = action.clone();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO agent_actions
                     (id, conversation_id, agent, action_type, payload_json, status,
                      error_message, execution_time_ms, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    action.id.to_string(),
                    action.conversation_id.map(|id| id.to_string()),
                    action.agent.as_str(),
                    action.action_type(),
                    serde_json::to_string(&action.payload)?,
                    action.status.as_str(),
                    action.error_message,
                    to_sql_int(action.execution_time_ms, "execution time")?,
                    fmt_ts(action.created_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_actions(&self, query: ActionQuery) -> Result<Vec<AgentAction>> {
        self.call(move |conn| {
            let limit = match query.limit {
                Some(l) => i64::try_from(l)
                    .map_err(|_| FlowError::Storage(format!("limit {l} is too large")))?,
                None => -1,
            };
            let mut stmt = conn.prepare(
                "SELECT id, conversation_id, agent, action_type, payload_json, status,
                        error_message, execution_time_ms, created_at
                 FROM (
                     SELECT * FROM agent_actions
                     WHERE (?1 IS NULL OR conversation_id = ?1)
                       AND (?2 IS NULL OR action_type = ?2)
                     ORDER BY created_at DESC, id DESC
                     LIMIT ?3
                 )
                 ORDER BY created_at ASC, id ASC",
            )?;
            let raws = stmt
                .query_map(
                    params![
                        query.conversation_id.map(|id| id.to_string()),
                        query.action_type,
                        limit
                    ],
                    |row| {
                        Ok(ActionRow {
                            id: row.get(0)?,
                            conversation_id: row.get(1)?,
                            agent: row.get(2)?,
                            action_type: row.get(3)?,
                            payload_json: row.get(4)?,
                            status: row.get(5)?,
                            error_message: row.get(6)?,
                            execution_time_ms: row.get(7)?,
                            created_at: row.get(8)?,
                        })
                    },
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            raws.into_iter().map(hydrate_action).collect()
        })
        .await
    }

    async fn begin_generation(
        &self,
        start: GenerationStart,
    ) -> Result<(Conversation, CodeGeneration)> {
        self.call(move |conn| start_generation(conn, start)).await
    }

    async fn update_generation(&self, generation: &CodeGeneration) -> Result<()> {
        let generation = generation.clone();
        self.call(move |conn| write_generation(conn, generation))
            .await
    }

    async fn load_generation(&self, id: Uuid) -> Result<CodeGeneration> {
        self.call(move |conn| {
            let raw = conn
                .query_row(
                    &format!("SELECT {GENERATION_COLUMNS} FROM code_generations g WHERE g.id = ?1"),
                    params![id.to_string()],
                    generation_row,
                )
                .optional()?
                .ok_or_else(|| FlowError::GenerationNotFound(id.to_string()))?;
            hydrate_generation(raw)
        })
        .await
    }

    async fn list_generations(&self, conversation_id: Uuid) -> Result<Vec<CodeGeneration>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {GENERATION_COLUMNS} FROM code_generations g
                 WHERE g.conversation_id = ?1 ORDER BY g.created_at, g.rowid"
            ))?;
            let raws = stmt
                .query_map(params![conversation_id.to_string()], generation_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            raws.into_iter().map(hydrate_generation).collect()
        })
        .await
    }

    async fn find_generation_by_pr(
        &self,
        repo_full_name: &str,
        pr_number: u64,
    ) -> Result<Option<CodeGeneration>> {
        let repo = repo_full_name.to_string();
        self.call(move |conn| {
            let raw = conn
                .query_row(
                    &format!(
                        "SELECT {GENERATION_COLUMNS} FROM code_generations g
                         JOIN conversations c ON c.id = g.conversation_id
                         WHERE c.repo_full_name = ?1 AND g.pr_number = ?2
                         ORDER BY g.created_at DESC, g.rowid DESC LIMIT 1"
                    ),
                    params![repo, to_sql_int(pr_number, "pull request number")?],
                    generation_row,
                )
                .optional()?;
            raw.map(hydrate_generation).transpose()
        })
        .await
    }

    async fn claim_delivery(&self, delivery_id: &str) -> Result<DeliveryClaim> {
        let delivery_id = delivery_id.to_string();
        let ttl = self.claim_ttl;
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = crate::now();
            let existing: Option<(String, String)> = tx
                .query_row(
                    "SELECT state, claimed_at FROM deliveries WHERE delivery_id = ?1",
                    params![delivery_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let claim = match existing {
                None => {
                    tx.execute(
                        "INSERT INTO deliveries (delivery_id, state, claimed_at)
                         VALUES (?1, 'processing', ?2)",
                        params![delivery_id, fmt_ts(now)],
                    )?;
                    DeliveryClaim::Claimed
                }
                Some((state, _)) if state == "completed" => DeliveryClaim::Completed,
                Some((_, claimed_at)) => {
                    if now - parse_ts(&claimed_at)? >= ttl {
                        tracing::warn!(delivery = %delivery_id, "taking over stale delivery claim");
                        tx.execute(
                            "UPDATE deliveries SET claimed_at = ?1 WHERE delivery_id = ?2",
                            params![fmt_ts(now), delivery_id],
                        )?;
                        DeliveryClaim::Claimed
                    } else {
                        DeliveryClaim::InProgress
                    }
                }
            };
            tx.commit()?;
            Ok(claim)
        })
        .await
    }

    async fn complete_delivery(&self, delivery_id: &str) -> Result<()> {
        let delivery_id = delivery_id.to_string();
        self.call(move |conn| {
            let now = fmt_ts(crate::now());
            conn.execute(
                "INSERT INTO deliveries (delivery_id, state, claimed_at, completed_at)
                 VALUES (?1, 'completed', ?2, ?2)
                 ON CONFLICT (delivery_id) DO UPDATE
                 SET state = 'completed', completed_at = excluded.completed_at",
                params![delivery_id, now],
            )?;
            Ok(())
        })
        .await
    }

    async fn release_delivery(&self, delivery_id: &str) -> Result<()> {
        let delivery_id = delivery_id.to_string();
        self.call(move |conn| {
            conn.execute(
                "DELETE FROM deliveries WHERE delivery_id = ?1 AND state = 'processing'",
                params![delivery_id],
            )?;
            Ok(())
        })
        .await
    }

    async fn ping(&self) -> Result<()> {
        self.call(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Complexity;
    use crate::types::{ActionStatus, AgentKind, TurnRole};
    use tempfile::TempDir;

    fn refined() -> Analysis {
        Analysis::Refined {
            refined_description: "Charge cards through Stripe".into(),
            acceptance_criteria: vec!["Checkout succeeds with a test card".into()],
            suggested_labels: vec![],
            complexity: Some(Complexity::Medium),
        }
    }

    fn clarifying() -> Analysis {
        Analysis::Clarifying {
            questions: vec!["Which provider?".into()],
            complexity: None,
        }
    }

    fn to(c: &Conversation, status: ConversationStatus, analysis: Option<Analysis>, event: &str) -> Transition {
        Transition {
            conversation_id: c.id,
            expected_version: c.version,
            to: status,
            analysis,
            event_id: event.into(),
        }
    }

    async fn ready_conversation(store: &SqliteStore) -> Conversation {
        let (c, _) = store.get_or_create_conversation("org/shop", 42, 9001).await.unwrap();
        store
            .transition(to(&c, ConversationStatus::ReadyForDev, Some(refined()), "d1"))
            .await
            .unwrap()
            .into_conversation()
    }

    #[tokio::test]
    async fn get_or_create_returns_existing_row() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (a, created_a) = store.get_or_create_conversation("org/shop", 42, 9001).await.unwrap();
        let (b, created_b) = store.get_or_create_conversation("org/shop", 42, 9001).await.unwrap();
        assert!(created_a);
        assert!(!created_b);
        assert_eq!(a.id, b.id);
        assert_eq!(store.list_conversations().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn numbers_beyond_sqlite_range_are_rejected_not_wrapped() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store
            .get_or_create_conversation("org/shop", u64::MAX, 9001)
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Storage(ref m) if m.contains("issue number")));
        assert!(store.list_conversations().await.unwrap().is_empty());
        let err = store.find_generation_by_pr("org/shop", u64::MAX).await.unwrap_err();
        assert!(matches!(err, FlowError::Storage(_)));
    }

    #[tokio::test]
    async fn concurrent_creates_yield_one_conversation() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.get_or_create_conversation("org/shop", 7, 70).await.unwrap()
            }));
        }
        let mut ids = Vec::new();
        let mut created = 0;
        for h in handles {
            let (c, was_created) = h.await.unwrap();
            ids.push(c.id);
            created += was_created as usize;
        }
        ids.dedup();
        assert_eq!(created, 1);
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    async fn transition_bumps_version_and_records_event() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (c, _) = store.get_or_create_conversation("org/shop", 42, 9001).await.unwrap();
        let outcome = store
            .transition(to(&c, ConversationStatus::NeedsClarification, Some(clarifying()), "d1"))
            .await
            .unwrap();
        assert!(!outcome.is_replay());
        let c = outcome.into_conversation();
        assert_eq!(c.status, ConversationStatus::NeedsClarification);
        assert_eq!(c.version, 1);

        let records = store.list_transitions(c.id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].from, ConversationStatus::Analyzing);
        assert_eq!(records[0].event_id, "d1");
    }

    #[tokio::test]
    async fn replayed_transition_changes_nothing() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (c, _) = store.get_or_create_conversation("org/shop", 42, 9001).await.unwrap();
        let first = to(&c, ConversationStatus::ReadyForDev, Some(refined()), "d1");
        store.transition(first.clone()).await.unwrap();

        // Same logical event, decided against the old version.
        let again = store.transition(first).await.unwrap();
        assert!(again.is_replay());
        assert_eq!(again.conversation().version, 1);
        assert_eq!(store.list_transitions(c.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stale_version_is_a_conflict() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (c, _) = store.get_or_create_conversation("org/shop", 42, 9001).await.unwrap();
        store
            .transition(to(&c, ConversationStatus::NeedsClarification, Some(clarifying()), "d1"))
            .await
            .unwrap();
        let err = store
            .transition(to(&c, ConversationStatus::ReadyForDev, Some(refined()), "d2"))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::ConcurrencyConflict { expected_version: 0, .. }));
        let reloaded = store.load_conversation(c.id).await.unwrap();
        assert_eq!(reloaded.status, ConversationStatus::NeedsClarification);
    }

    #[tokio::test]
    async fn invalid_transition_does_not_mutate() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (c, _) = store.get_or_create_conversation("org/shop", 42, 9001).await.unwrap();
        let err = store
            .transition(to(&c, ConversationStatus::Completed, Some(refined()), "d1"))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::InvalidTransition { .. }));
        let reloaded = store.load_conversation(c.id).await.unwrap();
        assert_eq!(reloaded.status, ConversationStatus::Analyzing);
        assert_eq!(reloaded.version, 0);
        assert!(store.list_transitions(c.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn analysis_must_match_target_status() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (c, _) = store.get_or_create_conversation("org/shop", 42, 9001).await.unwrap();
        let err = store
            .transition(to(&c, ConversationStatus::ReadyForDev, Some(clarifying()), "d1"))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::SchemaDrift(_)));
    }

    #[tokio::test]
    async fn turns_roundtrip_in_order_and_skip_duplicates() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (c, _) = store.get_or_create_conversation("org/shop", 42, 9001).await.unwrap();
        store
            .append_turn(c.id, Turn::user(Some("alice".into()), "Add payment processing", "d1"))
            .await
            .unwrap();
        store.append_turn(c.id, Turn::agent("Which provider?", "d1")).await.unwrap();
        store
            .append_turn(c.id, Turn::user(Some("alice".into()), "Add payment processing", "d1"))
            .await
            .unwrap();
        let c2 = store
            .append_turn(c.id, Turn::user(Some("alice".into()), "Stripe", "d2"))
            .await
            .unwrap();

        let texts: Vec<_> = c2.turns.iter().map(|t| (t.role, t.text.as_str())).collect();
        assert_eq!(
            texts,
            vec![
                (TurnRole::User, "Add payment processing"),
                (TurnRole::Agent, "Which provider?"),
                (TurnRole::User, "Stripe"),
            ]
        );
        assert_eq!(c2.version, 0);
        assert!(c2.updated_at >= c.updated_at);

        let reloaded = store.find_conversation("org/shop", 42).await.unwrap().unwrap();
        assert_eq!(reloaded, c2);
    }

    #[tokio::test]
    async fn append_turn_to_missing_conversation_fails() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store
            .append_turn(Uuid::new_v4(), Turn::user(None, "hi", "d1"))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::ConversationNotFound(_)));
    }

    #[tokio::test]
    async fn actions_follow_timestamps_not_insertion_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        let rejected = |delivery: &str| {
            AgentAction::failure(
                None,
                AgentKind::Orchestrator,
                ActionPayload::EventRejected {
                    event_name: "issues".into(),
                    delivery_id: delivery.into(),
                },
                "missing repository",
                0,
            )
        };
        let late = rejected("late");
        let mut early = rejected("early");
        early.created_at = late.created_at - chrono::Duration::seconds(10);
        store.append_action(&late).await.unwrap();
        store.append_action(&early).await.unwrap();

        let all = store.list_actions(ActionQuery::default()).await.unwrap();
        let ids: Vec<Uuid> = all.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![early.id, late.id]);

        let newest = store
            .list_actions(ActionQuery {
                limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(newest[0].id, late.id);
    }

    #[tokio::test]
    async fn actions_are_ordered_and_limited_to_most_recent() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (c, _) = store.get_or_create_conversation("org/shop", 42, 9001).await.unwrap();
        for i in 0..5 {
            let action = AgentAction::success(
                Some(c.id),
                AgentKind::ProductOwner,
                ActionPayload::QuestionsAsked {
                    issue_number: 42,
                    questions: vec![format!("q{i}")],
                },
                i,
            );
            store.append_action(&action).await.unwrap();
        }
        store
            .append_action(&AgentAction::failure(
                None,
                AgentKind::Orchestrator,
                ActionPayload::EventRejected {
                    event_name: "issues".into(),
                    delivery_id: "bad".into(),
                },
                "missing repository",
                0,
            ))
            .await
            .unwrap();

        let all = store.list_actions(ActionQuery::default()).await.unwrap();
        assert_eq!(all.len(), 6);
        assert!(all.windows(2).all(|w| (w[0].created_at, w[0].id) <= (w[1].created_at, w[1].id)));

        let recent = store
            .list_actions(ActionQuery {
                conversation_id: Some(c.id),
                limit: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(recent.len(), 2);
        assert!(recent.iter().all(|a| a.conversation_id == Some(c.id)));

        let rejected = store
            .list_actions(ActionQuery {
                action_type: Some("event_rejected".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].status, ActionStatus::Failure);
        assert!(rejected[0].conversation_id.is_none());
    }

    #[tokio::test]
    async fn begin_generation_moves_to_development_once() {
        let store = SqliteStore::open_in_memory().unwrap();
        let c = ready_conversation(&store).await;

        let (c, g) = store
            .begin_generation(GenerationStart {
                expected_version: c.version,
                event_id: "d2".into(),
                generation: CodeGeneration::new(c.id, vec![], vec![], None),
            })
            .await
            .unwrap();
        assert_eq!(c.status, ConversationStatus::InDevelopment);
        assert_eq!(g.status, GenerationStatus::Generated);

        let err = store
            .begin_generation(GenerationStart {
                expected_version: c.version,
                event_id: "d3".into(),
                generation: CodeGeneration::new(c.id, vec![], vec![], None),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::GenerationInFlight { generation_id, .. } if generation_id == g.id));
        assert_eq!(store.list_generations(c.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_generation_allows_retry_without_second_transition() {
        let store = SqliteStore::open_in_memory().unwrap();
        let c = ready_conversation(&store).await;
        let (c, mut g) = store
            .begin_generation(GenerationStart {
                expected_version: c.version,
                event_id: "d2".into(),
                generation: CodeGeneration::new(c.id, vec![], vec![], None),
            })
            .await
            .unwrap();
        g.mark_failed("issue-42".into(), "push rejected").unwrap();
        store.update_generation(&g).await.unwrap();

        let (c2, retry) = store
            .begin_generation(GenerationStart {
                expected_version: c.version,
                event_id: "d3".into(),
                generation: CodeGeneration::new(c.id, vec![], vec![], None),
            })
            .await
            .unwrap();
        assert_eq!(c2.status, ConversationStatus::InDevelopment);
        assert_eq!(c2.version, c.version);
        assert_ne!(retry.id, g.id);
        assert_eq!(store.list_transitions(c.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn generation_requires_ready_conversation() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (c, _) = store.get_or_create_conversation("org/shop", 42, 9001).await.unwrap();
        let err = store
            .begin_generation(GenerationStart {
                expected_version: 0,
                event_id: "d1".into(),
                generation: CodeGeneration::new(c.id, vec![], vec![], None),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn update_generation_rejects_backwards_moves_and_finds_by_pr() {
        let store = SqliteStore::open_in_memory().unwrap();
        let c = ready_conversation(&store).await;
        let (_, mut g) = store
            .begin_generation(GenerationStart {
                expected_version: c.version,
                event_id: "d2".into(),
                generation: CodeGeneration::new(c.id, vec![], vec![], None),
            })
            .await
            .unwrap();
        g.mark_pr_created(7, "https://github.com/org/shop/pull/7".into(), "issue-42".into())
            .unwrap();
        store.update_generation(&g).await.unwrap();

        let found = store.find_generation_by_pr("org/shop", 7).await.unwrap().unwrap();
        assert_eq!(found.id, g.id);
        assert_eq!(found.pr_url.as_deref(), Some("https://github.com/org/shop/pull/7"));
        assert!(store.find_generation_by_pr("org/other", 7).await.unwrap().is_none());

        let mut stale = found.clone();
        stale.status = GenerationStatus::Generated;
        assert!(matches!(
            store.update_generation(&stale).await.unwrap_err(),
            FlowError::InvalidTransition { .. }
        ));
    }

    #[tokio::test]
    async fn delivery_claims_follow_lifecycle() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(store.claim_delivery("abc").await.unwrap(), DeliveryClaim::Claimed);
        assert_eq!(store.claim_delivery("abc").await.unwrap(), DeliveryClaim::InProgress);
        store.release_delivery("abc").await.unwrap();
        assert_eq!(store.claim_delivery("abc").await.unwrap(), DeliveryClaim::Claimed);
        store.complete_delivery("abc").await.unwrap();
        assert_eq!(store.claim_delivery("abc").await.unwrap(), DeliveryClaim::Completed);
        // Completed deliveries survive a release.
        store.release_delivery("abc").await.unwrap();
        assert_eq!(store.claim_delivery("abc").await.unwrap(), DeliveryClaim::Completed);
    }

    #[tokio::test]
    async fn stale_claims_are_taken_over() {
        let store = SqliteStore::open_in_memory()
            .unwrap()
            .with_claim_ttl(chrono::Duration::zero());
        assert_eq!(store.claim_delivery("abc").await.unwrap(), DeliveryClaim::Claimed);
        assert_eq!(store.claim_delivery("abc").await.unwrap(), DeliveryClaim::Claimed);
    }

    #[tokio::test]
    async fn delete_cascades_to_children() {
        let store = SqliteStore::open_in_memory().unwrap();
        let c = ready_conversation(&store).await;
        store.append_turn(c.id, Turn::user(None, "hi", "d1")).await.unwrap();
        store
            .append_action(&AgentAction::success(
                Some(c.id),
                AgentKind::ProductOwner,
                ActionPayload::QuestionsAsked {
                    issue_number: 42,
                    questions: vec![],
                },
                1,
            ))
            .await
            .unwrap();
        store.delete_conversation(c.id).await.unwrap();

        assert!(store.find_conversation("org/shop", 42).await.unwrap().is_none());
        assert!(store.list_transitions(c.id).await.unwrap().is_empty());
        let actions = store
            .list_actions(ActionQuery {
                conversation_id: Some(c.id),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(actions.is_empty());
        assert!(matches!(
            store.delete_conversation(c.id).await.unwrap_err(),
            FlowError::ConversationNotFound(_)
        ));
    }

    #[tokio::test]
    async fn status_columns_reject_unknown_values() {
        let store = SqliteStore::open_in_memory().unwrap();
        let result = store
            .call(|conn| {
                conn.execute(
                    "INSERT INTO conversations
                         (id, repo_full_name, issue_number, issue_id, status, version, created_at, updated_at)
                     VALUES ('x', 'org/shop', 1, 1, 'shipped', 0, 'now', 'now')",
                    [],
                )?;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(FlowError::Sqlite(_))));
    }

    #[tokio::test]
    async fn file_database_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/issueflow.db");
        let id = {
            let store = SqliteStore::open(&path).unwrap();
            ready_conversation(&store).await.id
        };
        let store = SqliteStore::open(&path).unwrap();
        let c = store.load_conversation(id).await.unwrap();
        assert_eq!(c.status, ConversationStatus::ReadyForDev);
        assert_eq!(c.analysis, Some(refined()));
        store.ping().await.unwrap();
    }
}
