//! Conversation Store: the `conversations` and `sessions` tables.
//!
//! REDESIGN: the teacher persists via LanceDB/Arrow
//! (`memory::store::VectorStore`), a columnar vector store with no SQL
//! transactions, parameterized queries, or row indexes. That cannot
//! satisfy the requirement for parameterized queries, indexes, and
//! transactional schema migration, so this module is built on `rusqlite`
//! (bundled SQLite, WAL mode) instead — the crate two other repos in the
//! retrieval pack (`ProdByBuddha-rust_agency`, `lanegrid-agtrace`) use for
//! exactly this kind of embedded relational store. The connection is
//! shared behind a `parking_lot::Mutex` (already a teacher dependency),
//! matching the teacher's own `Arc<Mutex<TextEmbedding>>` pattern for a
//! single shared resource with short-lived critical sections.

use crate::error::{OrchestratorError, Result};
use crate::protocol::{ConversationRecord, NewConversation, SessionRecord, SessionSource};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;

const SCHEMA_VERSION: i64 = 1;

/// Shared handle to the conversation store. Cheap to clone (an `Arc`
/// around the pooled connection); the process holds one instance for its
/// lifetime per spec §5.
#[derive(Clone)]
pub struct ConversationStore {
    conn: Arc<Mutex<Connection>>,
}

impl ConversationStore {
    /// Open (creating if absent) the store at `path`, running schema
    /// migration transactionally.
    pub fn open(path: &std::path::Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self { conn: Arc::new(Mutex::new(conn)) };
        store.migrate()?;
        Ok(store)
    }

    /// In-memory store, for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn: Arc::new(Mutex::new(conn)) };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let current_version: i64 = tx
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            tx.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS sessions (
                    session_id   TEXT PRIMARY KEY,
                    source       TEXT NOT NULL,
                    created_at   INTEGER NOT NULL,
                    last_active  INTEGER NOT NULL,
                    metadata     TEXT NOT NULL DEFAULT '{}'
                );

                CREATE TABLE IF NOT EXISTS conversations (
                    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
                    timestamp          INTEGER NOT NULL,
                    agent              TEXT NOT NULL,
                    model              TEXT NOT NULL,
                    provider           TEXT NOT NULL,
                    prompt             TEXT NOT NULL,
                    response           TEXT NOT NULL,
                    prompt_tokens      INTEGER NOT NULL,
                    completion_tokens  INTEGER NOT NULL,
                    total_tokens       INTEGER NOT NULL,
                    duration_ms        REAL NOT NULL,
                    estimated_cost_usd REAL NOT NULL,
                    fallback_used      INTEGER NOT NULL,
                    session_id         TEXT REFERENCES sessions(session_id),
                    embedding          BLOB
                );

                CREATE INDEX IF NOT EXISTS idx_conversations_timestamp ON conversations(timestamp DESC);
                CREATE INDEX IF NOT EXISTS idx_conversations_agent ON conversations(agent);
                CREATE INDEX IF NOT EXISTS idx_conversations_session ON conversations(session_id);
                "#,
            )?;
            tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Insert a new conversation. Returns the new row id.
    pub fn insert_conversation(&self, rec: NewConversation) -> Result<i64> {
        let total_tokens = rec.prompt_tokens + rec.completion_tokens;
        let timestamp = chrono::Utc::now().timestamp();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO conversations
                (timestamp, agent, model, provider, prompt, response,
                 prompt_tokens, completion_tokens, total_tokens,
                 duration_ms, estimated_cost_usd, fallback_used, session_id, embedding)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                timestamp,
                rec.agent,
                rec.model,
                rec.provider,
                rec.prompt,
                rec.response,
                rec.prompt_tokens,
                rec.completion_tokens,
                total_tokens,
                rec.duration_ms,
                rec.estimated_cost_usd,
                rec.fallback_used,
                rec.session_id,
                rec.embedding,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Conversations for `session_id`, oldest first.
    pub fn get_recent_by_session(&self, session_id: &str, limit: usize) -> Result<Vec<ConversationRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM (
                SELECT * FROM conversations WHERE session_id = ?1 ORDER BY timestamp DESC, id DESC LIMIT ?2
             ) ORDER BY timestamp ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![session_id, limit as i64], row_to_record)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Up to `limit` most recent conversations for `agent`, excluding
    /// `exclude_session_id`, with their embedding blobs.
    pub fn query_candidates(&self, agent: &str, exclude_session_id: Option<&str>, limit: usize) -> Result<Vec<ConversationRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM conversations
             WHERE agent = ?1 AND (?2 IS NULL OR session_id IS NULL OR session_id != ?2)
             ORDER BY timestamp DESC, id DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![agent, exclude_session_id, limit as i64], row_to_record)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Up to `limit` most recent conversations from any agent other than
    /// `exclude_agent`, excluding `exclude_session_id`. Used when an
    /// agent's memory config sets `exclude_same_agent` (spec §9 Open
    /// Question: knowledge slice drawing on cross-agent history instead of
    /// only the calling agent's own past turns).
    pub fn query_candidates_excluding_agent(&self, exclude_agent: &str, exclude_session_id: Option<&str>, limit: usize) -> Result<Vec<ConversationRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM conversations
             WHERE agent != ?1 AND (?2 IS NULL OR session_id IS NULL OR session_id != ?2)
             ORDER BY timestamp DESC, id DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![exclude_agent, exclude_session_id, limit as i64], row_to_record)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Fetch a single conversation by id.
    pub fn get_by_id(&self, id: i64) -> Result<ConversationRecord> {
        let conn = self.conn.lock();
        conn.query_row("SELECT * FROM conversations WHERE id = ?1", params![id], row_to_record)
            .optional()?
            .ok_or_else(|| OrchestratorError::NotFound(format!("conversation {id}")))
    }

    /// Delete a conversation by id. Idempotent: deleting an absent id is
    /// not an error.
    pub fn delete(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Substring search over prompt/response text, excluding embeddings
    /// from the result (spec §6: `/memory/search` never returns
    /// embeddings).
    pub fn search(&self, query: &str, agent: Option<&str>, limit: usize) -> Result<Vec<ConversationRecord>> {
        let conn = self.conn.lock();
        let pattern = format!("%{}%", query.replace('%', "\\%").replace('_', "\\_"));
        let mut stmt = conn.prepare(
            "SELECT * FROM conversations
             WHERE (prompt LIKE ?1 ESCAPE '\\' OR response LIKE ?1 ESCAPE '\\')
               AND (?2 IS NULL OR agent = ?2)
             ORDER BY timestamp DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![pattern, agent, limit as i64], row_to_record)?;
        let mut results = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        for record in &mut results {
            record.embedding = None;
        }
        Ok(results)
    }

    /// Most recent conversations overall, optionally scoped to `agent`.
    /// Backs the CLI's `logs`/`last` commands and `/memory/recent`.
    pub fn recent(&self, limit: usize, agent: Option<&str>) -> Result<Vec<ConversationRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM conversations
             WHERE (?1 IS NULL OR agent = ?1)
             ORDER BY timestamp DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![agent, limit as i64], row_to_record)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Delete conversations whose session no longer exists (already
    /// pruned for inactivity).
    pub fn cleanup(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let affected = conn.execute(
            "DELETE FROM conversations
             WHERE session_id IS NOT NULL
               AND session_id NOT IN (SELECT session_id FROM sessions)",
            [],
        )?;
        Ok(affected as u64)
    }

    /// Backfill a lazily-computed embedding for an existing record.
    pub fn update_embedding(&self, id: i64, blob: &[u8]) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("UPDATE conversations SET embedding = ?1 WHERE id = ?2", params![blob, id])?;
        Ok(())
    }

    /// Upsert a session, bumping `last_active` to now.
    pub fn save_session(&self, rec: &SessionRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sessions (session_id, source, created_at, last_active, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(session_id) DO UPDATE SET last_active = excluded.last_active",
            params![rec.session_id, rec.source.to_string(), rec.created_at, rec.last_active, rec.metadata],
        )?;
        Ok(())
    }

    /// Fetch a session by id.
    pub fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let conn = self.conn.lock();
        conn.query_row("SELECT * FROM sessions WHERE session_id = ?1", params![session_id], row_to_session)
            .optional()
            .map_err(Into::into)
    }

    /// A CLI session whose `metadata.pid` matches `pid` and whose
    /// `last_active` falls within `within` of now.
    pub fn find_active_cli_session(&self, pid: u32, within: chrono::Duration) -> Result<Option<SessionRecord>> {
        let cutoff = chrono::Utc::now().timestamp() - within.num_seconds();
        let conn = self.conn.lock();
        let pid_pattern = format!("%\"pid\":{}%", pid);
        conn.query_row(
            "SELECT * FROM sessions
             WHERE source = 'cli' AND metadata LIKE ?1 AND last_active >= ?2
             ORDER BY last_active DESC LIMIT 1",
            params![pid_pattern, cutoff],
            row_to_session,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Delete sessions inactive since before `cutoff`, cascading to their
    /// conversations.
    pub fn prune_inactive_sessions(&self, cutoff: i64) -> Result<u64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM conversations WHERE session_id IN (SELECT session_id FROM sessions WHERE last_active < ?1)",
            params![cutoff],
        )?;
        let affected = tx.execute("DELETE FROM sessions WHERE last_active < ?1", params![cutoff])?;
        tx.commit()?;
        Ok(affected as u64)
    }

    /// Total conversation count, for `/memory/stats` and `/health`.
    pub fn count_conversations(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM conversations", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<ConversationRecord> {
    Ok(ConversationRecord {
        id: row.get("id")?,
        timestamp: row.get("timestamp")?,
        agent: row.get("agent")?,
        model: row.get("model")?,
        provider: row.get("provider")?,
        prompt: row.get("prompt")?,
        response: row.get("response")?,
        prompt_tokens: row.get("prompt_tokens")?,
        completion_tokens: row.get("completion_tokens")?,
        total_tokens: row.get("total_tokens")?,
        duration_ms: row.get("duration_ms")?,
        estimated_cost_usd: row.get("estimated_cost_usd")?,
        fallback_used: row.get("fallback_used")?,
        session_id: row.get("session_id")?,
        embedding: row.get("embedding")?,
    })
}

fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<SessionRecord> {
    let source: String = row.get("source")?;
    Ok(SessionRecord {
        session_id: row.get("session_id")?,
        source: match source.as_str() {
            "cli" => SessionSource::Cli,
            "ui" => SessionSource::Ui,
            _ => SessionSource::Api,
        },
        created_at: row.get("created_at")?,
        last_active: row.get("last_active")?,
        metadata: row.get("metadata")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(agent: &str, session_id: Option<&str>) -> NewConversation {
        NewConversation {
            agent: agent.to_string(),
            model: "openai/gpt-4o".to_string(),
            provider: "openai".to_string(),
            prompt: "hello".to_string(),
            response: "world".to_string(),
            prompt_tokens: 1,
            completion_tokens: 1,
            duration_ms: 10.0,
            estimated_cost_usd: 0.0001,
            fallback_used: false,
            session_id: session_id.map(str::to_string),
            embedding: None,
        }
    }

    #[test]
    fn insert_then_get_by_id_round_trips() {
        let store = ConversationStore::open_in_memory().unwrap();
        let id = store.insert_conversation(sample("builder", None)).unwrap();
        let record = store.get_by_id(id).unwrap();
        assert_eq!(record.agent, "builder");
        assert_eq!(record.total_tokens, 2);
    }

    #[test]
    fn get_by_id_missing_is_not_found() {
        let store = ConversationStore::open_in_memory().unwrap();
        let err = store.get_by_id(999).unwrap_err();
        assert_eq!(err.cli_exit_code(), 5);
    }

    #[test]
    fn delete_is_idempotent() {
        let store = ConversationStore::open_in_memory().unwrap();
        let id = store.insert_conversation(sample("builder", None)).unwrap();
        store.delete(id).unwrap();
        store.delete(id).unwrap();
    }

    #[test]
    fn recent_by_session_is_oldest_first() {
        let store = ConversationStore::open_in_memory().unwrap();
        store.insert_conversation(sample("builder", Some("s1"))).unwrap();
        store.insert_conversation(sample("builder", Some("s1"))).unwrap();
        let recs = store.get_recent_by_session("s1", 10).unwrap();
        assert_eq!(recs.len(), 2);
        assert!(recs[0].id < recs[1].id);
    }

    #[test]
    fn query_candidates_excludes_session() {
        let store = ConversationStore::open_in_memory().unwrap();
        store.insert_conversation(sample("critic", Some("s1"))).unwrap();
        store.insert_conversation(sample("critic", Some("s2"))).unwrap();
        let candidates = store.query_candidates("critic", Some("s1"), 10).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].session_id.as_deref(), Some("s2"));
    }

    #[test]
    fn query_candidates_excluding_agent_spans_other_agents_only() {
        let store = ConversationStore::open_in_memory().unwrap();
        store.insert_conversation(sample("builder", Some("s1"))).unwrap();
        store.insert_conversation(sample("critic", Some("s2"))).unwrap();
        let candidates = store.query_candidates_excluding_agent("builder", Some("s1"), 10).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].agent, "critic");
    }

    #[test]
    fn save_session_upserts_and_bumps_last_active() {
        let store = ConversationStore::open_in_memory().unwrap();
        let rec = SessionRecord {
            session_id: "cli-123".to_string(),
            source: SessionSource::Cli,
            created_at: 100,
            last_active: 100,
            metadata: "{\"pid\":123}".to_string(),
        };
        store.save_session(&rec).unwrap();
        let mut updated = rec.clone();
        updated.last_active = 200;
        store.save_session(&updated).unwrap();
        let fetched = store.get_session("cli-123").unwrap().unwrap();
        assert_eq!(fetched.last_active, 200);
        assert_eq!(fetched.created_at, 100);
    }

    #[test]
    fn find_active_cli_session_matches_pid_within_window() {
        let store = ConversationStore::open_in_memory().unwrap();
        let now = chrono::Utc::now().timestamp();
        store
            .save_session(&SessionRecord {
                session_id: "cli-abc".to_string(),
                source: SessionSource::Cli,
                created_at: now,
                last_active: now,
                metadata: "{\"pid\":42}".to_string(),
            })
            .unwrap();
        let found = store.find_active_cli_session(42, chrono::Duration::hours(2)).unwrap();
        assert!(found.is_some());
        let not_found = store.find_active_cli_session(99, chrono::Duration::hours(2)).unwrap();
        assert!(not_found.is_none());
    }

    #[test]
    fn recent_is_newest_first_and_filters_by_agent() {
        let store = ConversationStore::open_in_memory().unwrap();
        store.insert_conversation(sample("builder", None)).unwrap();
        store.insert_conversation(sample("critic", None)).unwrap();
        let all = store.recent(10, None).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].agent, "critic");
        let builder_only = store.recent(10, Some("builder")).unwrap();
        assert_eq!(builder_only.len(), 1);
        assert_eq!(builder_only[0].agent, "builder");
    }

    #[test]
    fn prune_inactive_sessions_cascades_to_conversations() {
        let store = ConversationStore::open_in_memory().unwrap();
        store
            .save_session(&SessionRecord {
                session_id: "stale".to_string(),
                source: SessionSource::Cli,
                created_at: 0,
                last_active: 0,
                metadata: "{}".to_string(),
            })
            .unwrap();
        store.insert_conversation(sample("builder", Some("stale"))).unwrap();
        let pruned = store.prune_inactive_sessions(1).unwrap();
        assert_eq!(pruned, 1);
        assert_eq!(store.count_conversations().unwrap(), 0);
    }
}
