//! Database operations for agentlog.

use crate::analytics;
use crate::error::{Error, Result};
use crate::fts;
use crate::queue;
use crate::models::*;
use crate::parts::{self, Part};
use crate::schema::SCHEMA;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Bounded internal retries for busy-database write conflicts.
const WRITE_RETRIES: u64 = 3;

/// Database handle for agentlog. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

/// Mutable session metadata carried by ingest payloads.
#[derive(Debug, Clone)]
pub struct SessionMeta {
    pub external_id: String,
    pub source: SessionSource,
    pub project_path: Option<String>,
    pub git_branch: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// A message to append; the store assigns id and ordinal.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub role: MessageRole,
    pub created_at: DateTime<Utc>,
    pub model: Option<String>,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub cost_usd: f64,
    pub needs_audit: bool,
    /// Post-redaction parts.
    pub parts: Vec<Part>,
}

impl Database {
    /// Open or create a database at the given path.
    pub async fn open(path: &Path) -> Result<Self> {
        let parent = path.parent().unwrap_or(Path::new("."));
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.init().await?;
        Ok(db)
    }

    /// Initialize schema.
    async fn init(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the database.
    pub async fn close(self) {
        self.pool.close().await;
    }

    // =========================================================================
    // Accounts & API keys
    // =========================================================================

    /// Create an account for an external identity subject.
    pub async fn create_account(&self, external_subject: &str) -> Result<Account> {
        let account = Account {
            id: Uuid::new_v4(),
            external_subject: external_subject.to_string(),
            created_at: Utc::now(),
        };
        sqlx::query("INSERT INTO accounts (id, external_subject, created_at) VALUES (?, ?, ?)")
            .bind(account.id.to_string())
            .bind(&account.external_subject)
            .bind(account.created_at.timestamp())
            .execute(&self.pool)
            .await?;
        Ok(account)
    }

    /// Look up an account by its external identity subject.
    pub async fn get_account_by_subject(&self, subject: &str) -> Result<Option<Account>> {
        let row = sqlx::query("SELECT * FROM accounts WHERE external_subject = ?")
            .bind(subject)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| account_from_row(&row)))
    }

    /// Mint a new API key for an account.
    ///
    /// Returns the key record and the plaintext token. The plaintext is
    /// never stored and cannot be recovered later.
    pub async fn create_api_key(&self, account_id: Uuid) -> Result<(ApiKey, String)> {
        let token = format!(
            "alk_{}{}",
            Uuid::new_v4().simple(),
            Uuid::new_v4().simple()
        );
        let key = ApiKey {
            id: Uuid::new_v4(),
            account_id,
            key_hash: hash_token(&token),
            created_at: Utc::now(),
            revoked_at: None,
        };
        sqlx::query(
            "INSERT INTO api_keys (id, account_id, key_hash, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(key.id.to_string())
        .bind(key.account_id.to_string())
        .bind(&key.key_hash)
        .bind(key.created_at.timestamp())
        .execute(&self.pool)
        .await?;

        tracing::info!(key_id = %key.id, account_id = %account_id, "issued API key");
        Ok((key, token))
    }

    /// Revoke an API key. Revoked keys fail authentication.
    pub async fn revoke_api_key(&self, key_id: Uuid) -> Result<()> {
        let result = sqlx::query(
            "UPDATE api_keys SET revoked_at = ? WHERE id = ? AND revoked_at IS NULL",
        )
        .bind(Utc::now().timestamp())
        .bind(key_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("api key '{key_id}'")));
        }
        Ok(())
    }

    /// Resolve a bearer token to its account via the stored lookup hash.
    pub async fn resolve_api_key(&self, token: &str) -> Result<Option<Account>> {
        let row = sqlx::query(
            r#"
            SELECT a.id, a.external_subject, a.created_at
            FROM api_keys k
            JOIN accounts a ON a.id = k.account_id
            WHERE k.key_hash = ? AND k.revoked_at IS NULL
            "#,
        )
        .bind(hash_token(token))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| account_from_row(&row)))
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Upsert a session by (account_id, external_id).
    ///
    /// Re-sending the same external id updates mutable metadata (end time,
    /// project, branch) and never creates a duplicate. Returns the session
    /// id, existing or new.
    pub async fn upsert_session(&self, account_id: Uuid, meta: &SessionMeta) -> Result<Uuid> {
        self.retry_busy(|| self.upsert_session_once(account_id, meta))
            .await
    }

    async fn upsert_session_once(&self, account_id: Uuid, meta: &SessionMeta) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO sessions (id, account_id, external_id, source, project_path, git_branch, started_at, ended_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(account_id, external_id) DO UPDATE SET
                source = excluded.source,
                project_path = excluded.project_path,
                git_branch = excluded.git_branch,
                ended_at = excluded.ended_at
            "#,
        )
        .bind(id.to_string())
        .bind(account_id.to_string())
        .bind(&meta.external_id)
        .bind(meta.source.to_string())
        .bind(&meta.project_path)
        .bind(&meta.git_branch)
        .bind(meta.started_at.timestamp())
        .bind(meta.ended_at.map(|dt| dt.timestamp()))
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT id FROM sessions WHERE account_id = ? AND external_id = ?")
            .bind(account_id.to_string())
            .bind(&meta.external_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(Uuid::parse_str(row.get::<&str, _>("id")).unwrap_or_default())
    }

    /// Append a message to a session.
    ///
    /// One transaction covers the ordinal assignment, the message and part
    /// inserts, the full-text index rows, the rollup bump, and the session
    /// aggregate update, so no error path leaves rollups and messages out
    /// of sync.
    pub async fn append_message(&self, session_id: Uuid, msg: &NewMessage) -> Result<Uuid> {
        self.retry_busy(|| self.append_message_once(session_id, msg, false))
            .await
    }

    /// Append a message and enqueue its embedding job atomically.
    ///
    /// Same transaction as [`Self::append_message`]; a commit means the
    /// job row exists, so a crash can never drop indexing work for a
    /// stored message.
    pub async fn append_message_with_embed_job(
        &self,
        session_id: Uuid,
        msg: &NewMessage,
    ) -> Result<Uuid> {
        self.retry_busy(|| self.append_message_once(session_id, msg, true))
            .await
    }

    async fn append_message_once(
        &self,
        session_id: Uuid,
        msg: &NewMessage,
        enqueue_job: bool,
    ) -> Result<Uuid> {
        let mut tx = self.pool.begin().await?;

        let session_row = sqlx::query(
            "SELECT account_id, project_path FROM sessions WHERE id = ?",
        )
        .bind(session_id.to_string())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| Error::NotFound(format!("session '{session_id}'")))?;
        let account_id =
            Uuid::parse_str(session_row.get::<&str, _>("account_id")).unwrap_or_default();
        let project_path: Option<String> = session_row.get("project_path");

        // Next ordinal under the per-session write serialization.
        let ordinal: i64 = sqlx::query(
            "SELECT COALESCE(MAX(ordinal) + 1, 0) AS next FROM messages WHERE session_id = ?",
        )
        .bind(session_id.to_string())
        .fetch_one(&mut *tx)
        .await?
        .get("next");

        let message_id = Uuid::new_v4();
        // `project` captures the rollup bucket key at append time; the
        // session's project_path may be renamed by a later upsert.
        sqlx::query(
            r#"
            INSERT INTO messages (id, session_id, ordinal, role, created_at, model, project, tokens_in, tokens_out, cost_usd, needs_audit)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(message_id.to_string())
        .bind(session_id.to_string())
        .bind(ordinal)
        .bind(msg.role.to_string())
        .bind(msg.created_at.timestamp())
        .bind(&msg.model)
        .bind(&project_path)
        .bind(msg.tokens_in)
        .bind(msg.tokens_out)
        .bind(msg.cost_usd)
        .bind(i64::from(msg.needs_audit))
        .execute(&mut *tx)
        .await?;

        for (idx, part) in msg.parts.iter().enumerate() {
            let cols = part_columns(part);
            sqlx::query(
                r#"
                INSERT INTO parts (id, message_id, idx, kind, text, tool_name, tool_call_id, payload, is_error)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(message_id.to_string())
            .bind(idx as i64)
            .bind(part.kind())
            .bind(cols.text)
            .bind(cols.tool_name)
            .bind(cols.tool_call_id)
            .bind(cols.payload)
            .bind(i64::from(cols.is_error))
            .execute(&mut *tx)
            .await?;
        }

        let content = parts::joined_text(&msg.parts);
        fts::index_message(
            &mut tx,
            account_id,
            session_id,
            message_id,
            &content,
            msg.created_at.timestamp(),
        )
        .await?;

        analytics::apply_message(
            &mut tx,
            account_id,
            msg.created_at,
            msg.model.as_deref(),
            project_path.as_deref(),
            msg.tokens_in,
            msg.tokens_out,
            msg.cost_usd,
        )
        .await?;

        sqlx::query(
            r#"
            UPDATE sessions SET
                tokens_in = tokens_in + ?,
                tokens_out = tokens_out + ?,
                cost_usd = cost_usd + ?
            WHERE id = ?
            "#,
        )
        .bind(msg.tokens_in)
        .bind(msg.tokens_out)
        .bind(msg.cost_usd)
        .bind(session_id.to_string())
        .execute(&mut *tx)
        .await?;

        if enqueue_job {
            queue::enqueue(
                &mut tx,
                account_id,
                session_id,
                message_id,
                Utc::now().timestamp(),
            )
            .await?;
        }

        tx.commit().await?;
        Ok(message_id)
    }

    /// Toggle the eval-ready flag.
    pub async fn set_eval_ready(&self, session_id: Uuid, value: bool) -> Result<()> {
        let result = sqlx::query("UPDATE sessions SET eval_ready = ? WHERE id = ?")
            .bind(i64::from(value))
            .bind(session_id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("session '{session_id}'")));
        }
        Ok(())
    }

    /// Delete a session and everything derived from it.
    ///
    /// Synchronous cascade: messages and parts go via foreign keys, index
    /// entries and embedding state are removed explicitly, and the
    /// session's rollup contribution is reversed, all in one transaction.
    pub async fn delete_session(&self, session_id: Uuid) -> Result<()> {
        self.retry_busy(|| self.delete_session_once(session_id)).await
    }

    async fn delete_session_once(&self, session_id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        analytics::reverse_session(&mut tx, session_id).await?;

        for table in ["fts_terms", "embeddings", "embed_jobs"] {
            let sql = format!("DELETE FROM {table} WHERE session_id = ?");
            sqlx::query(&sql)
                .bind(session_id.to_string())
                .execute(&mut *tx)
                .await?;
        }

        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(session_id.to_string())
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(Error::NotFound(format!("session '{session_id}'")));
        }

        tx.commit().await?;
        Ok(())
    }

    /// Get a session scoped to an account.
    pub async fn get_session(&self, account_id: Uuid, id: Uuid) -> Result<Option<Session>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ? AND account_id = ?")
            .bind(id.to_string())
            .bind(account_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| session_from_row(&row)))
    }

    /// Get a session with all messages and parts, in ordinal order.
    pub async fn get_session_with_messages(
        &self,
        account_id: Uuid,
        id: Uuid,
    ) -> Result<Option<SessionWithMessages>> {
        let Some(session) = self.get_session(account_id, id).await? else {
            return Ok(None);
        };
        let messages = self.get_messages(id).await?;
        Ok(Some(SessionWithMessages { session, messages }))
    }

    /// Get all messages of a session with their parts.
    pub async fn get_messages(&self, session_id: Uuid) -> Result<Vec<Message>> {
        let rows = sqlx::query("SELECT * FROM messages WHERE session_id = ? ORDER BY ordinal")
            .bind(session_id.to_string())
            .fetch_all(&self.pool)
            .await?;

        let mut parts_by_message = self.load_parts(session_id).await?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            let mut message = message_from_row(&row);
            message.parts = parts_by_message.remove(&message.id).unwrap_or_default();
            messages.push(message);
        }
        Ok(messages)
    }

    async fn load_parts(&self, session_id: Uuid) -> Result<HashMap<Uuid, Vec<Part>>> {
        let rows = sqlx::query(
            r#"
            SELECT p.message_id, p.kind, p.text, p.tool_name, p.tool_call_id, p.payload, p.is_error
            FROM parts p
            JOIN messages m ON m.id = p.message_id
            WHERE m.session_id = ?
            ORDER BY p.message_id, p.idx
            "#,
        )
        .bind(session_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut by_message: HashMap<Uuid, Vec<Part>> = HashMap::new();
        for row in rows {
            let message_id =
                Uuid::parse_str(row.get::<&str, _>("message_id")).unwrap_or_default();
            by_message
                .entry(message_id)
                .or_default()
                .push(part_from_row(&row));
        }
        Ok(by_message)
    }

    /// Hydrate search candidates into hits, dropping any that vanished.
    pub async fn hydrate_hits(
        &self,
        account_id: Uuid,
        candidates: &[(Uuid, f64)],
    ) -> Result<Vec<SearchHit>> {
        let mut hits = Vec::with_capacity(candidates.len());
        for (message_id, score) in candidates {
            let row = sqlx::query(
                r#"
                SELECT m.id AS message_id, m.session_id, m.ordinal, m.role, m.created_at,
                       s.source, s.project_path
                FROM messages m
                JOIN sessions s ON s.id = m.session_id
                WHERE m.id = ? AND s.account_id = ?
                "#,
            )
            .bind(message_id.to_string())
            .bind(account_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

            let Some(row) = row else { continue };
            let content = match self.message_content(*message_id).await {
                Ok(content) => content,
                // Deleted between the lookup and hydration; drop the hit.
                Err(Error::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            hits.push(SearchHit {
                message_id: *message_id,
                session_id: Uuid::parse_str(row.get::<&str, _>("session_id"))
                    .unwrap_or_default(),
                ordinal: row.get("ordinal"),
                role: MessageRole::from(row.get::<&str, _>("role")),
                content,
                created_at: timestamp_to_datetime(row.get("created_at")),
                source: SessionSource::from(row.get::<&str, _>("source")),
                project_path: row.get("project_path"),
                score: *score,
            });
        }
        Ok(hits)
    }

    /// Concatenated text content of one message's parts.
    ///
    /// An unknown message id is `NotFound`, distinct from a message that
    /// exists with no textual parts.
    pub async fn message_content(&self, message_id: Uuid) -> Result<String> {
        let exists = sqlx::query("SELECT 1 FROM messages WHERE id = ?")
            .bind(message_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Err(Error::NotFound(format!("message '{message_id}'")));
        }

        let rows = sqlx::query(
            "SELECT kind, text, tool_name, tool_call_id, payload, is_error FROM parts WHERE message_id = ? ORDER BY idx",
        )
        .bind(message_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        let parts: Vec<Part> = rows.iter().map(part_from_row).collect();
        Ok(parts::joined_text(&parts))
    }

    /// List sessions, newest first.
    pub async fn list_sessions(&self, account_id: Uuid, limit: i64) -> Result<Vec<Session>> {
        let rows = sqlx::query(
            "SELECT * FROM sessions WHERE account_id = ? ORDER BY started_at DESC LIMIT ?",
        )
        .bind(account_id.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(session_from_row).collect())
    }

    /// Get session count for an account.
    pub async fn count_sessions(&self, account_id: Uuid) -> Result<i64> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sessions WHERE account_id = ?")
                .bind(account_id.to_string())
                .fetch_one(&self.pool)
                .await?;
        Ok(count.0)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Retry a write that failed because the database was busy, bounded
    /// attempts before surfacing a Conflict.
    async fn retry_busy<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u64 = 0;
        loop {
            match op().await {
                Err(Error::Database(e)) if is_busy(&e) => {
                    attempt += 1;
                    if attempt > WRITE_RETRIES {
                        return Err(Error::Conflict(e.to_string()));
                    }
                    tokio::time::sleep(Duration::from_millis(25 * attempt)).await;
                }
                other => return other,
            }
        }
    }
}

fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            let msg = db.message();
            msg.contains("locked") || msg.contains("busy")
        }
        _ => false,
    }
}

fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

fn timestamp_to_datetime(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

fn account_from_row(row: &sqlx::sqlite::SqliteRow) -> Account {
    Account {
        id: Uuid::parse_str(row.get::<&str, _>("id")).unwrap_or_default(),
        external_subject: row.get("external_subject"),
        created_at: timestamp_to_datetime(row.get("created_at")),
    }
}

fn session_from_row(row: &sqlx::sqlite::SqliteRow) -> Session {
    Session {
        id: Uuid::parse_str(row.get::<&str, _>("id")).unwrap_or_default(),
        account_id: Uuid::parse_str(row.get::<&str, _>("account_id")).unwrap_or_default(),
        external_id: row.get("external_id"),
        source: SessionSource::from(row.get::<&str, _>("source")),
        project_path: row.get("project_path"),
        git_branch: row.get("git_branch"),
        started_at: timestamp_to_datetime(row.get("started_at")),
        ended_at: row
            .get::<Option<i64>, _>("ended_at")
            .and_then(|ts| DateTime::from_timestamp(ts, 0)),
        tokens_in: row.get("tokens_in"),
        tokens_out: row.get("tokens_out"),
        cost_usd: row.get("cost_usd"),
        eval_ready: row.get::<i64, _>("eval_ready") != 0,
    }
}

fn message_from_row(row: &sqlx::sqlite::SqliteRow) -> Message {
    Message {
        id: Uuid::parse_str(row.get::<&str, _>("id")).unwrap_or_default(),
        session_id: Uuid::parse_str(row.get::<&str, _>("session_id")).unwrap_or_default(),
        ordinal: row.get("ordinal"),
        role: MessageRole::from(row.get::<&str, _>("role")),
        created_at: timestamp_to_datetime(row.get("created_at")),
        model: row.get("model"),
        tokens_in: row.get("tokens_in"),
        tokens_out: row.get("tokens_out"),
        cost_usd: row.get("cost_usd"),
        needs_audit: row.get::<i64, _>("needs_audit") != 0,
        parts: Vec::new(),
    }
}

fn part_from_row(row: &sqlx::sqlite::SqliteRow) -> Part {
    let text: Option<String> = row.get("text");
    let tool_name: Option<String> = row.get("tool_name");
    let tool_call_id: Option<String> = row.get("tool_call_id");
    let payload: Option<serde_json::Value> = row
        .get::<Option<String>, _>("payload")
        .and_then(|s| serde_json::from_str(&s).ok());

    match row.get::<&str, _>("kind") {
        "reasoning" => Part::Reasoning {
            text: text.unwrap_or_default(),
        },
        "tool_call" => Part::ToolCall {
            tool_call_id: tool_call_id.unwrap_or_default(),
            name: tool_name.unwrap_or_default(),
            input: payload,
        },
        "tool_result" => Part::ToolResult {
            tool_call_id: tool_call_id.unwrap_or_default(),
            output: payload,
            is_error: row.get::<i64, _>("is_error") != 0,
        },
        _ => Part::Text {
            text: text.unwrap_or_default(),
        },
    }
}

#[derive(Default)]
struct PartColumns {
    text: Option<String>,
    tool_name: Option<String>,
    tool_call_id: Option<String>,
    payload: Option<String>,
    is_error: bool,
}

/// Split a part into its storage columns.
fn part_columns(part: &Part) -> PartColumns {
    match part {
        Part::Text { text } | Part::Reasoning { text } => PartColumns {
            text: Some(text.clone()),
            ..PartColumns::default()
        },
        Part::ToolCall {
            tool_call_id,
            name,
            input,
        } => PartColumns {
            tool_name: Some(name.clone()),
            tool_call_id: Some(tool_call_id.clone()),
            payload: input.as_ref().map(std::string::ToString::to_string),
            ..PartColumns::default()
        },
        Part::ToolResult {
            tool_call_id,
            output,
            is_error,
        } => PartColumns {
            tool_call_id: Some(tool_call_id.clone()),
            payload: output.as_ref().map(std::string::ToString::to_string),
            is_error: *is_error,
            ..PartColumns::default()
        },
    }
}
