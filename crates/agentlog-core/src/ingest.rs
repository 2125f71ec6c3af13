//! Ingestion orchestration.
//!
//! One service owns the write path: admission check against the embedding
//! queue, redaction, session upsert, message appends, and job enqueue.
//! Writers to the same session are serialized through a keyed async mutex
//! so ordinals stay dense under concurrent pushes from the same CLI;
//! different sessions proceed in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{QueueConfig, RedactionConfig};
use crate::db::{Database, NewMessage, SessionMeta};
use crate::error::{Error, Result};
use crate::models::{MessageRole, SessionSource};
use crate::parts::Part;
use crate::queue;
use crate::redact::Redactor;

/// Ingest request body: one session snapshot with its new messages.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestPayload {
    /// Session identity within the account; the idempotent upsert key.
    pub external_id: String,
    pub source: String,
    #[serde(default)]
    pub project_path: Option<String>,
    #[serde(default)]
    pub git_branch: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub messages: Vec<IngestMessage>,
}

/// One message in an ingest payload.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestMessage {
    pub role: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub tokens_in: i64,
    #[serde(default)]
    pub tokens_out: i64,
    #[serde(default)]
    pub cost_usd: f64,
    pub parts: Vec<Part>,
}

/// What an accepted ingest did.
#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub session_id: Uuid,
    pub messages_ingested: usize,
    /// Secret matches replaced across all parts.
    pub redactions: usize,
}

/// Write-path front door. Shared via clone; all clones use the same lock
/// map.
#[derive(Clone)]
pub struct IngestService {
    db: Database,
    redactor: Arc<Redactor>,
    queue_config: QueueConfig,
    embedding_enabled: bool,
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl IngestService {
    pub fn new(
        db: Database,
        redaction: &RedactionConfig,
        queue_config: QueueConfig,
        embedding_enabled: bool,
    ) -> Self {
        Self {
            db,
            redactor: Arc::new(Redactor::new(redaction)),
            queue_config,
            embedding_enabled,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Ingest one payload for an account. Idempotent on the session row
    /// (keyed by external_id); messages always append.
    pub async fn ingest(&self, account_id: Uuid, payload: IngestPayload) -> Result<IngestOutcome> {
        if payload.external_id.trim().is_empty() {
            return Err(Error::Validation("external_id must not be empty".to_string()));
        }

        // Backpressure: refuse new work while the embedding queue is at
        // capacity, before any row is written.
        if self.embedding_enabled {
            queue::check_capacity(self.db.pool(), &self.queue_config).await?;
        }

        let key = format!("{account_id}:{}", payload.external_id);
        let lock = self.session_lock(&key);
        let guard = lock.lock_owned().await;
        let result = self.ingest_locked(account_id, payload).await;
        drop(guard);
        self.evict_idle_lock(&key);
        result
    }

    async fn ingest_locked(
        &self,
        account_id: Uuid,
        payload: IngestPayload,
    ) -> Result<IngestOutcome> {
        let meta = SessionMeta {
            external_id: payload.external_id.clone(),
            source: SessionSource::from(payload.source.as_str()),
            project_path: payload.project_path.clone(),
            git_branch: payload.git_branch.clone(),
            started_at: payload.started_at,
            ended_at: payload.ended_at,
        };
        let session_id = self.db.upsert_session(account_id, &meta).await?;

        let mut redactions = 0usize;
        let mut ingested = 0usize;
        for incoming in payload.messages {
            let mut parts = Vec::with_capacity(incoming.parts.len());
            let mut needs_audit = false;
            for part in incoming.parts {
                let (cleaned, count, audit) = self.redactor.redact_part(part);
                redactions += count;
                needs_audit |= audit;
                parts.push(cleaned);
            }

            let message = NewMessage {
                role: MessageRole::from(incoming.role.as_str()),
                created_at: incoming.created_at,
                model: incoming.model,
                tokens_in: incoming.tokens_in,
                tokens_out: incoming.tokens_out,
                cost_usd: incoming.cost_usd,
                needs_audit,
                parts,
            };
            // The embed job lands in the same transaction as the append,
            // so a stored message can never silently miss its job.
            if self.embedding_enabled {
                self.db
                    .append_message_with_embed_job(session_id, &message)
                    .await?;
            } else {
                self.db.append_message(session_id, &message).await?;
            }
            ingested += 1;
        }

        tracing::debug!(
            %session_id,
            messages = ingested,
            redactions,
            "ingested session payload"
        );
        Ok(IngestOutcome {
            session_id,
            messages_ingested: ingested,
            redactions,
        })
    }

    /// Get or create the write lock for one (account, session) identity.
    fn session_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drop a lock entry nobody holds, keeping the map bounded by the
    /// number of concurrently written sessions. A count above one means
    /// another writer grabbed the entry in the meantime; it stays.
    fn evict_idle_lock(&self, key: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(key);
        }
    }

    #[cfg(test)]
    fn lock_map_len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
