//! Durable embedding work queue.
//!
//! Jobs live in the `embed_jobs` table so a crash never loses indexing
//! work. Ingest enqueues one job per message in the same transaction as
//! the message append; background workers claim jobs, call the embedding
//! provider, and store the vector. Failures retry with exponential
//! backoff until `max_attempts`, then the job is parked as `dead`.
//!
//! States: `pending` -> `in_flight` -> `indexed`, or back to `pending`
//! on failure, or `dead` after the attempt budget is spent. Jobs left
//! `in_flight` by a crashed worker are requeued at startup via
//! [`requeue_in_flight`].

use std::sync::Arc;

use chrono::Utc;
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::db::Database;
use crate::embedding::{self, EmbeddingProvider};
use crate::error::{Error, Result};

/// A claimed embedding job.
#[derive(Debug, Clone)]
pub struct EmbedJob {
    pub id: i64,
    pub message_id: Uuid,
    pub session_id: Uuid,
    pub account_id: Uuid,
    pub attempts: i64,
}

/// Jobs still waiting for a worker (pending or claimed).
pub async fn depth(pool: &SqlitePool) -> Result<i64> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS n FROM embed_jobs WHERE state IN ('pending', 'in_flight')",
    )
    .fetch_one(pool)
    .await?;
    Ok(row.get("n"))
}

/// Admission check used by ingest before it accepts new work.
pub async fn check_capacity(pool: &SqlitePool, config: &QueueConfig) -> Result<()> {
    let current = depth(pool).await?;
    if current >= config.max_depth as i64 {
        return Err(Error::QueueFull(config.max_depth));
    }
    Ok(())
}

/// Enqueue one message for embedding. Runs inside the ingest transaction;
/// re-ingesting a message resets any previous job back to pending.
pub(crate) async fn enqueue(
    conn: &mut SqliteConnection,
    account_id: Uuid,
    session_id: Uuid,
    message_id: Uuid,
    now: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO embed_jobs (message_id, session_id, account_id, state, attempts, next_attempt_at, created_at)
        VALUES (?, ?, ?, 'pending', 0, ?, ?)
        ON CONFLICT(message_id) DO UPDATE SET
            state = 'pending',
            attempts = 0,
            next_attempt_at = excluded.next_attempt_at
        "#,
    )
    .bind(message_id.to_string())
    .bind(session_id.to_string())
    .bind(account_id.to_string())
    .bind(now)
    .bind(now)
    .execute(conn)
    .await?;
    Ok(())
}

/// Return claimed-but-unfinished jobs to `pending`.
///
/// Run once at startup, before workers spawn: a crash between claim and
/// completion would otherwise strand the job in `in_flight` forever,
/// never embedded and permanently counted against `max_depth`.
pub async fn requeue_in_flight(pool: &SqlitePool) -> Result<u64> {
    let result = sqlx::query("UPDATE embed_jobs SET state = 'pending' WHERE state = 'in_flight'")
        .execute(pool)
        .await?;
    let requeued = result.rows_affected();
    if requeued > 0 {
        tracing::info!(jobs = requeued, "requeued in-flight embedding jobs");
    }
    Ok(requeued)
}

/// Claim the oldest due pending job, moving it to `in_flight`.
pub async fn claim_next(pool: &SqlitePool, now: i64) -> Result<Option<EmbedJob>> {
    let row = sqlx::query(
        r#"
        UPDATE embed_jobs
        SET state = 'in_flight'
        WHERE id = (
            SELECT id FROM embed_jobs
            WHERE state = 'pending' AND next_attempt_at <= ?
            ORDER BY id
            LIMIT 1
        )
        RETURNING id, message_id, session_id, account_id, attempts
        "#,
    )
    .bind(now)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    Ok(Some(EmbedJob {
        id: row.get("id"),
        message_id: Uuid::parse_str(row.get::<&str, _>("message_id")).unwrap_or_default(),
        session_id: Uuid::parse_str(row.get::<&str, _>("session_id")).unwrap_or_default(),
        account_id: Uuid::parse_str(row.get::<&str, _>("account_id")).unwrap_or_default(),
        attempts: row.get("attempts"),
    }))
}

/// Process at most one due job. Returns true when a job was handled,
/// false when the queue had nothing due.
pub async fn process_one(
    db: &Database,
    provider: &dyn EmbeddingProvider,
    config: &QueueConfig,
) -> Result<bool> {
    let now = Utc::now().timestamp();
    let Some(job) = claim_next(db.pool(), now).await? else {
        return Ok(false);
    };

    // The message may have been deleted while the job waited.
    let content = match db.message_content(job.message_id).await {
        Ok(content) => content,
        Err(Error::NotFound(_)) => {
            sqlx::query("DELETE FROM embed_jobs WHERE id = ?")
                .bind(job.id)
                .execute(db.pool())
                .await?;
            return Ok(true);
        }
        Err(e) => return Err(e),
    };

    match provider.embed(&content).await {
        Ok(vector) => {
            store_embedding(db.pool(), &job, &vector).await?;
            sqlx::query("UPDATE embed_jobs SET state = 'indexed' WHERE id = ?")
                .bind(job.id)
                .execute(db.pool())
                .await?;
            tracing::debug!(message_id = %job.message_id, "embedded message");
        }
        Err(e) => {
            fail_job(db.pool(), &job, config, now, &e).await?;
        }
    }
    Ok(true)
}

async fn store_embedding(pool: &SqlitePool, job: &EmbedJob, vector: &[f32]) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO embeddings (message_id, session_id, account_id, dims, vector)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(message_id) DO UPDATE SET
            dims = excluded.dims,
            vector = excluded.vector
        "#,
    )
    .bind(job.message_id.to_string())
    .bind(job.session_id.to_string())
    .bind(job.account_id.to_string())
    .bind(vector.len() as i64)
    .bind(embedding::vec_to_blob(vector))
    .execute(pool)
    .await?;
    Ok(())
}

/// Schedule a retry with exponential backoff, or park the job as dead
/// once the attempt budget is spent.
async fn fail_job(
    pool: &SqlitePool,
    job: &EmbedJob,
    config: &QueueConfig,
    now: i64,
    cause: &Error,
) -> Result<()> {
    let attempts = job.attempts + 1;
    if attempts >= config.max_attempts {
        tracing::warn!(
            message_id = %job.message_id,
            attempts,
            error = %cause,
            "embedding job exhausted retries, marking dead"
        );
        sqlx::query("UPDATE embed_jobs SET state = 'dead', attempts = ? WHERE id = ?")
            .bind(attempts)
            .bind(job.id)
            .execute(pool)
            .await?;
        return Ok(());
    }

    let delay = config.backoff_base_secs.saturating_mul(1_i64 << (attempts - 1).min(32));
    tracing::debug!(
        message_id = %job.message_id,
        attempts,
        delay_secs = delay,
        error = %cause,
        "embedding job failed, retrying"
    );
    sqlx::query(
        "UPDATE embed_jobs SET state = 'pending', attempts = ?, next_attempt_at = ? WHERE id = ?",
    )
    .bind(attempts)
    .bind(now + delay)
    .bind(job.id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Long-running worker loop. Drains due jobs back to back, then sleeps
/// for the poll interval when the queue is idle.
pub async fn run_worker(
    db: Database,
    provider: Arc<dyn EmbeddingProvider>,
    config: QueueConfig,
    worker_id: usize,
) {
    tracing::info!(worker_id, "embedding worker started");
    loop {
        match process_one(&db, provider.as_ref(), &config).await {
            Ok(true) => {}
            Ok(false) => {
                tokio::time::sleep(std::time::Duration::from_secs(config.poll_interval_secs))
                    .await;
            }
            Err(e) => {
                tracing::error!(worker_id, error = %e, "embedding worker step failed");
                tokio::time::sleep(std::time::Duration::from_secs(config.poll_interval_secs))
                    .await;
            }
        }
    }
}
