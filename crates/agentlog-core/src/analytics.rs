//! Incremental usage analytics.
//!
//! Rollup buckets are keyed by (account, day, model, project) and updated
//! by addition inside the same transaction as the message insert, so stats
//! queries never scan message history and never observe a partially applied
//! ingest. Session deletion subtracts the session's exact per-bucket
//! contribution, recomputed from its retained per-message counters.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{StatsBreakdown, StatsSummary};

/// Bucket key used when a message carries no model tag or the session has
/// no project path. Must match the COALESCE defaults in `reverse_session`.
const UNKNOWN: &str = "unknown";

/// UTC day bucket for a timestamp, e.g. "2026-08-30".
pub fn day_bucket(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d").to_string()
}

/// Add one ingested message to its rollup bucket. Runs inside the ingest
/// transaction.
pub(crate) async fn apply_message(
    conn: &mut SqliteConnection,
    account_id: Uuid,
    at: DateTime<Utc>,
    model: Option<&str>,
    project: Option<&str>,
    tokens_in: i64,
    tokens_out: i64,
    cost_usd: f64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO rollups (account_id, day, model, project, messages, tokens_in, tokens_out, cost_usd)
        VALUES (?, ?, ?, ?, 1, ?, ?, ?)
        ON CONFLICT(account_id, day, model, project) DO UPDATE SET
            messages = messages + 1,
            tokens_in = tokens_in + excluded.tokens_in,
            tokens_out = tokens_out + excluded.tokens_out,
            cost_usd = cost_usd + excluded.cost_usd
        "#,
    )
    .bind(account_id.to_string())
    .bind(day_bucket(at))
    .bind(model.unwrap_or(UNKNOWN))
    .bind(project.unwrap_or(UNKNOWN))
    .bind(tokens_in)
    .bind(tokens_out)
    .bind(cost_usd)
    .execute(conn)
    .await?;
    Ok(())
}

/// Subtract a session's contribution from every bucket it touched. Runs
/// inside the delete transaction, before the session rows go away.
///
/// Buckets are recomputed from the per-message `project` column, not the
/// session's current `project_path`: re-ingest may rename the project
/// after earlier messages were bucketed under the old name.
pub(crate) async fn reverse_session(
    conn: &mut SqliteConnection,
    session_id: Uuid,
) -> Result<()> {
    let rows = sqlx::query(
        r#"
        SELECT s.account_id AS account_id,
               strftime('%Y-%m-%d', m.created_at, 'unixepoch') AS day,
               COALESCE(m.model, 'unknown') AS model,
               COALESCE(m.project, 'unknown') AS project,
               COUNT(*) AS messages,
               SUM(m.tokens_in) AS tokens_in,
               SUM(m.tokens_out) AS tokens_out,
               SUM(m.cost_usd) AS cost_usd
        FROM messages m
        JOIN sessions s ON s.id = m.session_id
        WHERE m.session_id = ?
        GROUP BY day, model, project
        "#,
    )
    .bind(session_id.to_string())
    .fetch_all(&mut *conn)
    .await?;

    for row in rows {
        sqlx::query(
            r#"
            UPDATE rollups SET
                messages = messages - ?,
                tokens_in = tokens_in - ?,
                tokens_out = tokens_out - ?,
                cost_usd = cost_usd - ?
            WHERE account_id = ? AND day = ? AND model = ? AND project = ?
            "#,
        )
        .bind(row.get::<i64, _>("messages"))
        .bind(row.get::<i64, _>("tokens_in"))
        .bind(row.get::<i64, _>("tokens_out"))
        .bind(row.get::<f64, _>("cost_usd"))
        .bind(row.get::<&str, _>("account_id"))
        .bind(row.get::<&str, _>("day"))
        .bind(row.get::<&str, _>("model"))
        .bind(row.get::<&str, _>("project"))
        .execute(&mut *conn)
        .await?;
    }

    // Drop emptied buckets so the table only holds live contributions.
    sqlx::query("DELETE FROM rollups WHERE messages <= 0")
        .execute(&mut *conn)
        .await?;

    Ok(())
}

/// Read pre-aggregated stats for an account.
///
/// `since_day` bounds the range inclusively (same day-bucket format as the
/// rollup key); `None` sums everything.
pub async fn query_stats(
    pool: &SqlitePool,
    account_id: Uuid,
    since_day: Option<&str>,
) -> Result<StatsSummary> {
    let by_model = breakdown(pool, account_id, since_day, "model").await?;
    let by_project = breakdown(pool, account_id, since_day, "project").await?;

    let mut summary = StatsSummary {
        messages: 0,
        tokens_in: 0,
        tokens_out: 0,
        cost_usd: 0.0,
        by_model,
        by_project,
    };
    for line in &summary.by_model {
        summary.messages += line.messages;
        summary.tokens_in += line.tokens_in;
        summary.tokens_out += line.tokens_out;
        summary.cost_usd += line.cost_usd;
    }
    Ok(summary)
}

async fn breakdown(
    pool: &SqlitePool,
    account_id: Uuid,
    since_day: Option<&str>,
    key_column: &str,
) -> Result<Vec<StatsBreakdown>> {
    // key_column is one of the fixed literals above, never caller input.
    let mut sql = format!(
        r#"
        SELECT {key_column} AS key,
               SUM(messages) AS messages,
               SUM(tokens_in) AS tokens_in,
               SUM(tokens_out) AS tokens_out,
               SUM(cost_usd) AS cost_usd
        FROM rollups
        WHERE account_id = ?
        "#
    );
    if since_day.is_some() {
        sql.push_str(" AND day >= ?");
    }
    sql.push_str(&format!(" GROUP BY {key_column} ORDER BY tokens_in + tokens_out DESC"));

    let mut query = sqlx::query(&sql).bind(account_id.to_string());
    if let Some(day) = since_day {
        query = query.bind(day);
    }

    let rows = query.fetch_all(pool).await?;
    let mut lines = Vec::with_capacity(rows.len());
    for row in rows {
        lines.push(StatsBreakdown {
            key: row.get("key"),
            messages: row.get("messages"),
            tokens_in: row.get("tokens_in"),
            tokens_out: row.get("tokens_out"),
            cost_usd: row.get("cost_usd"),
        });
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn day_bucket_formats_utc_date() {
        let at = DateTime::from_timestamp(1_700_000_000, 0).expect("timestamp");
        assert_eq!(day_bucket(at), "2023-11-14");
    }

    #[test]
    fn day_bucket_matches_sqlite_strftime_format() {
        // Reversal computes the bucket with strftime('%Y-%m-%d', …,
        // 'unixepoch'); both sides must produce identical keys.
        let at = DateTime::from_timestamp(0, 0).expect("timestamp");
        assert_eq!(day_bucket(at), "1970-01-01");
    }
}
