//! Full-text index over message content.
//!
//! The index is a term table maintained synchronously inside the same
//! transaction as the message insert, so a full-text query issued
//! immediately after a successful ingest sees the new message. Scoring is
//! a term-frequency sum over the query terms; ties break toward the most
//! recent message.

use std::collections::HashMap;

use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::error::Result;

/// Words excluded from the index and from queries.
const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from", "has", "have", "if",
    "in", "into", "is", "it", "its", "no", "not", "of", "on", "or", "so", "such", "that", "the",
    "their", "then", "there", "these", "they", "this", "to", "was", "we", "were", "will", "with",
    "you", "your",
];

const MAX_TOKEN_LEN: usize = 64;

/// Case-insensitive word tokenization with stop-word filtering.
///
/// Returns term frequencies. Tokens are runs of alphanumerics and
/// underscores; single characters and stop words are dropped.
pub fn tokenize(text: &str) -> HashMap<String, i64> {
    let mut terms: HashMap<String, i64> = HashMap::new();
    for raw in text.split(|c: char| !c.is_alphanumeric() && c != '_') {
        if raw.len() < 2 || raw.len() > MAX_TOKEN_LEN {
            continue;
        }
        let token = raw.to_lowercase();
        if STOP_WORDS.contains(&token.as_str()) {
            continue;
        }
        *terms.entry(token).or_insert(0) += 1;
    }
    terms
}

/// Write index rows for one message. Runs inside the ingest transaction.
pub(crate) async fn index_message(
    conn: &mut SqliteConnection,
    account_id: Uuid,
    session_id: Uuid,
    message_id: Uuid,
    text: &str,
    created_at: i64,
) -> Result<()> {
    for (term, tf) in tokenize(text) {
        sqlx::query(
            r#"
            INSERT INTO fts_terms (term, account_id, session_id, message_id, tf, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&term)
        .bind(account_id.to_string())
        .bind(session_id.to_string())
        .bind(message_id.to_string())
        .bind(tf)
        .bind(created_at)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// A full-text candidate before any fusion or hydration.
#[derive(Debug, Clone)]
pub struct FtsCandidate {
    pub message_id: Uuid,
    pub session_id: Uuid,
    pub score: f64,
    pub created_at: i64,
}

/// Query the index for an account.
///
/// Ranked by TF sum descending, then message recency.
pub async fn query(
    pool: &SqlitePool,
    account_id: Uuid,
    query_text: &str,
    limit: i64,
) -> Result<Vec<FtsCandidate>> {
    let terms: Vec<String> = tokenize(query_text).into_keys().collect();
    if terms.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders = vec!["?"; terms.len()].join(", ");
    let sql = format!(
        r#"
        SELECT message_id, session_id,
               SUM(tf) AS score,
               MAX(created_at) AS created_at
        FROM fts_terms
        WHERE account_id = ? AND term IN ({placeholders})
        GROUP BY message_id, session_id
        ORDER BY score DESC, created_at DESC
        LIMIT ?
        "#
    );

    let mut query = sqlx::query(&sql).bind(account_id.to_string());
    for term in &terms {
        query = query.bind(term);
    }
    query = query.bind(limit);

    let rows = query.fetch_all(pool).await?;

    let mut candidates = Vec::with_capacity(rows.len());
    for row in rows {
        candidates.push(FtsCandidate {
            message_id: Uuid::parse_str(row.get::<&str, _>("message_id")).unwrap_or_default(),
            session_id: Uuid::parse_str(row.get::<&str, _>("session_id")).unwrap_or_default(),
            score: row.get::<i64, _>("score") as f64,
            created_at: row.get("created_at"),
        });
    }
    Ok(candidates)
}
