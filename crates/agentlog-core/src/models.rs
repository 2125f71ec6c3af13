//! Domain models for session transcript entities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An account owning sessions, keyed by an opaque external identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    /// Subject claim from the external identity provider.
    pub external_subject: String,
    pub created_at: DateTime<Utc>,
}

/// An API key bound to one account.
///
/// Only the SHA-256 lookup hash is persisted; the plaintext value exists
/// exactly once, in the return value of key creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: Uuid,
    pub account_id: Uuid,
    pub key_hash: String,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

/// The CLI tool that produced a session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SessionSource {
    ClaudeCode,
    Codex,
    Cursor,
    Opencode,
    Gemini,
    Other,
}

impl std::fmt::Display for SessionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionSource::ClaudeCode => write!(f, "claude-code"),
            SessionSource::Codex => write!(f, "codex"),
            SessionSource::Cursor => write!(f, "cursor"),
            SessionSource::Opencode => write!(f, "opencode"),
            SessionSource::Gemini => write!(f, "gemini"),
            SessionSource::Other => write!(f, "other"),
        }
    }
}

impl From<&str> for SessionSource {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "claude-code" | "claude_code" | "claude" => SessionSource::ClaudeCode,
            "codex" => SessionSource::Codex,
            "cursor" => SessionSource::Cursor,
            "opencode" => SessionSource::Opencode,
            "gemini" => SessionSource::Gemini,
            _ => SessionSource::Other,
        }
    }
}

/// One CLI working session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub account_id: Uuid,
    /// Unique per originating CLI + machine; upsert key together with account.
    pub external_id: String,
    pub source: SessionSource,
    pub project_path: Option<String>,
    pub git_branch: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub cost_usd: f64,
    pub eval_ready: bool,
}

/// A message within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub session_id: Uuid,
    /// Monotonic per session, assigned by the store.
    pub ordinal: i64,
    pub role: MessageRole,
    pub created_at: DateTime<Utc>,
    pub model: Option<String>,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub cost_usd: f64,
    /// Set when the redaction scanner failed and content passed through raw.
    pub needs_audit: bool,
    pub parts: Vec<crate::parts::Part>,
}

/// Message roles.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::Tool => write!(f, "tool"),
        }
    }
}

impl From<&str> for MessageRole {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "assistant" | "agent" | "ai" => MessageRole::Assistant,
            "tool" | "function" => MessageRole::Tool,
            _ => MessageRole::User,
        }
    }
}

/// Session with all its messages (for full retrieval and export).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionWithMessages {
    #[serde(flatten)]
    pub session: Session,
    pub messages: Vec<Message>,
}

/// Search hit for message-level queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub message_id: Uuid,
    pub session_id: Uuid,
    pub ordinal: i64,
    pub role: MessageRole,
    /// Concatenated text content of the message.
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub source: SessionSource,
    pub project_path: Option<String>,
    /// Final score in the mode that produced the hit: TF sum for full-text,
    /// cosine similarity for semantic, fused RRF score for hybrid.
    pub score: f64,
}

/// One analytics rollup bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollupBucket {
    pub day: String,
    pub model: String,
    pub project: String,
    pub messages: i64,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub cost_usd: f64,
}

/// Aggregated stats for a query range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSummary {
    pub messages: i64,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub cost_usd: f64,
    pub by_model: Vec<StatsBreakdown>,
    pub by_project: Vec<StatsBreakdown>,
}

/// Per-model or per-project stats line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsBreakdown {
    pub key: String,
    pub messages: i64,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub cost_usd: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_source_parses_aliases() {
        assert_eq!(SessionSource::from("claude-code"), SessionSource::ClaudeCode);
        assert_eq!(SessionSource::from("Claude"), SessionSource::ClaudeCode);
        assert_eq!(SessionSource::from("codex"), SessionSource::Codex);
        assert_eq!(SessionSource::from("something-new"), SessionSource::Other);
    }

    #[test]
    fn session_source_display_roundtrip() {
        for source in [
            SessionSource::ClaudeCode,
            SessionSource::Codex,
            SessionSource::Cursor,
            SessionSource::Opencode,
            SessionSource::Gemini,
            SessionSource::Other,
        ] {
            assert_eq!(SessionSource::from(source.to_string().as_str()), source);
        }
    }

    #[test]
    fn message_role_parses_aliases() {
        assert_eq!(MessageRole::from("assistant"), MessageRole::Assistant);
        assert_eq!(MessageRole::from("function"), MessageRole::Tool);
        assert_eq!(MessageRole::from("user"), MessageRole::User);
    }

    #[test]
    fn session_serializes_kebab_source() {
        let session = Session {
            id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            external_id: "ext-1".to_string(),
            source: SessionSource::ClaudeCode,
            project_path: None,
            git_branch: None,
            started_at: Utc::now(),
            ended_at: None,
            tokens_in: 0,
            tokens_out: 0,
            cost_usd: 0.0,
            eval_ready: false,
        };
        let json = serde_json::to_string(&session).expect("serialize");
        assert!(json.contains("\"source\":\"claude-code\""));
    }
}
