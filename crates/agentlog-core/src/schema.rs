//! Database schema for agentlog.

/// Full SQL schema, applied idempotently at open.
///
/// `fts_terms`, `embeddings`, and `embed_jobs` are derived state: losing
/// them is not data loss, they are rebuildable from `messages`/`parts`.
/// `rollups` is rebuildable by replay but maintained incrementally.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    id TEXT PRIMARY KEY,
    external_subject TEXT NOT NULL UNIQUE,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS api_keys (
    id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
    key_hash TEXT NOT NULL UNIQUE,
    created_at INTEGER NOT NULL,
    revoked_at INTEGER
);

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
    external_id TEXT NOT NULL,
    source TEXT NOT NULL,
    project_path TEXT,
    git_branch TEXT,
    started_at INTEGER NOT NULL,
    ended_at INTEGER,
    tokens_in INTEGER NOT NULL DEFAULT 0,
    tokens_out INTEGER NOT NULL DEFAULT 0,
    cost_usd REAL NOT NULL DEFAULT 0,
    eval_ready INTEGER NOT NULL DEFAULT 0,
    UNIQUE(account_id, external_id)
);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    ordinal INTEGER NOT NULL,
    role TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    model TEXT,
    project TEXT,
    tokens_in INTEGER NOT NULL DEFAULT 0,
    tokens_out INTEGER NOT NULL DEFAULT 0,
    cost_usd REAL NOT NULL DEFAULT 0,
    needs_audit INTEGER NOT NULL DEFAULT 0,
    UNIQUE(session_id, ordinal)
);

CREATE TABLE IF NOT EXISTS parts (
    id TEXT PRIMARY KEY,
    message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    idx INTEGER NOT NULL,
    kind TEXT NOT NULL,
    text TEXT,
    tool_name TEXT,
    tool_call_id TEXT,
    payload TEXT,
    is_error INTEGER NOT NULL DEFAULT 0,
    UNIQUE(message_id, idx)
);

CREATE TABLE IF NOT EXISTS fts_terms (
    term TEXT NOT NULL,
    account_id TEXT NOT NULL,
    session_id TEXT NOT NULL,
    message_id TEXT NOT NULL,
    tf INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_fts_terms_lookup
    ON fts_terms(account_id, term);
CREATE INDEX IF NOT EXISTS idx_fts_terms_session
    ON fts_terms(session_id);

CREATE TABLE IF NOT EXISTS embeddings (
    message_id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    account_id TEXT NOT NULL,
    dims INTEGER NOT NULL,
    vector BLOB NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_embeddings_account
    ON embeddings(account_id);
CREATE INDEX IF NOT EXISTS idx_embeddings_session
    ON embeddings(session_id);

CREATE TABLE IF NOT EXISTS embed_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    message_id TEXT NOT NULL UNIQUE,
    session_id TEXT NOT NULL,
    account_id TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'pending',
    attempts INTEGER NOT NULL DEFAULT 0,
    next_attempt_at INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_embed_jobs_due
    ON embed_jobs(state, next_attempt_at);

CREATE TABLE IF NOT EXISTS rollups (
    account_id TEXT NOT NULL,
    day TEXT NOT NULL,
    model TEXT NOT NULL,
    project TEXT NOT NULL,
    messages INTEGER NOT NULL DEFAULT 0,
    tokens_in INTEGER NOT NULL DEFAULT 0,
    tokens_out INTEGER NOT NULL DEFAULT 0,
    cost_usd REAL NOT NULL DEFAULT 0,
    PRIMARY KEY(account_id, day, model, project)
);
"#;
