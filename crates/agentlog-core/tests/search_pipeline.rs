//! Integration tests for ingest, the embedding queue, and search.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use agentlog_core::config::{QueueConfig, RedactionConfig, RetrievalConfig};
use agentlog_core::embedding::{DisabledProvider, EmbeddingProvider};
use agentlog_core::error::{Error, Result};
use agentlog_core::ingest::{IngestMessage, IngestPayload, IngestService};
use agentlog_core::parts::Part;
use agentlog_core::search::{SearchEngine, SearchMode};
use agentlog_core::{Database, fts, queue};

fn temp_db_path() -> std::path::PathBuf {
    let mut path = std::env::temp_dir();
    let filename = format!("agentlog-test-{}.db", Uuid::new_v4());
    path.push(filename);
    path
}

/// Deterministic embedding: hash each token into one of 16 buckets. Texts
/// sharing words land near each other, which is all similarity tests need.
struct BagOfWordsProvider;

#[async_trait]
impl EmbeddingProvider for BagOfWordsProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut v = vec![0.0f32; 16];
        for token in text.split_whitespace() {
            let mut hasher = DefaultHasher::new();
            token.to_lowercase().hash(&mut hasher);
            v[(hasher.finish() % 16) as usize] += 1.0;
        }
        Ok(v)
    }

    fn dims(&self) -> usize {
        16
    }
}

/// Always fails, counting the attempts it saw.
struct FlakyProvider {
    calls: AtomicUsize,
}

#[async_trait]
impl EmbeddingProvider for FlakyProvider {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(Error::Upstream("simulated outage".to_string()))
    }

    fn dims(&self) -> usize {
        16
    }
}

fn service(db: &Database, embedding_enabled: bool) -> IngestService {
    IngestService::new(
        db.clone(),
        &RedactionConfig::default(),
        QueueConfig::default(),
        embedding_enabled,
    )
}

fn payload(external_id: &str, texts: &[&str]) -> IngestPayload {
    IngestPayload {
        external_id: external_id.to_string(),
        source: "claude-code".to_string(),
        project_path: Some("/work/api".to_string()),
        git_branch: None,
        started_at: Utc::now(),
        ended_at: None,
        messages: texts
            .iter()
            .map(|text| IngestMessage {
                role: "user".to_string(),
                created_at: Utc::now(),
                model: Some("gpt-5".to_string()),
                tokens_in: 3,
                tokens_out: 0,
                cost_usd: 0.0,
                parts: vec![Part::text(*text)],
            })
            .collect(),
    }
}

async fn drain_queue(db: &Database, provider: &dyn EmbeddingProvider) {
    let config = QueueConfig::default();
    while queue::process_one(db, provider, &config).await.expect("step") {}
}

// ============================================================================
// Ingest
// ============================================================================

#[tokio::test]
async fn ingest_is_idempotent_on_session() {
    let db = Database::open(&temp_db_path()).await.expect("open db");
    let account = db.create_account("idp|alice").await.expect("account");
    let svc = service(&db, false);

    let first = svc
        .ingest(account.id, payload("sess-1", &["hello world"]))
        .await
        .expect("ingest");
    let second = svc
        .ingest(account.id, payload("sess-1", &["more text"]))
        .await
        .expect("ingest");

    assert_eq!(first.session_id, second.session_id);
    assert_eq!(db.count_sessions(account.id).await.expect("count"), 1);
    let messages = db.get_messages(first.session_id).await.expect("messages");
    assert_eq!(messages.len(), 2);
}

#[tokio::test]
async fn ingest_rejects_empty_external_id() {
    let db = Database::open(&temp_db_path()).await.expect("open db");
    let account = db.create_account("idp|alice").await.expect("account");
    let svc = service(&db, false);

    let err = svc
        .ingest(account.id, payload("  ", &["text"]))
        .await
        .expect_err("empty id");
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn ingest_rejects_when_queue_is_full() {
    let db = Database::open(&temp_db_path()).await.expect("open db");
    let account = db.create_account("idp|alice").await.expect("account");
    let svc = IngestService::new(
        db.clone(),
        &RedactionConfig::default(),
        QueueConfig {
            max_depth: 2,
            ..QueueConfig::default()
        },
        true,
    );

    svc.ingest(account.id, payload("sess-1", &["one", "two"]))
        .await
        .expect("ingest fills queue");

    let err = svc
        .ingest(account.id, payload("sess-2", &["three"]))
        .await
        .expect_err("queue full");
    assert!(matches!(err, Error::QueueFull(2)));
    assert!(err.is_retryable());
}

// ============================================================================
// Full-text search
// ============================================================================

#[tokio::test]
async fn fulltext_search_reads_its_writes() {
    let db = Database::open(&temp_db_path()).await.expect("open db");
    let account = db.create_account("idp|bob").await.expect("account");
    let svc = service(&db, false);

    svc.ingest(account.id, payload("sess-1", &["fixed the database migration bug"]))
        .await
        .expect("ingest");

    // No worker ran; the full-text index is synchronous with ingest.
    let engine = SearchEngine::new(
        db.clone(),
        Arc::new(DisabledProvider),
        RetrievalConfig::default(),
    );
    let hits = engine
        .search(account.id, "database migration", SearchMode::Fulltext, None)
        .await
        .expect("search");
    assert_eq!(hits.len(), 1);
    assert!(hits[0].content.contains("database migration"));
}

#[tokio::test]
async fn fulltext_search_is_account_scoped() {
    let db = Database::open(&temp_db_path()).await.expect("open db");
    let a = db.create_account("idp|a").await.expect("account");
    let b = db.create_account("idp|b").await.expect("account");
    let svc = service(&db, false);

    svc.ingest(a.id, payload("sa", &["private refactoring notes"]))
        .await
        .expect("ingest");

    let hits = fts::query(db.pool(), b.id, "refactoring notes", 10)
        .await
        .expect("query");
    assert!(hits.is_empty());
}

// ============================================================================
// Embedding queue
// ============================================================================

#[tokio::test]
async fn queue_drains_into_embeddings() {
    let db = Database::open(&temp_db_path()).await.expect("open db");
    let account = db.create_account("idp|carol").await.expect("account");
    let svc = service(&db, true);

    svc.ingest(account.id, payload("sess-1", &["login handler", "database pool"]))
        .await
        .expect("ingest");
    assert_eq!(queue::depth(db.pool()).await.expect("depth"), 2);

    drain_queue(&db, &BagOfWordsProvider).await;

    assert_eq!(queue::depth(db.pool()).await.expect("depth"), 0);
    let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM embeddings")
        .fetch_one(db.pool())
        .await
        .expect("count");
    assert_eq!(count.0, 2);
}

#[tokio::test]
async fn failed_jobs_back_off_and_eventually_die() {
    let db = Database::open(&temp_db_path()).await.expect("open db");
    let account = db.create_account("idp|dave").await.expect("account");
    let svc = service(&db, true);

    svc.ingest(account.id, payload("sess-1", &["doomed message"]))
        .await
        .expect("ingest");

    let provider = FlakyProvider {
        calls: AtomicUsize::new(0),
    };
    let config = QueueConfig {
        max_attempts: 3,
        backoff_base_secs: 3600,
        ..QueueConfig::default()
    };

    // First attempt fails and reschedules far in the future.
    assert!(queue::process_one(&db, &provider, &config).await.expect("step"));
    assert!(!queue::process_one(&db, &provider, &config).await.expect("idle"));
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

    // Force the job due again until the attempt budget runs out.
    for _ in 0..2 {
        sqlx::query("UPDATE embed_jobs SET next_attempt_at = 0 WHERE state = 'pending'")
            .execute(db.pool())
            .await
            .expect("rewind");
        queue::process_one(&db, &provider, &config).await.expect("step");
    }

    assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    let state: (String,) = sqlx::query_as("SELECT state FROM embed_jobs")
        .fetch_one(db.pool())
        .await
        .expect("state");
    assert_eq!(state.0, "dead");
    assert_eq!(queue::depth(db.pool()).await.expect("depth"), 0);
}

#[tokio::test]
async fn job_for_deleted_message_is_discarded() {
    let db = Database::open(&temp_db_path()).await.expect("open db");
    let account = db.create_account("idp|erin").await.expect("account");
    let svc = service(&db, true);

    let outcome = svc
        .ingest(account.id, payload("sess-1", &["short lived"]))
        .await
        .expect("ingest");
    db.delete_session(outcome.session_id).await.expect("delete");

    // Delete already purged the job; nothing to claim, nothing embedded.
    assert!(
        !queue::process_one(&db, &BagOfWordsProvider, &QueueConfig::default())
            .await
            .expect("step")
    );
    let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM embeddings")
        .fetch_one(db.pool())
        .await
        .expect("count");
    assert_eq!(count.0, 0);
}

#[tokio::test]
async fn stranded_in_flight_jobs_are_requeued_at_startup() {
    let db = Database::open(&temp_db_path()).await.expect("open db");
    let account = db.create_account("idp|ivan").await.expect("account");
    let svc = service(&db, true);

    svc.ingest(account.id, payload("sess-1", &["orphaned by a crash"]))
        .await
        .expect("ingest");

    // A worker claims the job and dies before finishing: the job sits in
    // in_flight, counted against the queue but invisible to claim_next.
    let claimed = queue::claim_next(db.pool(), Utc::now().timestamp())
        .await
        .expect("claim");
    assert!(claimed.is_some());
    assert!(
        !queue::process_one(&db, &BagOfWordsProvider, &QueueConfig::default())
            .await
            .expect("idle")
    );
    assert_eq!(queue::depth(db.pool()).await.expect("depth"), 1);

    // Startup recovery hands the job back to the workers.
    let requeued = queue::requeue_in_flight(db.pool()).await.expect("requeue");
    assert_eq!(requeued, 1);
    drain_queue(&db, &BagOfWordsProvider).await;

    assert_eq!(queue::depth(db.pool()).await.expect("depth"), 0);
    let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM embeddings")
        .fetch_one(db.pool())
        .await
        .expect("count");
    assert_eq!(count.0, 1);
}

#[tokio::test]
async fn job_pointing_at_missing_message_row_is_dropped() {
    let db = Database::open(&temp_db_path()).await.expect("open db");
    let account = db.create_account("idp|judy").await.expect("account");

    // A job whose message row no longer exists must not produce an
    // embedding for a ghost id.
    let missing = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO embed_jobs (message_id, session_id, account_id, state, attempts, next_attempt_at, created_at)
        VALUES (?, ?, ?, 'pending', 0, 0, 0)
        "#,
    )
    .bind(missing.to_string())
    .bind(Uuid::new_v4().to_string())
    .bind(account.id.to_string())
    .execute(db.pool())
    .await
    .expect("insert job");

    assert!(matches!(
        db.message_content(missing).await,
        Err(Error::NotFound(_))
    ));
    assert!(
        queue::process_one(&db, &BagOfWordsProvider, &QueueConfig::default())
            .await
            .expect("step")
    );

    let embeddings: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM embeddings")
        .fetch_one(db.pool())
        .await
        .expect("count");
    assert_eq!(embeddings.0, 0);
    let jobs: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM embed_jobs")
        .fetch_one(db.pool())
        .await
        .expect("count");
    assert_eq!(jobs.0, 0);
}

// ============================================================================
// Semantic and hybrid search
// ============================================================================

#[tokio::test]
async fn semantic_search_finds_similar_wording() {
    let db = Database::open(&temp_db_path()).await.expect("open db");
    let account = db.create_account("idp|frank").await.expect("account");
    let svc = service(&db, true);

    svc.ingest(
        account.id,
        payload(
            "sess-1",
            &["postgres connection pool exhausted", "css grid layout overflow"],
        ),
    )
    .await
    .expect("ingest");
    drain_queue(&db, &BagOfWordsProvider).await;

    let engine = SearchEngine::new(
        db.clone(),
        Arc::new(BagOfWordsProvider),
        RetrievalConfig::default(),
    );
    let hits = engine
        .search(account.id, "postgres pool exhausted", SearchMode::Semantic, Some(1))
        .await
        .expect("search");
    assert_eq!(hits.len(), 1);
    assert!(hits[0].content.contains("postgres connection pool"));
}

#[tokio::test]
async fn hybrid_search_fuses_both_channels() {
    let db = Database::open(&temp_db_path()).await.expect("open db");
    let account = db.create_account("idp|grace").await.expect("account");
    let svc = service(&db, true);

    svc.ingest(
        account.id,
        payload(
            "sess-1",
            &[
                "rate limiter uses a token bucket",
                "token bucket refill interval tuning",
                "unrelated frontend styling work",
            ],
        ),
    )
    .await
    .expect("ingest");
    drain_queue(&db, &BagOfWordsProvider).await;

    let engine = SearchEngine::new(
        db.clone(),
        Arc::new(BagOfWordsProvider),
        RetrievalConfig::default(),
    );
    let hits = engine
        .search(account.id, "token bucket", SearchMode::Hybrid, Some(2))
        .await
        .expect("search");
    assert_eq!(hits.len(), 2);
    for hit in &hits {
        assert!(hit.content.contains("token bucket"));
        assert!(hit.score > 0.0);
    }
}

#[tokio::test]
async fn hybrid_degrades_to_fulltext_when_provider_is_down() {
    let db = Database::open(&temp_db_path()).await.expect("open db");
    let account = db.create_account("idp|henry").await.expect("account");
    let svc = service(&db, false);

    svc.ingest(account.id, payload("sess-1", &["retry with exponential backoff"]))
        .await
        .expect("ingest");

    let engine = SearchEngine::new(
        db.clone(),
        Arc::new(DisabledProvider),
        RetrievalConfig::default(),
    );
    for mode in [SearchMode::Hybrid, SearchMode::Semantic] {
        let hits = engine
            .search(account.id, "exponential backoff", mode, None)
            .await
            .expect("search never fails on provider outage");
        assert_eq!(hits.len(), 1);
    }
}
