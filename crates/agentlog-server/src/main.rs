use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{FromRequestParts, Query, State};
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use agentlog_core::config::Config;
use agentlog_core::db::Database;
use agentlog_core::embedding;
use agentlog_core::error::Error;
use agentlog_core::export::{self, ContextFormat, ExportFormat};
use agentlog_core::ingest::{IngestPayload, IngestService};
use agentlog_core::models::Account;
use agentlog_core::search::{SearchEngine, SearchMode};
use agentlog_core::{analytics, queue};

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn try_main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config_path = cli
        .common
        .config
        .unwrap_or_else(Config::default_config_path);
    let config = Config::ensure_at(&config_path)?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config, cli.common.bind).await,
        Commands::CreateAccount { subject } => create_account(config, &subject).await,
    }
}

async fn serve(config: Config, bind_override: Option<String>) -> Result<()> {
    let db = Database::open(&config.database).await?;

    let provider: Arc<dyn embedding::EmbeddingProvider> =
        Arc::from(embedding::create_provider(&config.embedding)?);
    let embedding_enabled = config.embedding.is_enabled();

    if embedding_enabled {
        // Jobs a previous process claimed but never finished.
        queue::requeue_in_flight(db.pool()).await?;
        for worker_id in 0..config.queue.workers.max(1) {
            tokio::spawn(queue::run_worker(
                db.clone(),
                provider.clone(),
                config.queue.clone(),
                worker_id,
            ));
        }
    }

    let state = AppState {
        db: db.clone(),
        search: Arc::new(SearchEngine::new(
            db.clone(),
            provider,
            config.retrieval.clone(),
        )),
        ingest: IngestService::new(
            db,
            &config.redaction,
            config.queue.clone(),
            embedding_enabled,
        ),
        max_context_chars: config.retrieval.context_max_chars,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/api/sessions", get(list_sessions).delete(delete_session))
        .route("/api/sessions/get", get(get_session))
        .route("/api/sessions/eval_ready", post(set_eval_ready))
        .route("/api/search", get(search))
        .route("/api/context", get(context))
        .route("/api/export", get(export_session))
        .route("/api/stats", get(stats))
        .route("/api/ingest", post(ingest))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let bind = bind_override.unwrap_or(config.server.bind);
    let addr: SocketAddr = bind.parse()?;
    info!("starting API server on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Mint an account and its first API key. The plaintext key is printed
/// once and never recoverable afterwards.
async fn create_account(config: Config, subject: &str) -> Result<()> {
    let db = Database::open(&config.database).await?;
    let account = match db.get_account_by_subject(subject).await? {
        Some(existing) => existing,
        None => db.create_account(subject).await?,
    };
    let (_, token) = db.create_api_key(account.id).await?;
    let mut stdout = io::stdout();
    writeln!(stdout, "account: {}", account.id)?;
    writeln!(stdout, "api key: {token}")?;
    Ok(())
}

#[derive(Debug, Parser)]
#[command(author, version, about = "Session transcript store and search server")]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override the bind address, e.g. 0.0.0.0:3850
    #[arg(long, value_name = "ADDR")]
    bind: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP server (default)
    Serve,
    /// Create an account (or reuse one) and print a fresh API key
    CreateAccount {
        /// External identity subject the account is keyed by
        #[arg(long)]
        subject: String,
    },
}

#[derive(Clone)]
struct AppState {
    db: Database,
    search: Arc<SearchEngine>,
    ingest: IngestService,
    max_context_chars: usize,
}

/// Error half of the response envelope.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "validation",
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "not_found",
            message: message.into(),
        }
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: "auth",
            message: message.into(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let (status, code) = match &err {
            Error::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
            Error::Auth(_) => (StatusCode::UNAUTHORIZED, "auth"),
            Error::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            Error::Conflict(_) => (StatusCode::SERVICE_UNAVAILABLE, "conflict"),
            Error::QueueFull(_) => (StatusCode::SERVICE_UNAVAILABLE, "queue_full"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %err, "request failed");
        }
        Self {
            status,
            code,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "ok": false,
            "error": { "code": self.code, "message": self.message },
        });
        (self.status, Json(body)).into_response()
    }
}

fn ok<T: Serialize>(data: T) -> Json<serde_json::Value> {
    Json(json!({ "ok": true, "data": data }))
}

/// Authenticated caller, resolved from the bearer API key.
struct Authed(Account);

impl FromRequestParts<AppState> for Authed {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::unauthorized("missing Authorization header"))?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| ApiError::unauthorized("expected Bearer token"))?;

        match state.db.resolve_api_key(token).await? {
            Some(account) => Ok(Authed(account)),
            None => Err(ApiError::unauthorized("unknown or revoked API key")),
        }
    }
}

#[derive(Serialize)]
struct RootResponse {
    name: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn root() -> Json<RootResponse> {
    Json(RootResponse {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<i64>,
}

async fn list_sessions(
    State(state): State<AppState>,
    Authed(account): Authed,
    Query(params): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let limit = params.limit.unwrap_or(50).clamp(1, 500);
    let sessions = state.db.list_sessions(account.id, limit).await?;
    Ok(ok(sessions))
}

#[derive(Debug, Deserialize)]
struct IdQuery {
    id: Uuid,
}

async fn get_session(
    State(state): State<AppState>,
    Authed(account): Authed,
    Query(params): Query<IdQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = state
        .db
        .get_session_with_messages(account.id, params.id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("session '{}'", params.id)))?;
    Ok(ok(session))
}

async fn delete_session(
    State(state): State<AppState>,
    Authed(account): Authed,
    Query(params): Query<IdQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    // Ownership check before touching anything.
    if state.db.get_session(account.id, params.id).await?.is_none() {
        return Err(ApiError::not_found(format!("session '{}'", params.id)));
    }
    state.db.delete_session(params.id).await?;
    Ok(ok(json!({ "deleted": params.id })))
}

#[derive(Debug, Deserialize)]
struct EvalReadyBody {
    id: Uuid,
    value: bool,
}

async fn set_eval_ready(
    State(state): State<AppState>,
    Authed(account): Authed,
    Json(body): Json<EvalReadyBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if state.db.get_session(account.id, body.id).await?.is_none() {
        return Err(ApiError::not_found(format!("session '{}'", body.id)));
    }
    state.db.set_eval_ready(body.id, body.value).await?;
    Ok(ok(json!({ "id": body.id, "eval_ready": body.value })))
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    q: Option<String>,
    #[serde(rename = "type")]
    mode: Option<String>,
    limit: Option<i64>,
}

fn parse_mode(mode: Option<&str>) -> Result<SearchMode, ApiError> {
    match mode {
        None | Some("hybrid") => Ok(SearchMode::Hybrid),
        Some("fulltext") => Ok(SearchMode::Fulltext),
        Some("semantic") => Ok(SearchMode::Semantic),
        Some(other) => Err(ApiError::bad_request(format!(
            "unknown search type '{other}' (expected fulltext, semantic, or hybrid)"
        ))),
    }
}

async fn search(
    State(state): State<AppState>,
    Authed(account): Authed,
    Query(params): Query<SearchQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let query = params
        .q
        .filter(|q| !q.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("missing query parameter 'q'"))?;
    let mode = parse_mode(params.mode.as_deref())?;
    let hits = state
        .search
        .search(account.id, &query, mode, params.limit)
        .await?;
    Ok(ok(hits))
}

#[derive(Debug, Deserialize)]
struct ContextQuery {
    q: Option<String>,
    format: Option<String>,
    limit: Option<i64>,
}

async fn context(
    State(state): State<AppState>,
    Authed(account): Authed,
    Query(params): Query<ContextQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let query = params
        .q
        .filter(|q| !q.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("missing query parameter 'q'"))?;
    let format = match params.format.as_deref() {
        None | Some("text") => ContextFormat::Text,
        Some("messages") => ContextFormat::Messages,
        Some(other) => {
            return Err(ApiError::bad_request(format!(
                "unknown context format '{other}' (expected text or messages)"
            )));
        }
    };

    let hits = state
        .search
        .search(account.id, &query, SearchMode::Hybrid, params.limit)
        .await?;
    let output = export::format_context(hits, format, state.max_context_chars);
    Ok(ok(output))
}

#[derive(Debug, Deserialize)]
struct ExportQuery {
    id: Uuid,
    format: Option<String>,
}

async fn export_session(
    State(state): State<AppState>,
    Authed(account): Authed,
    Query(params): Query<ExportQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let format = match params.format.as_deref() {
        None => ExportFormat::Json,
        Some(s) => ExportFormat::parse(s)?,
    };
    let session = state
        .db
        .get_session_with_messages(account.id, params.id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("session '{}'", params.id)))?;
    let content = export::export_session(&session, format)?;
    Ok(ok(json!({ "id": params.id, "content": content })))
}

#[derive(Debug, Deserialize)]
struct StatsQuery {
    range: Option<String>,
}

/// Parse a stats range like `7d` or `30d` into a day-bucket lower bound.
fn parse_range(range: Option<&str>) -> Result<Option<String>, ApiError> {
    match range {
        None | Some("all") => Ok(None),
        Some(s) => {
            let days: i64 = s
                .strip_suffix('d')
                .and_then(|n| n.parse().ok())
                .filter(|n| *n > 0)
                .ok_or_else(|| {
                    ApiError::bad_request(format!(
                        "invalid range '{s}' (expected e.g. 7d, 30d, or all)"
                    ))
                })?;
            let since = chrono::Utc::now() - chrono::Duration::days(days - 1);
            Ok(Some(analytics::day_bucket(since)))
        }
    }
}

async fn stats(
    State(state): State<AppState>,
    Authed(account): Authed,
    Query(params): Query<StatsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let since_day = parse_range(params.range.as_deref())?;
    let summary =
        analytics::query_stats(state.db.pool(), account.id, since_day.as_deref()).await?;
    Ok(ok(summary))
}

async fn ingest(
    State(state): State<AppState>,
    Authed(account): Authed,
    Json(payload): Json<IngestPayload>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let outcome = state.ingest.ingest(account.id, payload).await?;
    Ok(ok(outcome))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_parses_day_suffix() {
        assert!(parse_range(Some("7d")).expect("7d").is_some());
        assert!(parse_range(Some("all")).expect("all").is_none());
        assert!(parse_range(None).expect("none").is_none());
        assert!(parse_range(Some("week")).is_err());
        assert!(parse_range(Some("0d")).is_err());
    }

    #[test]
    fn mode_parses_known_types() {
        assert_eq!(parse_mode(None).expect("default"), SearchMode::Hybrid);
        assert_eq!(
            parse_mode(Some("fulltext")).expect("fulltext"),
            SearchMode::Fulltext
        );
        assert!(parse_mode(Some("fuzzy")).is_err());
    }
}
