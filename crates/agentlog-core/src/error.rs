//! Error types for agentlog-core

use thiserror::Error;

/// Core library error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Unauthorized: {0}")]
    Auth(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Embedding provider error: {0}")]
    Upstream(String),

    #[error("Write conflict after retries: {0}")]
    Conflict(String),

    #[error("Embedding queue is full (depth {0})")]
    QueueFull(usize),
}

impl Error {
    /// True for errors the caller may safely retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Conflict(_) | Error::QueueFull(_))
    }
}

/// Result type alias using Error.
pub type Result<T> = std::result::Result<T, Error>;
