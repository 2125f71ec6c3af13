//! Configuration types and loading for agentlog.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::Error;
use crate::error::Result;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the agentlog database.
    pub database: PathBuf,

    /// HTTP server configuration.
    pub server: ServerConfig,

    /// Embedding provider configuration.
    pub embedding: EmbeddingConfig,

    /// Search and RAG retrieval tuning.
    pub retrieval: RetrievalConfig,

    /// Embedding work queue configuration.
    pub queue: QueueConfig,

    /// Secret redaction configuration.
    pub redaction: RedactionConfig,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(crate::APP_NAME);

        Self {
            database: data_dir.join("agentlog.db"),
            server: ServerConfig::default(),
            embedding: EmbeddingConfig::default(),
            retrieval: RetrievalConfig::default(),
            queue: QueueConfig::default(),
            redaction: RedactionConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the default config file.
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path();
        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific file.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {e}")))?;
        config.expand_paths();
        config.validate()?;
        Ok(config)
    }

    /// Get the default config file path.
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(crate::APP_NAME)
            .join("config.toml")
    }

    /// Save configuration to a specific file path.
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Ensure config exists at the given path, creating defaults if missing.
    pub fn ensure_at(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load_from_path(path)
        } else {
            let mut config = Self::default();
            config.expand_paths();
            config.save_to_path(path)?;
            Ok(config)
        }
    }

    /// Expand a path, replacing ~ with home directory.
    pub fn expand_path(path: &str) -> PathBuf {
        let expanded = shellexpand::full(path)
            .map(|v| v.into_owned())
            .unwrap_or_else(|_| path.to_string());
        PathBuf::from(expanded)
    }

    fn expand_paths(&mut self) {
        self.database = Self::expand_path(&self.database.to_string_lossy());
    }

    fn validate(&self) -> Result<()> {
        // Bad user-supplied redaction patterns are a config error, reported
        // up front so the ingest path never has to compile them.
        for pattern in &self.redaction.extra_patterns {
            regex::Regex::new(pattern).map_err(|e| {
                Error::Config(format!("invalid redaction pattern '{pattern}': {e}"))
            })?;
        }
        if self.retrieval.rrf_k <= 0.0 {
            return Err(Error::Config("retrieval.rrf_k must be positive".to_string()));
        }
        if self.queue.max_depth == 0 {
            return Err(Error::Config("queue.max_depth must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address for the API server.
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3850".to_string(),
        }
    }
}

/// Embedding provider configuration.
///
/// The provider is an external OpenAI-compatible `/v1/embeddings` endpoint.
/// With `provider = "disabled"` semantic and hybrid search degrade to
/// full-text only and the embedding queue drains nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// "openai" (OpenAI-compatible HTTP endpoint) or "disabled".
    pub provider: String,

    /// Base URL of the embeddings endpoint.
    pub endpoint: String,

    /// Model identifier sent to the provider.
    pub model: String,

    /// Expected vector dimensionality.
    pub dims: usize,

    /// Environment variable holding the provider API key.
    pub api_key_env: String,

    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            endpoint: "https://api.openai.com/v1/embeddings".to_string(),
            model: "text-embedding-3-small".to_string(),
            dims: 1536,
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_secs: 30,
        }
    }
}

impl EmbeddingConfig {
    /// Whether an embedding provider is configured.
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

/// Search and RAG retrieval tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Reciprocal Rank Fusion smoothing constant.
    pub rrf_k: f64,

    /// Candidates fetched from each channel before fusion.
    pub candidate_k: i64,

    /// Default result limit when the caller gives none.
    pub final_limit: i64,

    /// Upper bound on total characters in `format=text` context output.
    pub context_max_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            rrf_k: 60.0,
            candidate_k: 50,
            final_limit: 10,
            context_max_chars: 16_000,
        }
    }
}

/// Embedding work queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum pending + in-flight jobs before enqueue rejects.
    pub max_depth: usize,

    /// Number of background worker tasks.
    pub workers: usize,

    /// Worker poll interval in seconds when the queue is idle.
    pub poll_interval_secs: u64,

    /// Attempts before a job is moved to `dead`.
    pub max_attempts: i64,

    /// Base retry backoff in seconds (doubles per attempt).
    pub backoff_base_secs: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_depth: 10_000,
            workers: 2,
            poll_interval_secs: 5,
            max_attempts: 5,
            backoff_base_secs: 2,
        }
    }
}

/// Secret redaction configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedactionConfig {
    /// Whether redaction runs on ingest.
    pub enabled: bool,

    /// Additional regex patterns treated as secrets.
    pub extra_patterns: Vec<String>,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            extra_patterns: Vec::new(),
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
