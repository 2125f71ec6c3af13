//! agentlog-core: session transcript store and retrieval pipeline
//!
//! This crate provides the server-side core for agentlog: durable storage of
//! coding-assistant sessions pushed by CLI plugins, secret redaction on
//! write, synchronous full-text indexing, asynchronous embedding, hybrid
//! search, usage analytics, and RAG/export formatting.

pub mod analytics;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod export;
pub mod fts;
pub mod ingest;
pub mod models;
pub mod parts;
pub mod queue;
pub mod redact;
pub mod schema;
pub mod search;

pub use config::Config;
pub use db::Database;
pub use error::Error;
pub use error::Result;

/// Application name used for config directories and paths.
pub const APP_NAME: &str = "agentlog";
