//! Typed message parts for structured content.
//!
//! This module defines the canonical `Part` enum stored per message. CLI
//! plugins serialize parts to this format in ingest payloads; text fields
//! hold post-redaction content once stored.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A content part within a message.
///
/// Messages contain a list of parts representing the different content
/// kinds a transcript carries: plain text, reasoning, tool calls and their
/// results.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    /// Plain text or markdown content.
    Text { text: String },

    /// Reasoning content (chain-of-thought).
    Reasoning { text: String },

    /// A tool call (request to execute a tool).
    ToolCall {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
    },

    /// A tool result (output from executing a tool).
    ToolResult {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
        #[serde(rename = "isError", default)]
        is_error: bool,
    },
}

impl Part {
    /// Create a text part.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Create a reasoning part.
    pub fn reasoning(text: impl Into<String>) -> Self {
        Self::Reasoning { text: text.into() }
    }

    /// Create a tool call part.
    pub fn tool_call(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        input: Option<Value>,
    ) -> Self {
        Self::ToolCall {
            tool_call_id: tool_call_id.into(),
            name: name.into(),
            input,
        }
    }

    /// Create a tool result part.
    pub fn tool_result(tool_call_id: impl Into<String>, output: Option<Value>, is_error: bool) -> Self {
        Self::ToolResult {
            tool_call_id: tool_call_id.into(),
            output,
            is_error,
        }
    }

    /// Stored kind tag, matching the serde tag values.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Reasoning { .. } => "reasoning",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
        }
    }

    /// Extract the indexable text content from this part.
    pub fn text_content(&self) -> Option<String> {
        match self {
            Self::Text { text } | Self::Reasoning { text } => Some(text.clone()),
            Self::ToolResult { output, .. } => output.as_ref().map(value_to_text),
            Self::ToolCall { input, .. } => input.as_ref().map(value_to_text),
        }
    }
}

/// Flatten a JSON payload into searchable text.
fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Concatenate all textual content of a message's parts.
pub fn joined_text(parts: &[Part]) -> String {
    let texts: Vec<String> = parts.iter().filter_map(Part::text_content).collect();
    texts.join("\n")
}
