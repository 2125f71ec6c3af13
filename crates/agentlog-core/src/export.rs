//! Context assembly and session export.
//!
//! Pure formatting over already-retrieved data. Context output feeds an
//! agent prompt, so the text form is header + body blocks with a hard
//! character budget; exports produce Markdown for humans, JSON for tools,
//! and JSONL with one message record per line for eval and fine-tuning
//! pipelines.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{Error, Result};
use crate::models::{SearchHit, SessionWithMessages};
use crate::parts;

/// Output shape for context assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextFormat {
    #[default]
    Text,
    Messages,
}

/// Output shape for whole-session export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Json,
    Markdown,
    Jsonl,
}

impl ExportFormat {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "markdown" | "md" => Ok(ExportFormat::Markdown),
            "jsonl" => Ok(ExportFormat::Jsonl),
            other => Err(Error::Validation(format!(
                "unknown export format '{other}' (expected json, markdown, or jsonl)"
            ))),
        }
    }
}

/// Assembled context, either one text block or structured hits.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ContextOutput {
    Text { context: String, hits: usize },
    Messages { hits: Vec<SearchHit> },
}

/// Build context from ranked hits.
///
/// Text output concatenates one block per hit: a header line naming the
/// source tool, project, and timestamp, then the message body. Blocks are
/// appended until the next one would exceed `max_chars`; a partial block
/// is never emitted.
pub fn format_context(
    hits: Vec<SearchHit>,
    format: ContextFormat,
    max_chars: usize,
) -> ContextOutput {
    match format {
        ContextFormat::Messages => ContextOutput::Messages { hits },
        ContextFormat::Text => {
            let mut out = String::new();
            let mut included = 0usize;
            for hit in &hits {
                let header = format!(
                    "--- [{}] {} | {} ---\n",
                    hit.source,
                    hit.project_path.as_deref().unwrap_or("-"),
                    hit.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
                );
                let block_len = header.len() + hit.content.len() + 2;
                if !out.is_empty() && out.len() + block_len > max_chars {
                    break;
                }
                out.push_str(&header);
                out.push_str(&hit.content);
                out.push_str("\n\n");
                included += 1;
                if out.len() >= max_chars {
                    break;
                }
            }
            ContextOutput::Text {
                context: out.trim_end().to_string(),
                hits: included,
            }
        }
    }
}

/// Export a full session in the requested format.
pub fn export_session(session: &SessionWithMessages, format: ExportFormat) -> Result<String> {
    match format {
        ExportFormat::Json => {
            serde_json::to_string_pretty(session).map_err(Error::from)
        }
        ExportFormat::Markdown => Ok(to_markdown(session)),
        ExportFormat::Jsonl => to_jsonl(session),
    }
}

fn to_markdown(session: &SessionWithMessages) -> String {
    let s = &session.session;
    let mut out = String::new();
    out.push_str(&format!("# Session {}\n\n", s.external_id));
    out.push_str(&format!("- **Source:** {}\n", s.source));
    if let Some(project) = &s.project_path {
        out.push_str(&format!("- **Project:** {project}\n"));
    }
    if let Some(branch) = &s.git_branch {
        out.push_str(&format!("- **Branch:** {branch}\n"));
    }
    out.push_str(&format!(
        "- **Started:** {}\n",
        s.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    if let Some(ended) = s.ended_at {
        out.push_str(&format!(
            "- **Ended:** {}\n",
            ended.format("%Y-%m-%d %H:%M:%S UTC")
        ));
    }
    out.push_str(&format!(
        "- **Tokens:** {} in / {} out\n- **Cost:** ${:.4}\n\n",
        s.tokens_in, s.tokens_out, s.cost_usd
    ));

    for message in &session.messages {
        out.push_str(&format!("## {} ({})\n\n", message.role, message.ordinal));
        for part in &message.parts {
            match part {
                crate::parts::Part::Text { text } => {
                    out.push_str(text);
                    out.push_str("\n\n");
                }
                crate::parts::Part::Reasoning { text } => {
                    out.push_str("> ");
                    out.push_str(&text.replace('\n', "\n> "));
                    out.push_str("\n\n");
                }
                crate::parts::Part::ToolCall { name, input, .. } => {
                    out.push_str(&format!("**Tool call:** `{name}`\n\n"));
                    if let Some(input) = input {
                        out.push_str("```json\n");
                        out.push_str(
                            &serde_json::to_string_pretty(input).unwrap_or_default(),
                        );
                        out.push_str("\n```\n\n");
                    }
                }
                crate::parts::Part::ToolResult {
                    output, is_error, ..
                } => {
                    let label = if *is_error { "Tool error" } else { "Tool result" };
                    out.push_str(&format!("**{label}:**\n\n"));
                    if let Some(output) = output {
                        out.push_str("```json\n");
                        out.push_str(
                            &serde_json::to_string_pretty(output).unwrap_or_default(),
                        );
                        out.push_str("\n```\n\n");
                    }
                }
            }
        }
    }
    out
}

/// One JSON record per message, session metadata repeated on each line so
/// every record stands alone.
fn to_jsonl(session: &SessionWithMessages) -> Result<String> {
    let s = &session.session;
    let mut lines = Vec::with_capacity(session.messages.len());
    for message in &session.messages {
        let record = json!({
            "session_id": s.id,
            "external_id": s.external_id,
            "source": s.source,
            "project_path": s.project_path,
            "ordinal": message.ordinal,
            "role": message.role,
            "created_at": message.created_at,
            "model": message.model,
            "content": parts::joined_text(&message.parts),
            "parts": message.parts,
        });
        lines.push(serde_json::to_string(&record)?);
    }
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::models::{Message, MessageRole, Session, SessionSource};
    use crate::parts::Part;

    fn hit(content: &str, project: Option<&str>) -> SearchHit {
        SearchHit {
            message_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            ordinal: 0,
            role: MessageRole::Assistant,
            content: content.to_string(),
            created_at: Utc::now(),
            source: SessionSource::ClaudeCode,
            project_path: project.map(str::to_string),
            score: 1.0,
        }
    }

    fn sample_session() -> SessionWithMessages {
        let session_id = Uuid::new_v4();
        SessionWithMessages {
            session: Session {
                id: session_id,
                account_id: Uuid::new_v4(),
                external_id: "sess-42".to_string(),
                source: SessionSource::Codex,
                project_path: Some("/work/api".to_string()),
                git_branch: Some("main".to_string()),
                started_at: Utc::now(),
                ended_at: None,
                tokens_in: 100,
                tokens_out: 250,
                cost_usd: 0.0123,
                eval_ready: false,
            },
            messages: vec![
                Message {
                    id: Uuid::new_v4(),
                    session_id,
                    ordinal: 0,
                    role: MessageRole::User,
                    created_at: Utc::now(),
                    model: None,
                    tokens_in: 10,
                    tokens_out: 0,
                    cost_usd: 0.0,
                    needs_audit: false,
                    parts: vec![Part::text("fix the login bug")],
                },
                Message {
                    id: Uuid::new_v4(),
                    session_id,
                    ordinal: 1,
                    role: MessageRole::Assistant,
                    created_at: Utc::now(),
                    model: Some("gpt-5".to_string()),
                    tokens_in: 90,
                    tokens_out: 250,
                    cost_usd: 0.0123,
                    needs_audit: false,
                    parts: vec![
                        Part::tool_call("call_1", "read_file", Some(json!({"path": "auth.rs"}))),
                        Part::text("The null check was inverted."),
                    ],
                },
            ],
        }
    }

    #[test]
    fn text_context_has_headers_and_bodies() {
        let hits = vec![hit("first answer", Some("/work/api")), hit("second", None)];
        let out = format_context(hits, ContextFormat::Text, 16_000);
        let ContextOutput::Text { context, hits } = out else {
            panic!("expected text output");
        };
        assert_eq!(hits, 2);
        assert!(context.contains("[claude-code] /work/api"));
        assert!(context.contains("first answer"));
        assert!(context.contains("second"));
    }

    #[test]
    fn text_context_respects_char_budget() {
        let hits = vec![hit(&"x".repeat(300), None), hit(&"y".repeat(300), None)];
        let out = format_context(hits, ContextFormat::Text, 400);
        let ContextOutput::Text { context, hits } = out else {
            panic!("expected text output");
        };
        assert_eq!(hits, 1);
        assert!(context.contains('x'));
        assert!(!context.contains('y'));
    }

    #[test]
    fn text_context_always_includes_first_hit() {
        // A budget smaller than the first block still yields one block; an
        // empty context would be useless.
        let hits = vec![hit(&"z".repeat(500), None)];
        let out = format_context(hits, ContextFormat::Text, 100);
        let ContextOutput::Text { hits, .. } = out else {
            panic!("expected text output");
        };
        assert_eq!(hits, 1);
    }

    #[test]
    fn messages_context_passes_hits_through() {
        let out = format_context(vec![hit("a", None)], ContextFormat::Messages, 10);
        let ContextOutput::Messages { hits } = out else {
            panic!("expected messages output");
        };
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "a");
    }

    #[test]
    fn markdown_export_includes_metadata_and_tools() {
        let md = export_session(&sample_session(), ExportFormat::Markdown).expect("export");
        assert!(md.contains("# Session sess-42"));
        assert!(md.contains("**Source:** codex"));
        assert!(md.contains("**Tool call:** `read_file`"));
        assert!(md.contains("fix the login bug"));
    }

    #[test]
    fn jsonl_export_one_record_per_message() {
        let jsonl = export_session(&sample_session(), ExportFormat::Jsonl).expect("export");
        let lines: Vec<&str> = jsonl.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in &lines {
            let record: serde_json::Value = serde_json::from_str(line).expect("valid json");
            assert_eq!(record["external_id"], "sess-42");
            assert!(record["ordinal"].is_i64());
        }
        let second: serde_json::Value = serde_json::from_str(lines[1]).expect("valid json");
        let content = second["content"].as_str().expect("content");
        assert!(content.contains("The null check was inverted."));
    }

    #[test]
    fn json_export_roundtrips() {
        let session = sample_session();
        let out = export_session(&session, ExportFormat::Json).expect("export");
        let back: SessionWithMessages = serde_json::from_str(&out).expect("parse");
        assert_eq!(back.session.external_id, "sess-42");
        assert_eq!(back.messages.len(), 2);
    }

    #[test]
    fn export_format_parses_aliases() {
        assert_eq!(ExportFormat::parse("md").expect("md"), ExportFormat::Markdown);
        assert_eq!(ExportFormat::parse("JSONL").expect("jsonl"), ExportFormat::Jsonl);
        assert!(ExportFormat::parse("csv").is_err());
    }
}
