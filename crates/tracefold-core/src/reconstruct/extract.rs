//! Per-span message extraction.
//!
//! A span is one model call. Its prompt sequence is the conversation so far
//! and its completion sequence is the new output; both are flattened into
//! indexed attributes (`<prefix>.<i>.<field>`).

use crate::model::{ChatMessage, Role, ToolCall};
use crate::otel::attrs::{json_best_effort_str, AttrMap, AttrValue};
use crate::otel::{Span, TranscriptSemConv};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::warn;

/// Messages and run-level data carried by one span.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpanExtract {
    pub messages: Vec<ChatMessage>,
    pub run_metadata: Map<String, Value>,
    pub run_scores: Map<String, Value>,
}

pub fn extract_span(span: &Span, conv: &dyn TranscriptSemConv) -> SpanExtract {
    let mut messages = extract_sequence(span, conv.prompt_prefix(), Role::User);
    messages.extend(extract_sequence(span, conv.completion_prefix(), Role::Assistant));
    SpanExtract {
        messages,
        run_metadata: prefixed_values(&span.attributes, conv.run_metadata_prefix()),
        run_scores: prefixed_values(&span.attributes, conv.run_score_prefix()),
    }
}

#[derive(Debug, Default)]
struct RawEntry<'a> {
    fields: BTreeMap<&'a str, &'a AttrValue>,
    tool_calls: BTreeMap<usize, BTreeMap<&'a str, &'a AttrValue>>,
}

/// Indexed entries under `prefix`, in index order.
fn collect_entries<'a>(attrs: &'a AttrMap, prefix: &str) -> BTreeMap<usize, RawEntry<'a>> {
    let mut entries: BTreeMap<usize, RawEntry<'a>> = BTreeMap::new();
    let dotted = format!("{}.", prefix);
    for (key, value) in attrs.range(dotted.clone()..) {
        let Some(rest) = key.strip_prefix(&dotted) else {
            break;
        };
        let Some((index, field)) = rest.split_once('.') else {
            continue;
        };
        let Ok(index) = index.parse::<usize>() else {
            continue;
        };
        let entry = entries.entry(index).or_default();
        if let Some(call) = field.strip_prefix("tool_calls.") {
            if let Some((j, call_field)) = call.split_once('.') {
                if let Ok(j) = j.parse::<usize>() {
                    entry
                        .tool_calls
                        .entry(j)
                        .or_default()
                        .insert(call_field, value);
                }
            }
            continue;
        }
        entry.fields.insert(field, value);
    }
    entries
}

fn extract_sequence(span: &Span, prefix: &str, default_role: Role) -> Vec<ChatMessage> {
    let mut out = Vec::new();
    let mut pending_reasoning: Vec<String> = Vec::new();

    for (index, entry) in collect_entries(&span.attributes, prefix) {
        let role_text = text_field(&entry, "role");
        let kind_text = text_field(&entry, "type");
        let parts = entry
            .fields
            .get("content")
            .map(|v| parse_content(v))
            .unwrap_or_default();
        if parts.blocks_without_id > 0 {
            warn!(
                span_id = %span.span_id,
                index,
                skipped = parts.blocks_without_id,
                "skipping tool content blocks without an id"
            );
        }

        if is_reasoning_marker(role_text.as_deref()) || is_reasoning_marker(kind_text.as_deref()) {
            pending_reasoning.extend(parts.reasoning);
            if !parts.text.is_empty() {
                pending_reasoning.push(parts.text);
            }
            pending_reasoning.extend(text_field(&entry, "reasoning"));
            continue;
        }

        let role = match role_text.as_deref() {
            None => default_role,
            Some(r) => Role::parse(r).unwrap_or_else(|| {
                warn!(span_id = %span.span_id, index, role = r, "unknown message role");
                default_role
            }),
        };

        // Results embedded as content blocks precede the message that carried them.
        for (id, text) in parts.tool_results {
            out.push(ChatMessage::tool_result(id, text));
        }

        let mut message = ChatMessage::new(role, parts.text);
        message.tool_call_id = text_field(&entry, "tool_call_id");
        for call in structured_tool_calls(span, index, &entry).into_iter().chain(parts.tool_calls) {
            if !message.tool_calls.iter().any(|c| c.id == call.id) {
                message.tool_calls.push(call);
            }
        }

        pending_reasoning.extend(parts.reasoning);
        pending_reasoning.extend(text_field(&entry, "reasoning"));
        if !pending_reasoning.is_empty() {
            message.reasoning = Some(pending_reasoning.join("\n"));
            pending_reasoning.clear();
        }

        let carried_only_results = role != Role::Tool
            && message.content.is_empty()
            && message.tool_calls.is_empty()
            && message.reasoning.is_none()
            && out.last().is_some_and(|m: &ChatMessage| m.role == Role::Tool);
        if !carried_only_results {
            out.push(message);
        }
    }

    if !pending_reasoning.is_empty() {
        let mut message = ChatMessage::new(Role::Assistant, "");
        message.reasoning = Some(pending_reasoning.join("\n"));
        out.push(message);
    }
    out
}

fn is_reasoning_marker(value: Option<&str>) -> bool {
    matches!(
        value.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("reasoning" | "thinking")
    )
}

fn text_field(entry: &RawEntry<'_>, field: &str) -> Option<String> {
    entry
        .fields
        .get(field)
        .map(|v| v.to_text())
        .filter(|s| !s.is_empty())
}

fn structured_tool_calls(span: &Span, index: usize, entry: &RawEntry<'_>) -> Vec<ToolCall> {
    entry
        .tool_calls
        .iter()
        .filter_map(|(call_index, fields)| {
            let Some(id) = fields.get("id").map(|v| v.to_text()).filter(|id| !id.is_empty()) else {
                warn!(
                    span_id = %span.span_id,
                    index,
                    call_index,
                    "skipping tool call without an id"
                );
                return None;
            };
            let name = fields.get("name").map(|v| v.to_text()).unwrap_or_default();
            let arguments = fields
                .get("arguments")
                .map(|v| match v {
                    AttrValue::String(s) => json_best_effort_str(s),
                    other => other.to_json(),
                })
                .unwrap_or(Value::Null);
            Some(ToolCall {
                id,
                name,
                arguments,
            })
        })
        .collect()
}

/// Message content after unpacking any inline content blocks.
#[derive(Debug, Default, PartialEq)]
struct ContentParts {
    text: String,
    tool_calls: Vec<ToolCall>,
    reasoning: Vec<String>,
    tool_results: Vec<(String, String)>,
    blocks_without_id: usize,
}

fn parse_content(value: &AttrValue) -> ContentParts {
    let blocks = match value {
        AttrValue::String(s) => match json_best_effort_str(s) {
            Value::Array(items) if is_block_list(&items) => items,
            _ => {
                return ContentParts {
                    text: s.clone(),
                    ..ContentParts::default()
                }
            }
        },
        other => match other.to_json() {
            Value::Array(items) if is_block_list(&items) => items,
            json => {
                return ContentParts {
                    text: json.to_string(),
                    ..ContentParts::default()
                }
            }
        },
    };

    let mut parts = ContentParts::default();
    let mut texts = Vec::new();
    for block in &blocks {
        let kind = block.get("type").and_then(Value::as_str).unwrap_or_default();
        match kind {
            "text" => texts.extend(block_str(block, "text")),
            "thinking" | "reasoning" => parts.reasoning.extend(
                block_str(block, "thinking")
                    .or_else(|| block_str(block, "reasoning"))
                    .or_else(|| block_str(block, "text")),
            ),
            "tool_use" => {
                match block_str(block, "id") {
                    Some(id) => parts.tool_calls.push(ToolCall {
                        id,
                        name: block_str(block, "name").unwrap_or_default(),
                        arguments: block.get("input").cloned().unwrap_or(Value::Null),
                    }),
                    None => parts.blocks_without_id += 1,
                }
            }
            "tool_result" => {
                match block_str(block, "tool_use_id") {
                    Some(id) => {
                        let text = block.get("content").map(result_text).unwrap_or_default();
                        parts.tool_results.push((id, text));
                    }
                    None => parts.blocks_without_id += 1,
                }
            }
            _ => {}
        }
    }
    parts.text = texts.join("\n");
    parts
}

fn is_block_list(items: &[Value]) -> bool {
    !items.is_empty()
        && items
            .iter()
            .all(|item| item.get("type").and_then(Value::as_str).is_some())
}

fn block_str(block: &Value, field: &str) -> Option<String> {
    block.get(field).and_then(Value::as_str).map(String::from)
}

fn result_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn prefixed_values(attrs: &AttrMap, prefix: &str) -> Map<String, Value> {
    let dotted = format!("{}.", prefix);
    attrs
        .iter()
        .filter_map(|(key, value)| {
            let name = key.strip_prefix(&dotted)?;
            let json = match value {
                AttrValue::String(s) => json_best_effort_str(s),
                other => other.to_json(),
            };
            Some((name.to_string(), json))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::otel::attrs::AttrValue;
    use crate::otel::{IndexedGenAi, SpanStatus};
    use chrono::Utc;
    use serde_json::json;

    fn span(attrs: &[(&str, &str)]) -> Span {
        Span {
            trace_id: "t".into(),
            span_id: "s".into(),
            parent_span_id: None,
            name: "chat".into(),
            kind: None,
            scope: None,
            start_time: Utc::now(),
            end_time: Utc::now(),
            duration_ms: 0.0,
            status: SpanStatus {
                code: "UNSET".into(),
                message: None,
            },
            resource_attributes: AttrMap::new(),
            attributes: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), AttrValue::String(v.to_string())))
                .collect(),
            events: vec![],
            links: vec![],
        }
    }

    #[test]
    fn prompt_and_completion_in_index_order() {
        let s = span(&[
            ("gen_ai.prompt.1.role", "user"),
            ("gen_ai.prompt.1.content", "hi"),
            ("gen_ai.prompt.0.role", "system"),
            ("gen_ai.prompt.0.content", "be brief"),
            ("gen_ai.completion.0.content", "hello"),
        ]);
        let out = extract_span(&s, &IndexedGenAi);
        let roles: Vec<_> = out.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant]);
        assert_eq!(out.messages[2].content, "hello");
    }

    #[test]
    fn structured_and_inline_tool_calls_normalize_the_same() {
        let structured = span(&[
            ("gen_ai.completion.0.role", "assistant"),
            ("gen_ai.completion.0.tool_calls.0.id", "42"),
            ("gen_ai.completion.0.tool_calls.0.name", "search"),
            ("gen_ai.completion.0.tool_calls.0.arguments", r#"{"q":"rust"}"#),
        ]);
        let inline = span(&[
            ("gen_ai.completion.0.role", "assistant"),
            (
                "gen_ai.completion.0.content",
                r#"[{"type":"tool_use","id":"42","name":"search","input":{"q":"rust"}}]"#,
            ),
        ]);
        let a = extract_span(&structured, &IndexedGenAi).messages;
        let b = extract_span(&inline, &IndexedGenAi).messages;
        assert_eq!(a, b);
        assert_eq!(a[0].tool_calls[0].arguments, json!({"q": "rust"}));
    }

    #[test]
    fn reasoning_completion_folds_into_next_message() {
        let s = span(&[
            ("gen_ai.completion.0.role", "reasoning"),
            ("gen_ai.completion.0.content", "think first"),
            ("gen_ai.completion.1.content", "answer"),
            ("gen_ai.completion.2.type", "thinking"),
            ("gen_ai.completion.2.content", "trailing"),
        ]);
        let messages = extract_span(&s, &IndexedGenAi).messages;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "answer");
        assert_eq!(messages[0].reasoning.as_deref(), Some("think first"));
        assert_eq!(messages[1].content, "");
        assert_eq!(messages[1].reasoning.as_deref(), Some("trailing"));
    }

    #[test]
    fn tool_result_blocks_become_tool_messages() {
        let s = span(&[
            ("gen_ai.prompt.0.role", "user"),
            (
                "gen_ai.prompt.0.content",
                r#"[{"type":"tool_result","tool_use_id":"42","content":[{"type":"text","text":"found"}]}]"#,
            ),
        ]);
        let messages = extract_span(&s, &IndexedGenAi).messages;
        assert_eq!(messages, vec![ChatMessage::tool_result("42", "found")]);
    }

    #[test]
    fn tool_calls_without_id_are_skipped() {
        let s = span(&[
            ("gen_ai.completion.0.role", "assistant"),
            ("gen_ai.completion.0.content", r#"[{"type":"text","text":"calling"},{"type":"tool_use","name":"nameless"}]"#),
            ("gen_ai.completion.0.tool_calls.0.name", "no_id"),
            ("gen_ai.completion.0.tool_calls.1.id", "7"),
            ("gen_ai.completion.0.tool_calls.1.name", "lookup"),
        ]);
        let messages = extract_span(&s, &IndexedGenAi).messages;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "calling");
        let ids: Vec<_> = messages[0].tool_calls.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["7"]);
    }

    #[test]
    fn plain_json_looking_text_stays_text() {
        let s = span(&[("gen_ai.completion.0.content", "[1, 2, 3]")]);
        let messages = extract_span(&s, &IndexedGenAi).messages;
        assert_eq!(messages[0].content, "[1, 2, 3]");
    }

    #[test]
    fn run_scores_and_metadata_from_attributes() {
        let s = span(&[
            ("agent_run.score.accuracy", "0.75"),
            ("agent_run.metadata.model", "gpt-4o"),
        ]);
        let out = extract_span(&s, &IndexedGenAi);
        assert_eq!(out.run_scores["accuracy"], json!(0.75));
        assert_eq!(out.run_metadata["model"], json!("gpt-4o"));
        assert!(out.messages.is_empty());
    }
}
