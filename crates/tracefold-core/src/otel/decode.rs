//! OTLP/JSON trace export → flat list of normalized spans.

use super::attrs::{decode_attributes, AttrMap};
use crate::error::DecodeError;
use base64::Engine as _;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanEvent {
    pub name: String,
    pub time: Option<DateTime<Utc>>,
    pub attributes: AttrMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanLink {
    pub trace_id: String,
    pub span_id: String,
    pub attributes: AttrMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanStatus {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A normalized span. Only ever stored as a fragment payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: f64,
    pub status: SpanStatus,
    #[serde(default)]
    pub resource_attributes: AttrMap,
    #[serde(default)]
    pub attributes: AttrMap,
    #[serde(default)]
    pub events: Vec<SpanEvent>,
    #[serde(default)]
    pub links: Vec<SpanLink>,
}

impl Span {
    /// Span attribute, falling back to the resource attribute of the same key.
    pub fn routing_attr(&self, key: &str) -> Option<String> {
        self.attributes
            .get(key)
            .or_else(|| self.resource_attributes.get(key))
            .map(|v| v.to_text())
            .filter(|s| !s.trim().is_empty())
    }
}

/// Decode an OTLP/JSON `ExportTraceServiceRequest`.
///
/// Malformed attributes, events, links, and spans are logged and skipped.
/// Only an unparseable payload or a missing envelope is an error.
pub fn decode_export_request(payload: &[u8]) -> Result<Vec<Span>, DecodeError> {
    let root: Value = serde_json::from_slice(payload).map_err(|e| DecodeError::Payload {
        message: e.to_string(),
    })?;
    decode_export_value(&root)
}

fn decode_export_value(root: &Value) -> Result<Vec<Span>, DecodeError> {
    let resource_spans = field(root, "resourceSpans", "resource_spans")
        .and_then(Value::as_array)
        .ok_or(DecodeError::Envelope)?;

    let mut out = Vec::new();
    for rs in resource_spans {
        let resource = rs.get("resource");
        let (resource_attributes, skipped) =
            decode_attributes(resource.and_then(|r| r.get("attributes")));
        for e in skipped {
            warn!(error = %e, "skipping malformed resource attribute");
        }

        let scope_spans = field(rs, "scopeSpans", "scope_spans")
            .or_else(|| field(rs, "instrumentationLibrarySpans", "instrumentation_library_spans"))
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]);

        for ss in scope_spans {
            let scope = ss
                .get("scope")
                .or_else(|| ss.get("instrumentationLibrary"))
                .and_then(|s| s.get("name"))
                .and_then(Value::as_str)
                .map(String::from);
            let spans = ss
                .get("spans")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or(&[]);

            for raw in spans {
                match decode_span(raw, &resource_attributes, scope.as_deref()) {
                    Ok(span) => out.push(span),
                    Err(e) => warn!(error = %e, "skipping malformed span"),
                }
            }
        }
    }
    Ok(out)
}

fn decode_span(
    raw: &Value,
    resource_attributes: &AttrMap,
    scope: Option<&str>,
) -> Result<Span, DecodeError> {
    let span_id = field(raw, "spanId", "span_id")
        .and_then(Value::as_str)
        .map(decode_id)
        .transpose()?
        .filter(|s| !s.is_empty())
        .ok_or_else(|| DecodeError::Span {
            reason: "missing spanId".to_string(),
        })?;
    let trace_id = field(raw, "traceId", "trace_id")
        .and_then(Value::as_str)
        .map(decode_id)
        .transpose()?
        .unwrap_or_default();
    let parent_span_id = field(raw, "parentSpanId", "parent_span_id")
        .and_then(Value::as_str)
        .map(decode_id)
        .transpose()?
        .filter(|s| !s.is_empty());
    let name = raw
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let start_nanos = field(raw, "startTimeUnixNano", "start_time_unix_nano")
        .and_then(parse_nanos)
        .unwrap_or(0);
    let end_nanos = field(raw, "endTimeUnixNano", "end_time_unix_nano")
        .and_then(parse_nanos)
        .unwrap_or(start_nanos);
    let duration_ms = end_nanos.saturating_sub(start_nanos) as f64 / 1_000_000.0;

    let (attributes, skipped) = decode_attributes(raw.get("attributes"));
    for e in skipped {
        warn!(span_id = %span_id, error = %e, "skipping malformed span attribute");
    }

    let mut events = Vec::new();
    for ev in raw.get("events").and_then(Value::as_array).into_iter().flatten() {
        match decode_event(ev) {
            Ok(event) => events.push(event),
            Err(e) => warn!(span_id = %span_id, error = %e, "skipping malformed span event"),
        }
    }

    let mut links = Vec::new();
    for link in raw.get("links").and_then(Value::as_array).into_iter().flatten() {
        match decode_link(link) {
            Ok(l) => links.push(l),
            Err(e) => warn!(span_id = %span_id, error = %e, "skipping malformed span link"),
        }
    }

    Ok(Span {
        trace_id,
        span_id,
        parent_span_id,
        name,
        kind: raw.get("kind").map(render_kind),
        scope: scope.map(String::from),
        start_time: nanos_to_datetime(start_nanos),
        end_time: nanos_to_datetime(end_nanos),
        duration_ms,
        status: decode_status(raw.get("status")),
        resource_attributes: resource_attributes.clone(),
        attributes,
        events,
        links,
    })
}

fn decode_event(raw: &Value) -> Result<SpanEvent, DecodeError> {
    let obj = raw.as_object().ok_or_else(|| DecodeError::Event {
        reason: "event is not an object".to_string(),
    })?;
    let name = obj
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| DecodeError::Event {
            reason: "event has no name".to_string(),
        })?
        .to_string();
    let (attributes, skipped) = decode_attributes(obj.get("attributes"));
    for e in skipped {
        warn!(event = %name, error = %e, "skipping malformed event attribute");
    }
    Ok(SpanEvent {
        time: field(raw, "timeUnixNano", "time_unix_nano")
            .and_then(parse_nanos)
            .map(nanos_to_datetime),
        name,
        attributes,
    })
}

fn decode_link(raw: &Value) -> Result<SpanLink, DecodeError> {
    let id = |camel: &str, snake: &str| -> Result<String, DecodeError> {
        let value = field(raw, camel, snake)
            .and_then(Value::as_str)
            .ok_or_else(|| DecodeError::Link {
                reason: format!("missing {}", camel),
            })?;
        decode_id(value)
    };
    let trace_id = id("traceId", "trace_id")?;
    let span_id = id("spanId", "span_id")?;
    let (attributes, skipped) = decode_attributes(raw.get("attributes"));
    for e in skipped {
        warn!(link_span_id = %span_id, error = %e, "skipping malformed link attribute");
    }
    Ok(SpanLink {
        trace_id,
        span_id,
        attributes,
    })
}

fn decode_status(raw: Option<&Value>) -> SpanStatus {
    let code = raw
        .and_then(|s| s.get("code"))
        .map(|c| match c {
            Value::Number(n) => match n.as_i64() {
                Some(1) => "OK".to_string(),
                Some(2) => "ERROR".to_string(),
                _ => "UNSET".to_string(),
            },
            Value::String(s) => s
                .trim_start_matches("STATUS_CODE_")
                .to_ascii_uppercase(),
            _ => "UNSET".to_string(),
        })
        .unwrap_or_else(|| "UNSET".to_string());
    let message = raw
        .and_then(|s| s.get("message"))
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .map(String::from);
    SpanStatus { code, message }
}

fn render_kind(raw: &Value) -> String {
    match raw {
        Value::Number(n) => match n.as_i64() {
            Some(1) => "INTERNAL",
            Some(2) => "SERVER",
            Some(3) => "CLIENT",
            Some(4) => "PRODUCER",
            Some(5) => "CONSUMER",
            _ => "UNSPECIFIED",
        }
        .to_string(),
        Value::String(s) => s.trim_start_matches("SPAN_KIND_").to_ascii_uppercase(),
        _ => "UNSPECIFIED".to_string(),
    }
}

/// Normalize a trace/span id to lowercase hex.
///
/// The OTLP/JSON mapping sends hex; generic proto3 JSON sends base64 of the
/// raw bytes. Any even-length hex string is taken as hex, since most of
/// them are also valid base64.
pub fn decode_id(raw: &str) -> Result<String, DecodeError> {
    let s = raw.trim();
    if s.is_empty() {
        return Ok(String::new());
    }
    let is_hex = s.chars().all(|c| c.is_ascii_hexdigit());
    if is_hex && s.len() % 2 == 0 {
        return Ok(s.to_ascii_lowercase());
    }
    match base64::engine::general_purpose::STANDARD.decode(s) {
        Ok(bytes) if !bytes.is_empty() => Ok(hex::encode(bytes)),
        _ => Err(DecodeError::Identifier {
            value: raw.to_string(),
            reason: "neither hex nor base64".to_string(),
        }),
    }
}

fn parse_nanos(v: &Value) -> Option<u64> {
    match v {
        Value::String(s) => s.trim().parse::<u64>().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

fn nanos_to_datetime(nanos: u64) -> DateTime<Utc> {
    let secs = (nanos / 1_000_000_000) as i64;
    let sub = (nanos % 1_000_000_000) as u32;
    Utc.timestamp_opt(secs, sub)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn field<'a>(v: &'a Value, camel: &str, snake: &str) -> Option<&'a Value> {
    v.get(camel).or_else(|| v.get(snake))
}
