//! Typed attribute values.

use crate::error::DecodeError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A decoded OTLP `AnyValue`.
///
/// Serializes as plain JSON so stored span payloads stay readable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<AttrValue>),
    Map(BTreeMap<String, AttrValue>),
}

pub type AttrMap = BTreeMap<String, AttrValue>;

impl AttrValue {
    /// Lossy text rendering: strings verbatim, everything else as JSON.
    pub fn to_text(&self) -> String {
        match self {
            AttrValue::String(s) => s.clone(),
            other => other.to_json().to_string(),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            AttrValue::Bool(b) => Value::Bool(*b),
            AttrValue::Int(i) => Value::from(*i),
            AttrValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            AttrValue::String(s) => Value::String(s.clone()),
            AttrValue::Array(items) => Value::Array(items.iter().map(AttrValue::to_json).collect()),
            AttrValue::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

/// Decode one OTLP/JSON `AnyValue` object, recursing into arrays and kv-lists.
pub fn decode_any_value(key: &str, raw: &Value) -> Result<AttrValue, DecodeError> {
    let bad = |reason: String| DecodeError::Attribute {
        key: key.to_string(),
        reason,
    };
    let obj = raw
        .as_object()
        .ok_or_else(|| bad("value is not an object".to_string()))?;

    if let Some(v) = field(obj, "stringValue", "string_value") {
        return v
            .as_str()
            .map(|s| AttrValue::String(s.to_string()))
            .ok_or_else(|| bad("stringValue is not a string".to_string()));
    }
    if let Some(v) = field(obj, "boolValue", "bool_value") {
        return v
            .as_bool()
            .map(AttrValue::Bool)
            .ok_or_else(|| bad("boolValue is not a bool".to_string()));
    }
    if let Some(v) = field(obj, "intValue", "int_value") {
        // int64 travels as a JSON string in the canonical mapping.
        let parsed = match v {
            Value::String(s) => s.trim().parse::<i64>().ok(),
            Value::Number(n) => n.as_i64(),
            _ => None,
        };
        return parsed
            .map(AttrValue::Int)
            .ok_or_else(|| bad(format!("intValue {} is not an int64", v)));
    }
    if let Some(v) = field(obj, "doubleValue", "double_value") {
        let parsed = match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        // NaN and the infinities have no JSON form, so they could not be
        // stored and read back.
        return match parsed {
            Some(f) if f.is_finite() => Ok(AttrValue::Float(f)),
            Some(_) => Err(bad(format!("doubleValue {} is not finite", v))),
            None => Err(bad(format!("doubleValue {} is not a number", v))),
        };
    }
    if let Some(v) = field(obj, "bytesValue", "bytes_value") {
        return v
            .as_str()
            .map(|s| AttrValue::String(s.to_string()))
            .ok_or_else(|| bad("bytesValue is not a base64 string".to_string()));
    }
    if let Some(v) = field(obj, "arrayValue", "array_value") {
        let values = list_values(v);
        let mut out = Vec::with_capacity(values.len());
        for (i, item) in values.iter().enumerate() {
            out.push(decode_any_value(&format!("{}[{}]", key, i), item)?);
        }
        return Ok(AttrValue::Array(out));
    }
    if let Some(v) = field(obj, "kvlistValue", "kvlist_value") {
        let mut out = BTreeMap::new();
        for entry in list_values(v) {
            let (k, value) = split_key_value(entry).map_err(|reason| bad(reason))?;
            out.insert(k.to_string(), decode_any_value(&format!("{}.{}", key, k), value)?);
        }
        return Ok(AttrValue::Map(out));
    }
    Err(bad("no recognised value field".to_string()))
}

/// Decode a `KeyValue[]` list. Malformed entries are skipped and handed back
/// so the caller can log them with span context.
pub fn decode_attributes(raw: Option<&Value>) -> (AttrMap, Vec<DecodeError>) {
    let mut attrs = AttrMap::new();
    let mut skipped = Vec::new();
    let Some(list) = raw.and_then(Value::as_array) else {
        return (attrs, skipped);
    };
    for entry in list {
        match split_key_value(entry) {
            Ok((key, value)) => match decode_any_value(key, value) {
                Ok(decoded) => {
                    attrs.insert(key.to_string(), decoded);
                }
                Err(e) => skipped.push(e),
            },
            Err(reason) => skipped.push(DecodeError::Attribute {
                key: String::new(),
                reason,
            }),
        }
    }
    (attrs, skipped)
}

fn split_key_value(entry: &Value) -> Result<(&str, &Value), String> {
    let key = entry
        .get("key")
        .and_then(Value::as_str)
        .ok_or_else(|| "attribute entry has no key".to_string())?;
    let value = entry
        .get("value")
        .ok_or_else(|| format!("attribute {:?} has no value", key))?;
    Ok((key, value))
}

fn field<'a>(
    obj: &'a serde_json::Map<String, Value>,
    camel: &str,
    snake: &str,
) -> Option<&'a Value> {
    obj.get(camel).or_else(|| obj.get(snake))
}

fn list_values(v: &Value) -> &[Value] {
    v.get("values")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// Parse a string that might contain JSON. If parsing fails, return Value::String(original).
pub fn json_best_effort_str(s: &str) -> Value {
    let t = s.trim();
    if t.is_empty() {
        return Value::String(String::new());
    }

    // Heuristic: only attempt JSON parse when it "looks like" JSON or primitives.
    let first = t.as_bytes()[0] as char;
    let looks_json = matches!(first, '{' | '[' | '"')
        || first.is_ascii_digit()
        || t == "true"
        || t == "false"
        || t == "null"
        || (first == '-' && t.len() > 1 && t.as_bytes()[1].is_ascii_digit());

    if looks_json {
        if let Ok(v) = serde_json::from_str::<Value>(t) {
            return v;
        }
    }

    Value::String(s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_scalars() {
        assert_eq!(
            decode_any_value("k", &json!({"stringValue": "x"})).unwrap(),
            AttrValue::String("x".into())
        );
        assert_eq!(
            decode_any_value("k", &json!({"intValue": "42"})).unwrap(),
            AttrValue::Int(42)
        );
        assert_eq!(
            decode_any_value("k", &json!({"intValue": 7})).unwrap(),
            AttrValue::Int(7)
        );
        assert_eq!(
            decode_any_value("k", &json!({"doubleValue": 0.5})).unwrap(),
            AttrValue::Float(0.5)
        );
        assert_eq!(
            decode_any_value("k", &json!({"boolValue": true})).unwrap(),
            AttrValue::Bool(true)
        );
    }

    #[test]
    fn decodes_nested_array_and_kvlist() {
        let raw = json!({
            "kvlistValue": {"values": [
                {"key": "tags", "value": {"arrayValue": {"values": [
                    {"stringValue": "a"}, {"intValue": "2"}
                ]}}},
                {"key": "inner", "value": {"kvlistValue": {"values": [
                    {"key": "ok", "value": {"boolValue": false}}
                ]}}}
            ]}
        });
        let decoded = decode_any_value("root", &raw).unwrap();
        assert_eq!(
            decoded.to_json(),
            json!({"tags": ["a", 2], "inner": {"ok": false}})
        );
    }

    #[test]
    fn malformed_attribute_is_skipped_not_fatal() {
        let list = json!([
            {"key": "good", "value": {"stringValue": "yes"}},
            {"key": "bad_int", "value": {"intValue": "twelve"}},
            {"value": {"stringValue": "no key"}},
            {"key": "also_good", "value": {"boolValue": true}}
        ]);
        let (attrs, skipped) = decode_attributes(Some(&list));
        assert_eq!(attrs.len(), 2);
        assert_eq!(skipped.len(), 2);
        assert!(matches!(&skipped[0], DecodeError::Attribute { key, .. } if key == "bad_int"));
    }

    #[test]
    fn non_finite_double_is_skipped() {
        let list = json!([
            {"key": "nan", "value": {"doubleValue": "NaN"}},
            {"key": "inf", "value": {"doubleValue": "Infinity"}},
            {"key": "neg_inf", "value": {"doubleValue": "-Infinity"}},
            {"key": "ratio", "value": {"doubleValue": "0.25"}}
        ]);
        let (attrs, skipped) = decode_attributes(Some(&list));
        assert_eq!(attrs.keys().collect::<Vec<_>>(), vec!["ratio"]);
        assert_eq!(skipped.len(), 3);

        // Whatever survives must read back from its stored JSON form.
        let stored = serde_json::to_string(&attrs).unwrap();
        let back: AttrMap = serde_json::from_str(&stored).unwrap();
        assert_eq!(back, attrs);
    }

    #[test]
    fn untagged_roundtrip_keeps_int_and_float_apart() {
        let v: AttrValue = serde_json::from_value(json!(3)).unwrap();
        assert_eq!(v, AttrValue::Int(3));
        let v: AttrValue = serde_json::from_value(json!(3.5)).unwrap();
        assert_eq!(v, AttrValue::Float(3.5));
    }

    #[test]
    fn best_effort_json() {
        assert_eq!(json_best_effort_str(r#"{"a":1}"#)["a"], 1);
        assert_eq!(json_best_effort_str("hello"), Value::String("hello".into()));
        assert_eq!(json_best_effort_str("-7"), json!(-7));
    }
}
