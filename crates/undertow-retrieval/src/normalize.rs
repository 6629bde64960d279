//! Coerce loosely shaped retrieval output into canonical types.
//!
//! Plans and the external knowledge service return whatever shape they like:
//! a bare array, an object with `findings`/`results`/`nodes`, or nothing.
//! Missing fields default to empty or absent; nothing here errors.

use serde_json::{Map, Value};
use tracing::trace;
use undertow_core::{defaults, Finding, RetrievalResult};

const LIST_KEYS: &[&str] = &["findings", "results", "nodes"];
const ID_KEYS: &[&str] = &["source_id", "sourceId", "id", "node_id", "nodeId"];
const CONTENT_KEYS: &[&str] = &["content", "text", "body", "snippet", "title"];
const SIMILARITY_KEYS: &[&str] = &["similarity", "score", "relevance"];
const PINNED_KEYS: &[&str] = &["pinned", "is_pinned", "isPinned"];
const CONNECTED_KEYS: &[&str] = &["connected_ids", "connectedIds", "connections", "links"];

/// Normalize a raw plan return value into a [`RetrievalResult`].
pub fn normalize_output(raw: Option<Value>) -> RetrievalResult {
    let raw = raw.unwrap_or(Value::Null);
    let (findings, confidence, summary) = match &raw {
        Value::Object(map) => (
            list_from_object(map)
                .map(|items| findings_from_array(items))
                .unwrap_or_default(),
            map.get("confidence").and_then(parse_confidence),
            map.get("summary")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        ),
        Value::Array(items) => (findings_from_array(items), None, None),
        _ => (Vec::new(), None, None),
    };

    trace!(
        subsystem = "retrieval",
        component = "normalize",
        result_count = findings.len(),
        "Normalized plan output"
    );

    RetrievalResult {
        findings,
        confidence: confidence.unwrap_or(defaults::DEFAULT_CONFIDENCE),
        summary,
    }
}

/// Findings from a bare array or an object carrying a finding list.
pub fn findings_from_value(value: &Value) -> Vec<Finding> {
    match value {
        Value::Array(items) => findings_from_array(items),
        Value::Object(map) => list_from_object(map)
            .map(|items| findings_from_array(items))
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

/// Normalize one item. Objects and plain strings become findings; other
/// scalars are dropped.
pub fn normalize_finding(item: &Value) -> Option<Finding> {
    match item {
        Value::Object(map) => Some(Finding {
            source_id: first_key(map, ID_KEYS).and_then(scalar_string).unwrap_or_default(),
            content: first_key(map, CONTENT_KEYS)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            similarity: first_key(map, SIMILARITY_KEYS)
                .and_then(Value::as_f64)
                .filter(|s| s.is_finite())
                .map(|s| s.clamp(0.0, 1.0) as f32),
            pinned: first_key(map, PINNED_KEYS).and_then(Value::as_bool),
            connected_ids: first_key(map, CONNECTED_KEYS).and_then(connected_ids),
        }),
        Value::String(text) => Some(Finding::new("", text.clone())),
        _ => None,
    }
}

/// Clamp to `[0, 1]`; `None` for anything not numeric.
fn parse_confidence(value: &Value) -> Option<f32> {
    let raw = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    raw.is_finite().then(|| raw.clamp(0.0, 1.0) as f32)
}

fn list_from_object(map: &Map<String, Value>) -> Option<&Vec<Value>> {
    LIST_KEYS
        .iter()
        .find_map(|key| map.get(*key).and_then(Value::as_array))
}

fn findings_from_array(items: &[Value]) -> Vec<Finding> {
    items.iter().filter_map(normalize_finding).collect()
}

fn first_key<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .find_map(|key| map.get(*key).filter(|v| !v.is_null()))
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Accepts `["a", "b"]` or `[{"id": "a"}, ...]`.
fn connected_ids(value: &Value) -> Option<Vec<String>> {
    let items = value.as_array()?;
    Some(
        items
            .iter()
            .filter_map(|item| match item {
                Value::Object(map) => first_key(map, ID_KEYS).and_then(scalar_string),
                other => scalar_string(other),
            })
            .collect(),
    )
}
