//! Ordered path-candidate lookups over loosely structured JSON.
//!
//! Upstream data blobs change shape without notice, so every field is
//! described by a list of candidate paths; the first one that resolves to a
//! non-empty value wins.

use serde::Deserialize;
use serde_json::Value;

/// One step into a JSON value: an array index or an object key.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Segment {
    Index(usize),
    Key(String),
}

pub type JsonPath = Vec<Segment>;

pub fn get<'a>(value: &'a Value, path: &[Segment]) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, seg| match seg {
        Segment::Index(i) => current.as_array()?.get(*i),
        Segment::Key(k) => current.as_object()?.get(k),
    })
}

/// `null`, blank strings, and empty arrays/objects count as missing.
pub fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

pub fn first_non_empty<'a>(value: &'a Value, candidates: &[JsonPath]) -> Option<&'a Value> {
    candidates
        .iter()
        .filter_map(|path| get(value, path))
        .find(|v| !is_empty(v))
}

pub fn first_str(value: &Value, candidates: &[JsonPath]) -> Option<String> {
    candidates
        .iter()
        .filter_map(|path| get(value, path))
        .find_map(|v| match v {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

pub fn first_f64(value: &Value, candidates: &[JsonPath]) -> Option<f64> {
    candidates
        .iter()
        .filter_map(|path| get(value, path))
        .find_map(|v| match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().replace(',', ".").parse().ok(),
            _ => None,
        })
}

pub fn first_u64(value: &Value, candidates: &[JsonPath]) -> Option<u64> {
    candidates
        .iter()
        .filter_map(|path| get(value, path))
        .find_map(|v| match v {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().replace(',', "").parse().ok(),
            _ => None,
        })
}

/// All non-empty strings found at the first candidate path that yields an array.
pub fn first_str_list(value: &Value, candidates: &[JsonPath]) -> Vec<String> {
    first_non_empty(value, candidates)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
