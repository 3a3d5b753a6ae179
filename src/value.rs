//! The dynamic value type shared by configs, task outputs and cache entries.
//!
//! Configs and outputs are heterogeneous trees of `{null, bool, int, float,
//! string, list, map}`. `serde_json::Value` already represents exactly that
//! shape and its `Number` already distinguishes integer from floating-point
//! representations, so canonical (sorted-key) serialisation of a `Value` is
//! deterministic without a hand-rolled tagged enum.

use serde_json::Value;

/// Recursively sort object keys so serialisation is deterministic
/// regardless of insertion order. Used for cache fingerprinting and for the
/// template round-trip law.
#[must_use]
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted: Vec<_> = map.iter().collect();
            sorted.sort_by_key(|(k, _)| k.as_str());
            Value::Object(
                sorted
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(arr) => Value::Array(arr.iter().map(canonicalize).collect()),
        other @ (Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_)) => other.clone(),
    }
}

/// Serialise a value to its canonical (sorted-key) JSON string.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    serde_json::to_string(&canonicalize(value)).unwrap_or_default()
}

/// A single path segment: either a map key or a list index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

/// Split a dotted path into segments. A segment that parses as a decimal
/// integer is treated as a list index, matching the path grammar in the
/// spec (`<field|index>`).
#[must_use]
pub fn split_path(path: &str) -> Vec<Segment> {
    path.split('.')
        .filter(|s| !s.is_empty())
        .map(|seg| match seg.parse::<usize>() {
            Ok(n) => Segment::Index(n),
            Err(_) => Segment::Key(seg.to_string()),
        })
        .collect()
}

/// Walk a value following a sequence of segments, each being either a map
/// key or a list index.
#[must_use]
pub fn get_segments<'a>(value: &'a Value, segments: &[Segment]) -> Option<&'a Value> {
    let mut current = value;
    for seg in segments {
        current = match (seg, current) {
            (Segment::Key(k), Value::Object(map)) => map.get(k)?,
            (Segment::Index(i), Value::Array(arr)) => arr.get(*i)?,
            _ => return None,
        };
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonicalize_sorts_keys() {
        let v = json!({"b": 1, "a": 2});
        assert_eq!(canonical_json(&v), r#"{"a":2,"b":1}"#);
    }

    #[test]
    fn canonicalize_is_idempotent_on_arrays() {
        let v = json!([{"b": 1, "a": 2}, 3]);
        let once = canonical_json(&v);
        let twice = canonical_json(&canonicalize(&v));
        assert_eq!(once, twice);
    }

    #[test]
    fn split_path_distinguishes_index_from_key() {
        let segs = split_path("gen.numbers.0");
        assert_eq!(
            segs,
            vec![
                Segment::Key("gen".into()),
                Segment::Key("numbers".into()),
                Segment::Index(0),
            ]
        );
    }

    #[test]
    fn get_segments_walks_nested_value() {
        let v = json!({"a": {"b": [10, 20, 30]}});
        let segs = split_path("a.b.1");
        assert_eq!(get_segments(&v, &segs), Some(&json!(20)));
    }
}
