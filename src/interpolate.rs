//! Substitutes `${path}` tokens (against a `ValueStore`) and `$.field`
//! selectors (against a fan-out element) in strings and nested
//! configuration trees.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use snafu::prelude::*;

use crate::value_store::{self, ValueStore};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{source}"))]
    Reference { source: value_store::Error },

    #[snafu(display("selector '$.{field}' has no matching top-level field on the fan-out element"))]
    MissingElementField { field: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<value_store::Error> for Error {
    fn from(source: value_store::Error) -> Self {
        Error::Reference { source }
    }
}

static TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\{([^{}]*)\}").unwrap());
static WHOLE_TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*\$\{([^{}]*)\}\s*$").unwrap());
static DOLLAR_FIELD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\.([A-Za-z_][A-Za-z0-9_]*)").unwrap());
static WHOLE_DOLLAR_FIELD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\$\.([A-Za-z_][A-Za-z0-9_]*)\s*$").unwrap());

fn expand_escapes(s: &str) -> String {
    s.replace("\\n", "\n").replace("\\t", "\t")
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other @ (Value::Bool(_) | Value::Number(_) | Value::Array(_) | Value::Object(_)) => {
            serde_json::to_string(other).unwrap_or_default()
        }
    }
}

/// Substitute `${path}` tokens in `value` using `store`, resolving relative
/// to `current_instance_id`.
pub async fn interpolate_config(
    value: &Value,
    store: &ValueStore,
    current_instance_id: &str,
) -> Result<Value> {
    match value {
        Value::String(s) => interpolate_string_config(s, store, current_instance_id).await,
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(Box::pin(interpolate_config(item, store, current_instance_id)).await?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(
                    k.clone(),
                    Box::pin(interpolate_config(v, store, current_instance_id)).await?,
                );
            }
            Ok(Value::Object(out))
        }
        other @ (Value::Null | Value::Bool(_) | Value::Number(_)) => Ok(other.clone()),
    }
}

async fn interpolate_string_config(
    s: &str,
    store: &ValueStore,
    current_instance_id: &str,
) -> Result<Value> {
    if let Some(caps) = WHOLE_TOKEN_RE.captures(s) {
        let path = caps.get(1).map(|m| m.as_str().trim()).unwrap_or("");
        return Ok(store.get_path(path, current_instance_id).await?);
    }

    let matches: Vec<(usize, usize, String)> = TOKEN_RE
        .captures_iter(s)
        .map(|c| {
            let m = c.get(0).unwrap();
            (m.start(), m.end(), c.get(1).map(|p| p.as_str().trim().to_string()).unwrap_or_default())
        })
        .collect();

    if matches.is_empty() {
        return Ok(Value::String(expand_escapes(s)));
    }

    let mut out = String::new();
    let mut last_end = 0;
    for (start, end, path) in matches {
        out.push_str(s.get(last_end..start).unwrap_or(""));
        let resolved = store.get_path(&path, current_instance_id).await?;
        out.push_str(&stringify(&resolved));
        last_end = end;
    }
    out.push_str(s.get(last_end..).unwrap_or(""));
    Ok(Value::String(expand_escapes(&out)))
}

/// Substitute `$.field` selectors in a `config_template` value against the
/// current fan-out element. Only top-level map fields of the element are
/// addressable; see DESIGN.md.
pub fn interpolate_template(value: &Value, element: &Value) -> Result<Value> {
    match value {
        Value::String(s) => interpolate_string_template(s, element),
        Value::Array(items) => items
            .iter()
            .map(|item| interpolate_template(item, element))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), interpolate_template(v, element)?);
            }
            Ok(Value::Object(out))
        }
        other @ (Value::Null | Value::Bool(_) | Value::Number(_)) => Ok(other.clone()),
    }
}

fn interpolate_string_template(s: &str, element: &Value) -> Result<Value> {
    let trimmed = s.trim();
    if trimmed == "$." {
        return Ok(element.clone());
    }

    if let Some(caps) = WHOLE_DOLLAR_FIELD_RE.captures(s) {
        let field = caps.get(1).unwrap().as_str();
        return lookup_field(element, field);
    }

    if !DOLLAR_FIELD_RE.is_match(s) {
        return Ok(Value::String(expand_escapes(s)));
    }

    let mut out = String::new();
    let mut last_end = 0;
    for caps in DOLLAR_FIELD_RE.captures_iter(s) {
        let m = caps.get(0).unwrap();
        out.push_str(s.get(last_end..m.start()).unwrap_or(""));
        let field = caps.get(1).unwrap().as_str();
        out.push_str(&stringify(&lookup_field(element, field)?));
        last_end = m.end();
    }
    out.push_str(s.get(last_end..).unwrap_or(""));
    Ok(Value::String(expand_escapes(&out)))
}

fn lookup_field(element: &Value, field: &str) -> Result<Value> {
    element
        .as_object()
        .and_then(|obj| obj.get(field))
        .cloned()
        .context(MissingElementFieldSnafu {
            field: field.to_string(),
        })
}

/// Collects the root segment (the part before the first `.`) of every
/// `${path}` token reachable in `value`, deduplicated. Used for static
/// graph validation and for identifying which dependencies a task's
/// config actually referenced when computing a cache fingerprint.
#[must_use]
pub fn referenced_root_keys(value: &Value) -> Vec<String> {
    let mut roots = Vec::new();
    collect_roots(value, &mut roots);
    roots.sort();
    roots.dedup();
    roots
}

fn collect_roots(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            for caps in TOKEN_RE.captures_iter(s) {
                let path = caps.get(1).map(|m| m.as_str().trim()).unwrap_or("");
                if let Some(root) = path.split('.').next() {
                    if !root.is_empty() {
                        out.push(root.to_string());
                    }
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|item| collect_roots(item, out)),
        Value::Object(map) => map.values().for_each(|v| collect_roots(v, out)),
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskResult;
    use chrono::Utc;
    use serde_json::json;

    #[tokio::test]
    async fn whole_token_preserves_type() {
        let store = ValueStore::new(Default::default());
        store
            .put("gen", TaskResult::success(json!({"numbers": [10, 20, 30]}), Utc::now(), 1))
            .await;
        let v = interpolate_config(&json!("${gen.numbers}"), &store, "stats")
            .await
            .unwrap();
        assert_eq!(v, json!([10, 20, 30]));
    }

    #[tokio::test]
    async fn partial_token_stringifies_and_concatenates() {
        let store = ValueStore::new(Default::default());
        store
            .put("stats", TaskResult::success(json!({"average": 20}), Utc::now(), 1))
            .await;
        let v = interpolate_config(&json!("avg=${stats.average}"), &store, "save")
            .await
            .unwrap();
        assert_eq!(v, json!("avg=20"));
    }

    #[tokio::test]
    async fn escape_sequences_are_expanded() {
        let store = ValueStore::new(Default::default());
        let v = interpolate_config(&json!("line1\\nline2"), &store, "x")
            .await
            .unwrap();
        assert_eq!(v, json!("line1\nline2"));
    }

    #[tokio::test]
    async fn nested_structures_are_recursed_into() {
        let store = ValueStore::new(Default::default());
        store
            .put("gen", TaskResult::success(json!({"n": 5}), Utc::now(), 1))
            .await;
        let v = interpolate_config(
            &json!({"a": ["${gen.n}", {"b": "${gen.n}"}]}),
            &store,
            "x",
        )
        .await
        .unwrap();
        assert_eq!(v, json!({"a": [5, {"b": 5}]}));
    }

    #[test]
    fn template_whole_element_selector() {
        let element = json!({"domain": "example.com"});
        let v = interpolate_template(&json!("$."), &element).unwrap();
        assert_eq!(v, element);
    }

    #[test]
    fn template_field_selector_preserves_type() {
        let element = json!({"port": 443});
        let v = interpolate_template(&json!("$.port"), &element).unwrap();
        assert_eq!(v, json!(443));
    }

    #[test]
    fn template_field_selector_concatenates_when_partial() {
        let element = json!({"domain": "example.com"});
        let v = interpolate_template(&json!("https://$.domain/ping"), &element).unwrap();
        assert_eq!(v, json!("https://example.com/ping"));
    }

    #[test]
    fn template_missing_field_is_an_error() {
        let element = json!({"domain": "example.com"});
        assert!(interpolate_template(&json!("$.missing"), &element).is_err());
    }
}
