//! Decides whether a task should run: the structured `{operator, value,
//! path}` form and the string-expression form.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::prelude::*;

use crate::value_store::{self, ValueStore};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{source}"))]
    Reference { source: value_store::Error },

    #[snafu(display("malformed condition expression: '{expression}'"))]
    Malformed { expression: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<value_store::Error> for Error {
    fn from(source: value_store::Error) -> Self {
        Error::Reference { source }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Lt,
    Gte,
    Lte,
    In,
    NotIn,
}

impl Operator {
    fn from_symbol(sym: &str) -> Option<Self> {
        Some(match sym {
            "==" => Operator::Eq,
            "!=" => Operator::Ne,
            ">" => Operator::Gt,
            "<" => Operator::Lt,
            ">=" => Operator::Gte,
            "<=" => Operator::Lte,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredCondition {
    pub operator: Operator,
    pub value: Value,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    Structured(StructuredCondition),
    Expression(String),
}

static EXPR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*\$\{([^{}]+)\}\s*(==|!=|>=|<=|>|<)\s*(.+?)\s*$").unwrap()
});

/// Whether a string-expression condition matches the static grammar. Checked
/// at graph-build time so a malformed expression surfaces as a validation
/// error rather than a runtime `Error::Malformed` on first evaluation.
#[must_use]
pub fn is_well_formed_expression(expr: &str) -> bool {
    EXPR_RE.is_match(expr)
}

impl Condition {
    /// Evaluate whether the gated task should run. A missing, skipped or
    /// failed upstream dependency makes the condition false, never an
    /// error — conditional chains legitimately depend on upstream skips
    pub async fn evaluate(&self, store: &ValueStore, current_instance_id: &str) -> Result<bool> {
        match self {
            Condition::Structured(cond) => {
                evaluate_structured(cond, store, current_instance_id).await
            }
            Condition::Expression(expr) => {
                evaluate_expression(expr, store, current_instance_id).await
            }
        }
    }
}

/// Looks up the path's value, returning `Ok(None)` (never an error) when
/// the referenced dependency was skipped, failed, or does not exist.
async fn lookup_gated(path: &str, store: &ValueStore, current_instance_id: &str) -> Result<Option<Value>> {
    let (root, rest) = match store.resolve_root(path, current_instance_id).await {
        Ok(pair) => pair,
        Err(_) => return Ok(None),
    };
    if !root.success || root.skipped {
        return Ok(None);
    }
    match value_store::resolve_rest(path, &root, &rest) {
        Ok(v) => Ok(Some(v)),
        Err(_) => Ok(None),
    }
}

async fn evaluate_structured(
    cond: &StructuredCondition,
    store: &ValueStore,
    current_instance_id: &str,
) -> Result<bool> {
    let Some(left) = lookup_gated(&cond.path, store, current_instance_id).await? else {
        return Ok(false);
    };
    Ok(compare(cond.operator, &left, &cond.value))
}

async fn evaluate_expression(
    expr: &str,
    store: &ValueStore,
    current_instance_id: &str,
) -> Result<bool> {
    let caps = EXPR_RE
        .captures(expr)
        .context(MalformedSnafu { expression: expr.to_string() })?;
    let path = caps.get(1).unwrap().as_str().trim();
    let op = Operator::from_symbol(caps.get(2).unwrap().as_str()).context(MalformedSnafu {
        expression: expr.to_string(),
    })?;
    let literal_str = caps.get(3).unwrap().as_str().trim();

    let Some(left) = lookup_gated(path, store, current_instance_id).await? else {
        return Ok(false);
    };

    if literal_str == "true" || literal_str == "false" {
        let expected = literal_str == "true";
        let actual = left.as_bool().unwrap_or(false);
        return Ok(match op {
            Operator::Eq => actual == expected,
            Operator::Ne => actual != expected,
            Operator::Gt | Operator::Lt | Operator::Gte | Operator::Lte | Operator::In | Operator::NotIn => false,
        });
    }

    let literal = parse_literal(literal_str);
    Ok(compare(op, &left, &literal))
}

fn parse_literal(s: &str) -> Value {
    if let Ok(n) = s.parse::<i64>() {
        return Value::from(n);
    }
    if let Ok(f) = s.parse::<f64>() {
        return Value::from(f);
    }
    let unquoted = s.trim_matches('"').trim_matches('\'');
    Value::String(unquoted.to_string())
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        Value::Null | Value::Bool(_) | Value::Array(_) | Value::Object(_) => None,
    }
}

fn compare(op: Operator, left: &Value, right: &Value) -> bool {
    match op {
        Operator::In | Operator::NotIn => {
            let contains = match right {
                Value::Array(items) => items.contains(left),
                Value::String(s) => left.as_str().is_some_and(|l| s.contains(l)),
                Value::Null | Value::Bool(_) | Value::Number(_) | Value::Object(_) => match left {
                    Value::Array(items) => items.contains(right),
                    Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) | Value::Object(_) => false,
                },
            };
            if op == Operator::In {
                contains
            } else {
                !contains
            }
        }
        Operator::Eq | Operator::Ne | Operator::Gt | Operator::Lt | Operator::Gte | Operator::Lte => {
            if let (Some(l), Some(r)) = (as_number(left), as_number(right)) {
                compare_ord(op, l.partial_cmp(&r))
            } else {
                let l = left.as_str().map(str::to_string).unwrap_or_else(|| left.to_string());
                let r = right.as_str().map(str::to_string).unwrap_or_else(|| right.to_string());
                compare_ord(op, l.partial_cmp(&r))
            }
        }
    }
}

fn compare_ord(op: Operator, ord: Option<std::cmp::Ordering>) -> bool {
    use std::cmp::Ordering::*;
    match (op, ord) {
        (Operator::Eq, Some(Equal)) => true,
        (Operator::Ne, Some(o)) => o != Equal,
        (Operator::Ne, None) => true,
        (Operator::Gt, Some(Greater)) => true,
        (Operator::Lt, Some(Less)) => true,
        (Operator::Gte, Some(Greater | Equal)) => true,
        (Operator::Lte, Some(Less | Equal)) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskResult;
    use chrono::Utc;
    use serde_json::json;

    #[tokio::test]
    async fn structured_gt_selects_big_branch() {
        let store = ValueStore::new(Default::default());
        store
            .put("stats", TaskResult::success(json!({"average": 70}), Utc::now(), 1))
            .await;
        let big = Condition::Structured(StructuredCondition {
            operator: Operator::Gt,
            value: json!(50),
            path: "stats.average".to_string(),
        });
        assert!(big.evaluate(&store, "big").await.unwrap());
    }

    #[tokio::test]
    async fn structured_lte_rejects_when_above_threshold() {
        let store = ValueStore::new(Default::default());
        store
            .put("stats", TaskResult::success(json!({"average": 70}), Utc::now(), 1))
            .await;
        let small = Condition::Structured(StructuredCondition {
            operator: Operator::Lte,
            value: json!(50),
            path: "stats.average".to_string(),
        });
        assert!(!small.evaluate(&store, "small").await.unwrap());
    }

    #[tokio::test]
    async fn skipped_dependency_makes_condition_false_not_error() {
        let store = ValueStore::new(Default::default());
        store.put("upstream", TaskResult::skip(Utc::now())).await;
        let cond = Condition::Structured(StructuredCondition {
            operator: Operator::Eq,
            value: json!(1),
            path: "upstream.x".to_string(),
        });
        assert!(!cond.evaluate(&store, "downstream").await.unwrap());
    }

    #[tokio::test]
    async fn string_expression_form() {
        let store = ValueStore::new(Default::default());
        store
            .put("stats", TaskResult::success(json!({"average": 20}), Utc::now(), 1))
            .await;
        let cond = Condition::Expression("${stats.average} <= 50".to_string());
        assert!(cond.evaluate(&store, "small").await.unwrap());
    }

    #[tokio::test]
    async fn string_expression_boolean_literal() {
        let store = ValueStore::new(Default::default());
        store
            .put("check", TaskResult::success(json!({"ok": true}), Utc::now(), 1))
            .await;
        let cond = Condition::Expression("${check.ok} == true".to_string());
        assert!(cond.evaluate(&store, "next").await.unwrap());
    }

    #[tokio::test]
    async fn in_operator_over_sequence() {
        let store = ValueStore::new(Default::default());
        store
            .put("gen", TaskResult::success(json!({"tag": "b"}), Utc::now(), 1))
            .await;
        let cond = Condition::Structured(StructuredCondition {
            operator: Operator::In,
            value: json!(["a", "b", "c"]),
            path: "gen.tag".to_string(),
        });
        assert!(cond.evaluate(&store, "x").await.unwrap());
    }
}
