//! Holds per-task outputs keyed by instance id and resolves dotted
//! reference paths, including `prev`/`prev2`/… aliases and list indices.

use serde_json::Value;
use snafu::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::task::TaskResult;
use crate::value::{get_segments, split_path, Segment};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("reference '{path}': unknown instance id '{instance_id}'"))]
    MissingInstance { path: String, instance_id: String },

    #[snafu(display("reference '{path}': no field or index at this point in the path"))]
    MissingField { path: String },

    #[snafu(display(
        "reference '{path}': '{current_instance_id}' has no declared dependency for '{alias}'"
    ))]
    NoBackingDependency {
        path: String,
        current_instance_id: String,
        alias: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Holds task results for the duration of one workflow run. Lives behind a
/// clone-cheap `Arc` so the scheduler can share it across concurrently
/// dispatched tasks.
#[derive(Clone, Default)]
pub struct ValueStore {
    results: Arc<RwLock<HashMap<String, TaskResult>>>,
    /// Declared dependency order per instance id, needed for `prev*`
    /// resolution. Set once at graph-build time.
    declared_deps: Arc<HashMap<String, Vec<String>>>,
}

impl ValueStore {
    #[must_use]
    pub fn new(declared_deps: HashMap<String, Vec<String>>) -> Self {
        Self {
            results: Arc::new(RwLock::new(HashMap::new())),
            declared_deps: Arc::new(declared_deps),
        }
    }

    pub async fn put(&self, instance_id: impl Into<String>, result: TaskResult) {
        self.results.write().await.insert(instance_id.into(), result);
    }

    pub async fn get(&self, instance_id: &str) -> Option<TaskResult> {
        self.results.read().await.get(instance_id).cloned()
    }

    pub async fn contains(&self, instance_id: &str) -> bool {
        self.results.read().await.contains_key(instance_id)
    }

    /// A point-in-time copy of every result recorded so far, returned to
    /// the caller once a run completes.
    pub async fn snapshot(&self) -> HashMap<String, TaskResult> {
        self.results.read().await.clone()
    }

    /// Resolve a reference path relative to `current_instance_id`.
    pub async fn get_path(&self, path: &str, current_instance_id: &str) -> Result<Value> {
        let (result, rest) = self.resolve_root(path, current_instance_id).await?;
        resolve_rest(path, &result, &rest)
    }

    /// Resolve the root instance a path refers to (following `prev*`
    /// aliases) and return its `TaskResult` together with the remaining
    /// path segments. Exposed so `ConditionEvaluator` can inspect
    /// `success`/`skipped` before dereferencing `.output` — a skipped or
    /// failed dependency makes a condition false, never an error.
    pub async fn resolve_root(
        &self,
        path: &str,
        current_instance_id: &str,
    ) -> Result<(TaskResult, Vec<Segment>)> {
        let segments = split_path(path);
        let Some(first) = segments.first() else {
            return Err(Error::MissingField {
                path: path.to_string(),
            });
        };

        let (target_instance_id, rest) = match first {
            Segment::Key(key) if key == "prev" || is_prev_alias(key) => {
                let n = prev_depth(key);
                let deps = self
                    .declared_deps
                    .get(current_instance_id)
                    .map(Vec::as_slice)
                    .unwrap_or(&[]);
                let idx = deps.len().checked_sub(n);
                let target = match idx {
                    Some(i) => deps.get(i),
                    None => None,
                };
                let target = target.context(NoBackingDependencySnafu {
                    path: path.to_string(),
                    current_instance_id: current_instance_id.to_string(),
                    alias: key.clone(),
                })?;
                (target.clone(), segments.get(1..).unwrap_or(&[]).to_vec())
            }
            Segment::Key(key) => (key.clone(), segments.get(1..).unwrap_or(&[]).to_vec()),
            Segment::Index(_) => {
                return Err(Error::MissingField {
                    path: path.to_string(),
                })
            }
        };

        let result = self
            .results
            .read()
            .await
            .get(&target_instance_id)
            .cloned()
            .context(MissingInstanceSnafu {
                path: path.to_string(),
                instance_id: target_instance_id.clone(),
            })?;

        Ok((result, rest))
    }
}

fn is_prev_alias(key: &str) -> bool {
    key.starts_with("prev") && key.get(4..).is_some_and(|rest| rest.chars().all(|c| c.is_ascii_digit()))
}

/// `prev` -> 1 (last declared dep), `prev2` -> 2 (second-to-last), etc.
fn prev_depth(key: &str) -> usize {
    if key == "prev" {
        1
    } else {
        key.get(4..).and_then(|rest| rest.parse().ok()).unwrap_or(1)
    }
}

/// Dereference the remaining path segments against an already-resolved
/// root `TaskResult`. Exposed so `ConditionEvaluator` can reuse the same
/// `.output`/`.success`/`.error` dereference rules after inspecting
/// `success`/`skipped` itself.
pub fn resolve_rest(path: &str, result: &TaskResult, rest: &[Segment]) -> Result<Value> {
    if rest.is_empty() {
        return Ok(result.output.clone());
    }

    if let Some(Segment::Key(key)) = rest.first() {
        if rest.len() == 1 && key == "success" {
            return Ok(Value::Bool(result.success));
        }
        if rest.len() == 1 && key == "error" {
            return Ok(result
                .error
                .as_ref()
                .map(|e| serde_json::to_value(e).unwrap_or(Value::Null))
                .unwrap_or(Value::Null));
        }
        // Explicit or implicit dereference through `.output`.
        let inner_segments: &[Segment] = if key == "output" { rest.get(1..).unwrap_or(&[]) } else { rest };
        if inner_segments.is_empty() {
            return Ok(result.output.clone());
        }
        return get_segments(&result.output, inner_segments)
            .cloned()
            .context(MissingFieldSnafu {
                path: path.to_string(),
            });
    }

    get_segments(&result.output, rest)
        .cloned()
        .context(MissingFieldSnafu {
            path: path.to_string(),
        })
}
