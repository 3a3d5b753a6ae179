//! The static workflow/task definition model.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::condition::Condition;

/// Per-task retry policy. `max_attempts` is always at least 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff_seconds: f64,
}

fn default_max_attempts() -> u32 {
    1
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_seconds: 0.0,
        }
    }
}

/// The static description of one node in the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskSpec {
    #[serde(skip)]
    pub instance_id: String,

    #[serde(rename = "type")]
    pub task_type: String,

    #[serde(default)]
    pub config: Value,

    #[serde(default)]
    pub dependencies: Vec<String>,

    #[serde(default)]
    pub condition: Option<Condition>,

    #[serde(default)]
    pub cache_enabled: bool,

    #[serde(default)]
    pub cache_ttl: Option<u64>,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub timeout_seconds: Option<f64>,

    /// Reference path to a sequence; presence triggers fan-out (mutually
    /// exclusive with running as a plain singleton task).
    #[serde(default)]
    pub for_each: Option<String>,

    /// Per-element config, with `$.field` selectors, required iff
    /// `for_each` is set.
    #[serde(default)]
    pub config_template: Option<Value>,

    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Declares this task as a producer exposing a bounded publish
    /// channel.
    #[serde(default)]
    pub produces_stream: bool,

    /// Names a producer instance_id this task consumes from.
    #[serde(default)]
    pub consumes_stream: Option<String>,
}

fn default_max_concurrent() -> usize {
    1
}

impl TaskSpec {
    #[must_use]
    pub fn is_fan_out(&self) -> bool {
        self.for_each.is_some()
    }
}

/// Cache backend selection and its backend-specific options, as they
/// appear under a template's top-level `cache:` key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CacheSpec {
    Memory {
        #[serde(default = "default_cache_max_size")]
        max_size: usize,
        #[serde(default)]
        default_ttl: Option<u64>,
    },
    File {
        cache_dir: String,
        #[serde(default)]
        default_ttl: Option<u64>,
    },
    Redis {
        #[serde(default = "default_redis_host")]
        host: String,
        #[serde(default = "default_redis_port")]
        port: u16,
        #[serde(default)]
        db: i64,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        default_ttl: Option<u64>,
        #[serde(default = "default_key_prefix")]
        key_prefix: String,
        #[serde(default = "default_max_connections")]
        max_connections: usize,
    },
}

impl CacheSpec {
    #[must_use]
    pub fn default_ttl(&self) -> Option<u64> {
        match self {
            CacheSpec::Memory { default_ttl, .. }
            | CacheSpec::File { default_ttl, .. }
            | CacheSpec::Redis { default_ttl, .. } => *default_ttl,
        }
    }
}

fn default_cache_max_size() -> usize {
    1000
}
fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}
fn default_redis_port() -> u16 {
    6379
}
fn default_key_prefix() -> String {
    "weirflow:".to_string()
}
fn default_max_connections() -> usize {
    10
}

/// The full static description of one workflow, as loaded from a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowSpec {
    pub name: String,

    #[serde(default)]
    pub cache: Option<CacheSpec>,

    pub tasks: HashMap<String, TaskSpec>,

    /// Top-level dependency declarations, merged with each task's own
    /// `dependencies` list.
    #[serde(default)]
    pub dependencies: HashMap<String, Vec<String>>,
}

impl WorkflowSpec {
    /// Fill in each `TaskSpec::instance_id` from its map key and merge the
    /// top-level `dependencies` block into each task's own list.
    #[must_use]
    pub fn finalize(mut self) -> Self {
        for (instance_id, task) in self.tasks.iter_mut() {
            task.instance_id = instance_id.clone();
            if let Some(extra) = self.dependencies.get(instance_id) {
                for dep in extra {
                    if !task.dependencies.contains(dep) {
                        task.dependencies.push(dep.clone());
                    }
                }
            }
            if let Some(producer) = &task.consumes_stream {
                if !task.dependencies.contains(producer) {
                    task.dependencies.push(producer.clone());
                }
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::indexing_slicing)]
    use super::*;
    use serde_json::json;

    #[test]
    fn finalize_merges_top_level_dependencies() {
        let mut tasks = HashMap::new();
        tasks.insert(
            "b".to_string(),
            TaskSpec {
                instance_id: String::new(),
                task_type: "noop".to_string(),
                config: json!({}),
                dependencies: vec![],
                condition: None,
                cache_enabled: false,
                cache_ttl: None,
                retry: RetryPolicy::default(),
                timeout_seconds: None,
                for_each: None,
                config_template: None,
                max_concurrent: 1,
                produces_stream: false,
                consumes_stream: None,
            },
        );
        let mut deps = HashMap::new();
        deps.insert("b".to_string(), vec!["a".to_string()]);
        let spec = WorkflowSpec {
            name: "wf".to_string(),
            cache: None,
            tasks,
            dependencies: deps,
        }
        .finalize();
        assert_eq!(spec.tasks["b"].instance_id, "b");
        assert_eq!(spec.tasks["b"].dependencies, vec!["a".to_string()]);
    }

    #[test]
    fn retry_policy_defaults_to_single_attempt() {
        let policy: RetryPolicy = serde_json::from_value(json!({})).unwrap();
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.backoff_seconds, 0.0);
    }
}
