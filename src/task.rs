//! Task contract: the uniform result envelope and the capability every
//! registered task type implements.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::prelude::*;

use crate::stream::StreamHandle;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("task '{message}'"))]
    Execution { message: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// What kind of failure produced a non-success `TaskResult`.
///
/// `Reference` and `Upstream` failures are never retried; `Task` and
/// `Timeout` are retried up to `max_attempts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    Reference,
    Condition,
    Task,
    Timeout,
    Cache,
    Upstream,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskErrorInfo {
    pub kind: TaskErrorKind,
    pub message: String,
    /// instance_id of the dependency that originated an `Upstream` failure.
    pub origin: Option<String>,
}

impl TaskErrorInfo {
    #[must_use]
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            origin: None,
        }
    }

    #[must_use]
    pub fn upstream(origin: impl Into<String>) -> Self {
        let origin = origin.into();
        Self {
            kind: TaskErrorKind::Upstream,
            message: format!("upstream task '{origin}' did not complete successfully"),
            origin: Some(origin),
        }
    }
}

/// The uniform success/failure/output/metadata envelope returned by every
/// task execution, a fan-out aggregate, a cache hit, or a skip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    pub output: Value,
    pub error: Option<TaskErrorInfo>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub attempts: u32,
    #[serde(default)]
    pub skipped: bool,
}

impl TaskResult {
    #[must_use]
    pub fn success(output: Value, started_at: DateTime<Utc>, attempts: u32) -> Self {
        Self {
            success: true,
            output,
            error: None,
            started_at,
            finished_at: Utc::now(),
            attempts,
            skipped: false,
        }
    }

    #[must_use]
    pub fn failure(
        error: TaskErrorInfo,
        started_at: DateTime<Utc>,
        attempts: u32,
    ) -> Self {
        Self {
            success: false,
            output: Value::Null,
            error: Some(error),
            started_at,
            finished_at: Utc::now(),
            attempts,
            skipped: false,
        }
    }

    /// The sentinel result stored for a task whose condition evaluated false.
    #[must_use]
    pub fn skip(now: DateTime<Utc>) -> Self {
        Self {
            success: true,
            output: Value::Object(serde_json::Map::new()),
            error: None,
            started_at: now,
            finished_at: now,
            attempts: 0,
            skipped: true,
        }
    }

    /// The sentinel result for a task skipped because a dependency failed.
    #[must_use]
    pub fn skip_upstream(origin: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            success: true,
            output: Value::Object(serde_json::Map::new()),
            error: Some(TaskErrorInfo::upstream(origin)),
            started_at: now,
            finished_at: now,
            attempts: 0,
            skipped: true,
        }
    }
}

/// Per-execution handle given to a running task: cancellation and, for
/// streaming producer/consumer pairs, the channel endpoint.
#[derive(Clone)]
pub struct TaskContext {
    pub instance_id: String,
    cancel: tokio::sync::watch::Receiver<bool>,
    timeout_cancel: tokio::sync::watch::Receiver<bool>,
    pub stream: Option<StreamHandle>,
}

impl TaskContext {
    #[must_use]
    pub fn new(instance_id: impl Into<String>, cancel: tokio::sync::watch::Receiver<bool>) -> Self {
        let (_tx, timeout_cancel) = tokio::sync::watch::channel(false);
        Self {
            instance_id: instance_id.into(),
            cancel,
            timeout_cancel,
            stream: None,
        }
    }

    #[must_use]
    pub fn with_stream(mut self, stream: StreamHandle) -> Self {
        self.stream = Some(stream);
        self
    }

    /// Attach the per-attempt timeout signal. Set by `run_single_attempt`
    /// before spawning a task with a `timeout_seconds` budget.
    #[must_use]
    pub fn with_timeout_cancel(mut self, timeout_cancel: tokio::sync::watch::Receiver<bool>) -> Self {
        self.timeout_cancel = timeout_cancel;
        self
    }

    /// True once the scheduler's top-level cancel fires, or this task's own
    /// timeout fires. A timed-out task is given a grace window to observe
    /// this and return on its own before `run_single_attempt` hard-aborts
    /// its future. Tasks are expected to check this at suspension points.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow() || *self.timeout_cancel.borrow()
    }
}

/// A registered unit of work. Implementations are constructed by a
/// `TaskRegistry` with the resolved (interpolated) config already baked in:
/// a constructor taking `(instance_id, config)`.
#[async_trait]
pub trait Task: Send + Sync {
    async fn execute(&self, ctx: &TaskContext) -> Result<Value>;

    /// Producer tasks override this to push values onto
    /// `ctx.stream` as they become available. Default delegates to
    /// `execute`, matching non-streaming tasks.
    async fn stream_output(&self, ctx: &TaskContext) -> Result<Value> {
        self.execute(ctx).await
    }

    /// Consumer tasks override this to read from `ctx.stream` until
    /// end-of-stream. Default delegates to `execute`.
    async fn consume_stream(&self, ctx: &TaskContext) -> Result<Value> {
        self.execute(ctx).await
    }
}

/// A boxed, type-erased async function: `config -> output or error message`.
pub type BoxedFn =
    std::sync::Arc<dyn Fn(Value) -> futures::future::BoxFuture<'static, std::result::Result<Value, String>> + Send + Sync>;

/// Wraps a plain async callable into a `Task`, for
/// `TaskRegistry::register_function`. The callable receives the task's
/// already-resolved config and returns its output or an error message.
pub struct FunctionTask {
    config: Value,
    func: BoxedFn,
}

impl FunctionTask {
    #[must_use]
    pub fn new(config: Value, func: BoxedFn) -> Self {
        Self { config, func }
    }
}

#[async_trait]
impl Task for FunctionTask {
    async fn execute(&self, _ctx: &TaskContext) -> Result<Value> {
        (self.func)(self.config.clone())
            .await
            .map_err(|message| Error::Execution { message })
    }
}
