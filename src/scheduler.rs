//! The DAG dispatch loop: resolves dependencies, materialises dynamic
//! fan-out groups, evaluates conditions, consults the cache, enforces
//! retries/timeouts and drives parallel execution with cooperative
//! cancellation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::DiGraph;
use serde_json::Value;
use snafu::prelude::*;
use tokio::sync::{watch, Mutex as AsyncMutex, Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::cache::{self, CacheEntry, CacheProvider, CacheStats};
use crate::config::WorkflowEngineConfig;
use crate::interpolate;
use crate::registry::{self, TaskRegistry};
use crate::spec::{RetryPolicy, TaskSpec, WorkflowSpec};
use crate::stream::{self, StreamHandle, StreamReceiver, StreamSender};
use crate::task::{BoxedFn, Task, TaskContext, TaskErrorInfo, TaskErrorKind, TaskResult};
use crate::value_store::ValueStore;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("workflow validation failed: {message}"))]
    Validation { message: String },

    #[snafu(display("cache backend error: {source}"))]
    Cache { source: cache::Error },

    #[snafu(display("workflow run was cancelled"))]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<cache::Error> for Error {
    fn from(source: cache::Error) -> Self {
        Error::Cache { source }
    }
}

/// A running channel pair shared between a producer and its consumer,
/// created lazily by whichever of the two the scheduler reaches first.
type ChannelPair = (StreamSender, Arc<AsyncMutex<StreamReceiver>>);

/// Resolves the static graph of declared dependencies, materialises
/// dynamic task groups at runtime, and drives concurrent dispatch.
pub struct Scheduler {
    spec: WorkflowSpec,
    registry: TaskRegistry,
    cache: Option<Arc<dyn CacheProvider>>,
    default_ttl: Option<u64>,
    config: WorkflowEngineConfig,
    store: ValueStore,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
    inflight: Arc<DashMap<String, Arc<Notify>>>,
    channels: Arc<DashMap<String, ChannelPair>>,
}

impl Scheduler {
    /// Build a scheduler from a parsed template. Validates the static graph
    /// before returning.
    pub async fn new(
        spec: WorkflowSpec,
        registry: TaskRegistry,
        cache: Option<Arc<dyn CacheProvider>>,
        config: WorkflowEngineConfig,
    ) -> Result<Self> {
        validate(&spec, &registry)?;

        let cache = match cache {
            Some(cache) => Some(cache),
            None => match &spec.cache {
                Some(backend_spec) => Some(cache::build_backend(backend_spec).await?),
                None => match &config.default_cache {
                    Some(backend_spec) => Some(cache::build_backend(backend_spec).await?),
                    None => None,
                },
            },
        };
        let default_ttl = spec.cache.as_ref().and_then(CacheSpecExt::default_ttl_opt);

        let declared_deps: HashMap<String, Vec<String>> = spec
            .tasks
            .iter()
            .map(|(id, task)| (id.clone(), task.dependencies.clone()))
            .collect();

        let (cancel_tx, cancel_rx) = watch::channel(false);

        Ok(Self {
            spec,
            registry,
            cache,
            default_ttl,
            config,
            store: ValueStore::new(declared_deps),
            cancel_tx,
            cancel_rx,
            inflight: Arc::new(DashMap::new()),
            channels: Arc::new(DashMap::new()),
        })
    }

    /// Signal cooperative cancellation to every in-flight task.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    pub async fn get_cache_stats(&self) -> Option<CacheStats> {
        match &self.cache {
            Some(cache) => Some(cache.stats().await),
            None => None,
        }
    }

    pub async fn clear_cache(&self) -> Result<()> {
        if let Some(cache) = &self.cache {
            cache.clear().await?;
        }
        Ok(())
    }

    pub async fn cleanup_expired_cache(&self) -> Result<usize> {
        match &self.cache {
            Some(cache) => Ok(cache.cleanup_expired().await?),
            None => Ok(0),
        }
    }

    /// Run the workflow to completion. Returns every instance id mapped to
    /// its final `TaskResult`, including skipped and failed ones, unless the
    /// run was cancelled.
    #[instrument(skip(self), fields(workflow = %self.spec.name))]
    pub async fn run(&self) -> Result<HashMap<String, TaskResult>> {
        let tie_break = stable_order(&self.spec);
        let mut pending: HashMap<String, HashSet<String>> = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();

        for (id, task) in &self.spec.tasks {
            let blocking = blocking_deps(task);
            for dep in &blocking {
                dependents.entry(dep.clone()).or_default().push(id.clone());
            }
            pending.insert(id.clone(), blocking.into_iter().collect());
        }

        let mut ready: Vec<String> = pending
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        sort_by_tie_break(&mut ready, &tie_break);

        let global_permits = self
            .config
            .max_concurrent
            .map(|n| Arc::new(Semaphore::new(n.max(1))));

        let mut joinset: JoinSet<(String, TaskResult)> = JoinSet::new();
        let mut dispatched: HashSet<String> = HashSet::new();
        let mut remaining = self.spec.tasks.len();

        for id in ready.drain(..) {
            self.spawn_task(&id, &mut joinset, global_permits.clone());
            dispatched.insert(id);
        }

        while remaining > 0 {
            if *self.cancel_rx.borrow() {
                joinset.shutdown().await;
                return Err(Error::Cancelled);
            }
            let Some(joined) = joinset.join_next().await else {
                break;
            };
            let (id, result) = joined.expect("task future never panics under normal operation");
            remaining -= 1;
            self.store.put(id.clone(), result).await;

            let mut newly_ready: Vec<String> = Vec::new();
            if let Some(downstream) = dependents.get(&id) {
                for dep_id in downstream {
                    if let Some(set) = pending.get_mut(dep_id) {
                        set.remove(&id);
                        if set.is_empty() && !dispatched.contains(dep_id) {
                            newly_ready.push(dep_id.clone());
                        }
                    }
                }
            }
            sort_by_tie_break(&mut newly_ready, &tie_break);
            for next_id in newly_ready {
                self.spawn_task(&next_id, &mut joinset, global_permits.clone());
                dispatched.insert(next_id);
            }
        }

        Ok(self.store.snapshot().await)
    }

    fn spawn_task(
        &self,
        instance_id: &str,
        joinset: &mut JoinSet<(String, TaskResult)>,
        global_permits: Option<Arc<Semaphore>>,
    ) {
        let instance_id = instance_id.to_string();
        let task_spec = self
            .spec
            .tasks
            .get(&instance_id)
            .expect("spawn_task only called with an instance id present in the graph")
            .clone();
        let store = self.store.clone();
        let registry = self.registry.clone();
        let cache = self.cache.clone();
        let default_ttl = self.default_ttl;
        let include_source_hash = self.config.include_source_hash;
        let stream_capacity = self.config.stream_capacity;
        let cancel_rx = self.cancel_rx.clone();
        let inflight = Arc::clone(&self.inflight);
        let channels = Arc::clone(&self.channels);

        joinset.spawn(async move {
            let _permit = match &global_permits {
                Some(sem) => Some(sem.clone().acquire_owned().await.expect("semaphore never closes")),
                None => None,
            };
            let result = run_one(
                &task_spec,
                &store,
                &registry,
                cache.as_ref(),
                default_ttl,
                include_source_hash,
                stream_capacity,
                cancel_rx,
                &inflight,
                &channels,
            )
            .await;
            (instance_id, result)
        });
    }

}

/// Dependencies that gate dispatch readiness: a task's declared
/// dependencies, minus the producer it merely streams from — the scheduler
/// launches a producer and its consumer concurrently.
fn blocking_deps(task: &TaskSpec) -> Vec<String> {
    task.dependencies
        .iter()
        .filter(|dep| Some(dep.as_str()) != task.consumes_stream.as_deref())
        .cloned()
        .collect()
}

/// Deterministic tie-break order among simultaneously ready tasks. The
/// template format stores tasks in a `HashMap`, so "declaration order" is
/// realised as a stable lexical order over instance ids; see DESIGN.md.
fn stable_order(spec: &WorkflowSpec) -> HashMap<String, usize> {
    let mut ids: Vec<&String> = spec.tasks.keys().collect();
    ids.sort();
    ids.into_iter()
        .enumerate()
        .map(|(i, id)| (id.clone(), i))
        .collect()
}

fn sort_by_tie_break(ids: &mut [String], order: &HashMap<String, usize>) {
    ids.sort_by_key(|id| order.get(id).copied().unwrap_or(usize::MAX));
}

/// Validate the static graph: every dependency references an existing
/// task, no cycles, every registered type exists, and every `${path}`
/// reference's root resolves to either a task in the graph or a `prev*`
/// alias with a resolvable backing dependency.
fn validate(spec: &WorkflowSpec, registry: &TaskRegistry) -> Result<()> {
    let mut graph = DiGraph::<(), ()>::new();
    let mut nodes = HashMap::new();
    for id in spec.tasks.keys() {
        nodes.insert(id.clone(), graph.add_node(()));
    }

    for (id, task) in &spec.tasks {
        if !registry.contains(&task.task_type) {
            return Err(Error::Validation {
                message: format!("task '{id}' has unregistered type '{}'", task.task_type),
            });
        }
        if task.is_fan_out() && task.config_template.is_none() {
            return Err(Error::Validation {
                message: format!("task '{id}' declares for_each but no config_template"),
            });
        }
        for dep in &task.dependencies {
            let Some(&dep_node) = nodes.get(dep) else {
                return Err(Error::Validation {
                    message: format!("task '{id}' depends on unknown task '{dep}'"),
                });
            };
            let &node = nodes.get(id).expect("every task id was inserted into nodes above");
            graph.add_edge(dep_node, node, ());
        }
        if let Some(producer) = &task.consumes_stream {
            if !spec.tasks.contains_key(producer) {
                return Err(Error::Validation {
                    message: format!("task '{id}' consumes unknown producer '{producer}'"),
                });
            }
        }
        if let Some(crate::condition::Condition::Expression(expr)) = &task.condition {
            if !crate::condition::is_well_formed_expression(expr) {
                return Err(Error::Validation {
                    message: format!("task '{id}' has a malformed condition expression: '{expr}'"),
                });
            }
        }

        for root in reference_roots(task) {
            if root.starts_with("prev") && is_prev_alias(&root) {
                let depth = prev_depth(&root);
                if task.dependencies.len() < depth {
                    return Err(Error::Validation {
                        message: format!(
                            "task '{id}' references '{root}' but has only {} declared dependencies",
                            task.dependencies.len()
                        ),
                    });
                }
            } else if !spec.tasks.contains_key(&root) {
                return Err(Error::Validation {
                    message: format!("task '{id}' references unknown task '{root}'"),
                });
            }
        }
    }

    if is_cyclic_directed(&graph) {
        return Err(Error::Validation {
            message: "dependency graph contains a cycle".to_string(),
        });
    }

    Ok(())
}

fn is_prev_alias(key: &str) -> bool {
    key == "prev" || (key.starts_with("prev") && key.get(4..).is_some_and(|rest| rest.chars().all(|c| c.is_ascii_digit())))
}

fn prev_depth(key: &str) -> usize {
    if key == "prev" {
        1
    } else {
        key.get(4..).and_then(|rest| rest.parse().ok()).unwrap_or(1)
    }
}

fn reference_roots(task: &TaskSpec) -> Vec<String> {
    let mut roots = interpolate::referenced_root_keys(&task.config);
    if let Some(cond) = &task.condition {
        match cond {
            crate::condition::Condition::Structured(structured) => {
                if let Some(root) = structured.path.split('.').next() {
                    roots.push(root.to_string());
                }
            }
            crate::condition::Condition::Expression(expr) => {
                roots.extend(interpolate::referenced_root_keys(&Value::String(expr.clone())));
            }
        }
    }
    roots.sort();
    roots.dedup();
    roots
}

/// Execute one top-level `TaskSpec`: upstream-failure check, interpolation,
/// condition, fan-out expansion or singleton execution.
#[allow(clippy::too_many_arguments)]
async fn run_one(
    task: &TaskSpec,
    store: &ValueStore,
    registry: &TaskRegistry,
    cache: Option<&Arc<dyn CacheProvider>>,
    default_ttl: Option<u64>,
    include_source_hash: bool,
    stream_capacity: usize,
    cancel_rx: watch::Receiver<bool>,
    inflight: &Arc<DashMap<String, Arc<Notify>>>,
    channels: &DashMap<String, ChannelPair>,
) -> TaskResult {
    let now = Utc::now();

    if let Some(origin) = upstream_failure(task, store).await {
        debug!(instance_id = %task.instance_id, %origin, "skipped: upstream failure");
        return TaskResult::skip_upstream(origin, now);
    }

    let resolved_config = match interpolate::interpolate_config(&task.config, store, &task.instance_id).await {
        Ok(v) => v,
        Err(err) => {
            return TaskResult::failure(
                TaskErrorInfo::new(TaskErrorKind::Reference, err.to_string()),
                now,
                0,
            )
        }
    };

    if let Some(cond) = &task.condition {
        match cond.evaluate(store, &task.instance_id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(instance_id = %task.instance_id, "skipped: condition false");
                return TaskResult::skip(now);
            }
            Err(err) => {
                return TaskResult::failure(
                    TaskErrorInfo::new(TaskErrorKind::Condition, err.to_string()),
                    now,
                    0,
                )
            }
        }
    }

    if task.is_fan_out() {
        return run_fan_out(task, store, registry, cache, default_ttl, include_source_hash, cancel_rx, inflight, now).await;
    }

    run_singleton(
        task,
        resolved_config,
        store,
        registry,
        cache,
        default_ttl,
        include_source_hash,
        stream_capacity,
        cancel_rx,
        inflight,
        channels,
        now,
    )
    .await
}

/// `Some(origin)` if a declared dependency ended in an actual failure (not
/// a benign skip); the origin propagates through chained skips so a
/// dependent three hops downstream still cites the original failure.
async fn upstream_failure(task: &TaskSpec, store: &ValueStore) -> Option<String> {
    for dep in &task.dependencies {
        let Some(result) = store.get(dep).await else {
            continue;
        };
        if !result.success {
            return Some(dep.clone());
        }
        if result.skipped {
            if let Some(err) = &result.error {
                if err.kind == TaskErrorKind::Upstream {
                    return err.origin.clone().or_else(|| Some(dep.clone()));
                }
            }
        }
    }
    None
}

#[allow(clippy::too_many_arguments)]
async fn run_singleton(
    task: &TaskSpec,
    resolved_config: Value,
    store: &ValueStore,
    registry: &TaskRegistry,
    cache: Option<&Arc<dyn CacheProvider>>,
    default_ttl: Option<u64>,
    include_source_hash: bool,
    stream_capacity: usize,
    cancel_rx: watch::Receiver<bool>,
    inflight: &Arc<DashMap<String, Arc<Notify>>>,
    channels: &DashMap<String, ChannelPair>,
    now: chrono::DateTime<Utc>,
) -> TaskResult {
    let fingerprint_key = if task.cache_enabled {
        Some(
            compute_fingerprint(task, &resolved_config, store, include_source_hash).await,
        )
    } else {
        None
    };

    if let (Some(cache), Some(key)) = (cache, fingerprint_key.as_ref()) {
        if let Some(entry) = acquire_or_await_cache(cache, key, inflight).await {
            return TaskResult::success(entry.value, now, 1);
        }
    }

    let stream_handle = stream_handle_for(task, stream_capacity, channels).await;
    let producer_sender = stream_handle.as_ref().and_then(|handle| match handle {
        StreamHandle::Producer(sender) => Some(sender.clone()),
        StreamHandle::Consumer(_) => None,
    });

    let built = registry.create_task(&task.task_type, &task.instance_id, resolved_config);
    let result = match built {
        Ok(runnable) => {
            let runnable: Arc<dyn Task> = Arc::from(runnable);
            let ctx = TaskContext::new(task.instance_id.clone(), cancel_rx);
            let ctx = match stream_handle {
                Some(handle) => ctx.with_stream(handle),
                None => ctx,
            };
            execute_with_retry(runnable, ctx, &task.retry, task.timeout_seconds, task.produces_stream, task.consumes_stream.is_some(), now).await
        }
        Err(err) => TaskResult::failure(TaskErrorInfo::new(TaskErrorKind::Task, err.to_string()), now, 0),
    };

    if let Some(sender) = producer_sender {
        sender.close(!result.success).await;
    }

    if let (Some(cache), Some(key)) = (cache, fingerprint_key.as_ref()) {
        if result.success {
            let ttl = task.cache_ttl.or(default_ttl);
            match cache.put(key, CacheEntry::new(result.output.clone(), ttl)).await {
                Ok(()) => debug!(instance_id = %task.instance_id, %key, "cache write"),
                Err(err) => warn!(instance_id = %task.instance_id, %err, "cache write failed, result still delivered"),
            }
        }
        release_inflight(key, inflight);
    }

    result
}

async fn compute_fingerprint(
    task: &TaskSpec,
    resolved_config: &Value,
    store: &ValueStore,
    include_source_hash: bool,
) -> String {
    let mut upstream_fps = Vec::new();
    for root in interpolate::referenced_root_keys(&task.config) {
        if let Ok((result, _rest)) = store.resolve_root(&root, &task.instance_id).await {
            upstream_fps.push(cache::output_fingerprint(&result));
        }
    }
    let type_key = if include_source_hash {
        format!("{}:source-hash-disabled-by-default", task.task_type)
    } else {
        task.task_type.clone()
    };
    cache::fingerprint(&type_key, resolved_config, &upstream_fps)
}

/// Register this call as the sole computer of `key`, or wait for the
/// in-flight computer to finish and reuse the cache entry it produced.
/// Returns `None` when this call is responsible for computing the value
/// (cache miss, or no concurrent owner to wait on).
async fn acquire_or_await_cache(
    cache: &Arc<dyn CacheProvider>,
    key: &str,
    inflight: &Arc<DashMap<String, Arc<Notify>>>,
) -> Option<CacheEntry> {
    loop {
        if let Ok(Some(entry)) = cache.get(key).await {
            debug!(%key, "cache hit");
            return Some(entry);
        }

        let notify = {
            use dashmap::mapref::entry::Entry;
            match inflight.entry(key.to_string()) {
                Entry::Occupied(e) => Some(e.get().clone()),
                Entry::Vacant(e) => {
                    e.insert(Arc::new(Notify::new()));
                    None
                }
            }
        };

        match notify {
            Some(notify) => notify.notified().await,
            None => {
                debug!(%key, "cache miss, computing");
                return None;
            }
        }
    }
}

fn release_inflight(key: &str, inflight: &Arc<DashMap<String, Arc<Notify>>>) {
    if let Some((_, notify)) = inflight.remove(key) {
        notify.notify_waiters();
    }
}

async fn stream_handle_for(
    task: &TaskSpec,
    stream_capacity: usize,
    channels: &DashMap<String, ChannelPair>,
) -> Option<StreamHandle> {
    if task.produces_stream {
        let pair = ensure_channel(&task.instance_id, stream_capacity, channels);
        Some(StreamHandle::Producer(pair.0))
    } else if let Some(producer_id) = &task.consumes_stream {
        let pair = ensure_channel(producer_id, stream_capacity, channels);
        Some(StreamHandle::Consumer(pair.1))
    } else {
        None
    }
}

fn ensure_channel(producer_id: &str, capacity: usize, channels: &DashMap<String, ChannelPair>) -> ChannelPair {
    use dashmap::mapref::entry::Entry;
    match channels.entry(producer_id.to_string()) {
        Entry::Occupied(e) => e.get().clone(),
        Entry::Vacant(e) => {
            let (tx, rx) = stream::channel(capacity);
            let pair = (tx, Arc::new(AsyncMutex::new(rx)));
            e.insert(pair.clone());
            pair
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn execute_with_retry(
    task: Arc<dyn Task>,
    ctx: TaskContext,
    retry: &RetryPolicy,
    timeout_seconds: Option<f64>,
    is_producer: bool,
    is_consumer: bool,
    started_at: chrono::DateTime<Utc>,
) -> TaskResult {
    let mut attempts = 0;
    loop {
        attempts += 1;
        if ctx.is_cancelled() {
            return TaskResult::failure(
                TaskErrorInfo::new(TaskErrorKind::Cancelled, "workflow cancelled before task started"),
                started_at,
                attempts,
            );
        }

        match run_single_attempt(Arc::clone(&task), ctx.clone(), timeout_seconds, is_producer, is_consumer).await {
            Ok(value) => return TaskResult::success(value, started_at, attempts),
            Err(err_info) => {
                let retriable = !matches!(err_info.kind, TaskErrorKind::Reference | TaskErrorKind::Cancelled);
                if !retriable || attempts >= retry.max_attempts {
                    return TaskResult::failure(err_info, started_at, attempts);
                }
                if retry.backoff_seconds > 0.0 {
                    tokio::time::sleep(Duration::from_secs_f64(retry.backoff_seconds)).await;
                }
            }
        }
    }
}

/// Window given to a timed-out task to notice `is_cancelled()` and return on
/// its own before the future is forcibly aborted.
const TIMEOUT_GRACE: Duration = Duration::from_millis(250);

async fn run_single_attempt(
    task: Arc<dyn Task>,
    ctx: TaskContext,
    timeout_seconds: Option<f64>,
    is_producer: bool,
    is_consumer: bool,
) -> std::result::Result<Value, TaskErrorInfo> {
    let (timeout_tx, timeout_rx) = watch::channel(false);
    let ctx = ctx.with_timeout_cancel(timeout_rx);
    let mut handle = tokio::spawn(async move {
        if is_producer {
            task.stream_output(&ctx).await
        } else if is_consumer {
            task.consume_stream(&ctx).await
        } else {
            task.execute(&ctx).await
        }
    });

    let outcome = match timeout_seconds {
        Some(secs) => {
            tokio::select! {
                res = &mut handle => Some(res),
                () = tokio::time::sleep(Duration::from_secs_f64(secs)) => None,
            }
        }
        None => Some((&mut handle).await),
    };

    match outcome {
        Some(Ok(Ok(value))) => Ok(value),
        Some(Ok(Err(task_err))) => Err(TaskErrorInfo::new(TaskErrorKind::Task, task_err.to_string())),
        Some(Err(join_err)) => Err(TaskErrorInfo::new(TaskErrorKind::Task, join_err.to_string())),
        None => {
            let _ = timeout_tx.send(true);
            if tokio::time::timeout(TIMEOUT_GRACE, &mut handle).await.is_err() {
                handle.abort();
            }
            Err(TaskErrorInfo::new(TaskErrorKind::Timeout, "task exceeded its timeout_seconds budget"))
        }
    }
}

/// Resolve `for_each`, manufacture one child per element, run them bounded
/// by `max_concurrent`, and aggregate into the parent's `TaskResult`.
#[allow(clippy::too_many_arguments)]
async fn run_fan_out(
    task: &TaskSpec,
    store: &ValueStore,
    registry: &TaskRegistry,
    cache: Option<&Arc<dyn CacheProvider>>,
    default_ttl: Option<u64>,
    include_source_hash: bool,
    cancel_rx: watch::Receiver<bool>,
    inflight: &Arc<DashMap<String, Arc<Notify>>>,
    now: chrono::DateTime<Utc>,
) -> TaskResult {
    let for_each_path = task
        .for_each
        .as_ref()
        .expect("run_fan_out only called for fan-out tasks");
    let items = match store.get_path(for_each_path, &task.instance_id).await {
        Ok(Value::Array(items)) => items,
        Ok(_) => {
            return TaskResult::failure(
                TaskErrorInfo::new(
                    TaskErrorKind::Reference,
                    format!("for_each path '{for_each_path}' did not resolve to a sequence"),
                ),
                now,
                0,
            )
        }
        Err(err) => {
            return TaskResult::failure(TaskErrorInfo::new(TaskErrorKind::Reference, err.to_string()), now, 0)
        }
    };

    let template = task
        .config_template
        .as_ref()
        .expect("validated: config_template present for fan-out");
    let semaphore = Arc::new(Semaphore::new(task.max_concurrent.max(1)));
    let mut joinset: JoinSet<(usize, TaskResult)> = JoinSet::new();

    for (index, element) in items.iter().enumerate() {
        let resolved_config = match interpolate::interpolate_template(template, element) {
            Ok(v) => v,
            Err(err) => {
                joinset.spawn(async move {
                    (
                        index,
                        TaskResult::failure(TaskErrorInfo::new(TaskErrorKind::Reference, err.to_string()), Utc::now(), 0),
                    )
                });
                continue;
            }
        };

        let semaphore = Arc::clone(&semaphore);
        let task_type = task.task_type.clone();
        let child_id = format!("{}[{index}]", task.instance_id);
        let registry = registry.clone();
        let cache = cache.cloned();
        let store = store.clone();
        let cancel_rx = cancel_rx.clone();
        let inflight = Arc::clone(inflight);
        let retry = task.retry.clone();
        let timeout_seconds = task.timeout_seconds;
        let cache_enabled = task.cache_enabled;
        let cache_ttl = task.cache_ttl;

        joinset.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore never closes");
            let child_now = Utc::now();

            let fingerprint_key = if cache_enabled {
                let upstream_fps: Vec<String> = Vec::new();
                let type_key = if include_source_hash {
                    format!("{task_type}:source-hash-disabled-by-default")
                } else {
                    task_type.clone()
                };
                Some(cache::fingerprint(&type_key, &resolved_config, &upstream_fps))
            } else {
                None
            };

            if let (Some(cache), Some(key)) = (&cache, fingerprint_key.as_ref()) {
                if let Some(entry) = acquire_or_await_cache(cache, key, &inflight).await {
                    return (index, TaskResult::success(entry.value, child_now, 1));
                }
            }

            let built = registry.create_task(&task_type, &child_id, resolved_config);
            let result = match built {
                Ok(runnable) => {
                    let runnable: Arc<dyn Task> = Arc::from(runnable);
                    let ctx = TaskContext::new(child_id.clone(), cancel_rx);
                    execute_with_retry(runnable, ctx, &retry, timeout_seconds, false, false, child_now).await
                }
                Err(err) => TaskResult::failure(TaskErrorInfo::new(TaskErrorKind::Task, err.to_string()), child_now, 0),
            };

            if let (Some(cache), Some(key)) = (&cache, fingerprint_key.as_ref()) {
                if result.success {
                    let ttl = cache_ttl.or(default_ttl);
                    if let Err(err) = cache.put(key, CacheEntry::new(result.output.clone(), ttl)).await {
                        warn!(instance_id = %child_id, %err, "cache write failed, result still delivered");
                    }
                }
                release_inflight(key, &inflight);
            }

            let _ = store; // children are not individually addressable; nothing to publish here.
            (index, result)
        });
    }

    let mut children: Vec<Option<TaskResult>> = (0..items.len()).map(|_| None).collect();
    while let Some(joined) = joinset.join_next().await {
        let (index, result) = joined.expect("fan-out child future never panics under normal operation");
        if let Some(slot) = children.get_mut(index) {
            *slot = Some(result);
        }
    }
    let children: Vec<TaskResult> = children.into_iter().map(|c| c.expect("every index populated")).collect();

    let success_count = children.iter().filter(|c| c.success).count();
    let failure_count = children.len() - success_count;

    if !children.is_empty() && success_count == 0 {
        return TaskResult::failure(
            TaskErrorInfo::new(TaskErrorKind::Task, "all fan-out children failed"),
            now,
            1,
        );
    }

    let aggregate = serde_json::json!({
        "results": children.iter().map(|c| c.output.clone()).collect::<Vec<_>>(),
        "success_count": success_count,
        "failure_count": failure_count,
        "items": items,
    });
    TaskResult::success(aggregate, now, 1)
}

/// `WorkflowSpec::cache` convenience used by `Scheduler::new`.
trait CacheSpecExt {
    fn default_ttl_opt(&self) -> Option<u64>;
}

impl CacheSpecExt for crate::spec::CacheSpec {
    fn default_ttl_opt(&self) -> Option<u64> {
        self.default_ttl()
    }
}

/// A programmatic construction API, an alternative to loading a
/// declarative template.
pub struct WorkflowBuilder {
    name: String,
    registry: TaskRegistry,
    tasks: HashMap<String, TaskSpec>,
    cache: Option<crate::spec::CacheSpec>,
}

impl WorkflowBuilder {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            registry: TaskRegistry::new(),
            tasks: HashMap::new(),
            cache: None,
        }
    }

    pub fn register<C>(&mut self, type_name: impl Into<String>, ctor: C) -> &mut Self
    where
        C: Fn(&str, Value) -> Box<dyn Task> + Send + Sync + 'static,
    {
        self.registry.register(type_name, ctor);
        self
    }

    pub fn register_function(&mut self, type_name: impl Into<String>, func: BoxedFn) -> &mut Self {
        self.registry.register_function(type_name, func);
        self
    }

    pub fn with_cache(&mut self, cache: crate::spec::CacheSpec) -> &mut Self {
        self.cache = Some(cache);
        self
    }

    /// Declare a task instance. Its `TaskSpec::instance_id` is set to
    /// `instance_id` regardless of what was passed in.
    pub fn create_task(&mut self, instance_id: impl Into<String>, mut task: TaskSpec) -> &mut Self {
        let instance_id = instance_id.into();
        task.instance_id = instance_id.clone();
        self.tasks.insert(instance_id, task);
        self
    }

    /// Add an edge `child` depends on `parent`, independent of whatever the
    /// task's own `dependencies` field already says.
    pub fn add_dependency(&mut self, child: &str, parent: &str) -> &mut Self {
        if let Some(task) = self.tasks.get_mut(child) {
            if !task.dependencies.contains(&parent.to_string()) {
                task.dependencies.push(parent.to_string());
            }
        }
        self
    }

    pub async fn build(self, config: WorkflowEngineConfig) -> Result<Scheduler> {
        info!(workflow = %self.name, tasks = self.tasks.len(), "building workflow");
        let spec = WorkflowSpec {
            name: self.name,
            cache: self.cache,
            tasks: self.tasks,
            dependencies: HashMap::new(),
        }
        .finalize();
        Scheduler::new(spec, self.registry, None, config).await
    }
}

impl From<registry::Error> for Error {
    fn from(source: registry::Error) -> Self {
        Error::Validation {
            message: source.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::indexing_slicing)]
    use super::*;
    use crate::condition::{Condition, Operator, StructuredCondition};
    use crate::spec::RetryPolicy;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo;

    #[async_trait]
    impl Task for Echo {
        async fn execute(&self, _ctx: &TaskContext) -> crate::task::Result<Value> {
            Ok(json!({"ok": true}))
        }
    }

    struct Stats;

    #[async_trait]
    impl Task for Stats {
        async fn execute(&self, ctx: &TaskContext) -> crate::task::Result<Value> {
            let _ = ctx;
            Ok(json!({"count": 3, "average": 20, "max": 30, "min": 10}))
        }
    }

    fn base_task(task_type: &str) -> TaskSpec {
        TaskSpec {
            instance_id: String::new(),
            task_type: task_type.to_string(),
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
        }
    }

    #[tokio::test]
    async fn linear_chain_with_interpolation() {
        let mut builder = WorkflowBuilder::new("linear");
        builder.register_function(
            "generator",
            Arc::new(|_config: Value| {
                Box::pin(async move { Ok(json!({"numbers": [10, 20, 30]})) })
                    as futures::future::BoxFuture<'static, std::result::Result<Value, String>>
            }),
        );
        builder.register("aggregator", |_id, config| {
            Box::new(AggregatorTask(config)) as Box<dyn Task>
        });
        builder.register("saver", |_id, config| Box::new(SaverTask(config)) as Box<dyn Task>);

        builder.create_task("gen", base_task("generator"));
        let mut stats = base_task("aggregator");
        stats.config = json!({"input": "${gen.numbers}"});
        stats.dependencies = vec!["gen".to_string()];
        builder.create_task("stats", stats);
        let mut save = base_task("saver");
        save.config = json!({"content": "avg=${stats.average}"});
        save.dependencies = vec!["stats".to_string()];
        builder.create_task("save", save);

        let scheduler = builder.build(WorkflowEngineConfig::default()).await.unwrap();
        let results = scheduler.run().await.unwrap();

        assert_eq!(results["stats"].output, json!({"count": 3, "average": 20, "max": 30, "min": 10}));
        assert_eq!(results["save"].output, json!({"content": "avg=20"}));
    }

    struct AggregatorTask(Value);
    #[async_trait]
    impl Task for AggregatorTask {
        async fn execute(&self, _ctx: &TaskContext) -> crate::task::Result<Value> {
            let numbers: Vec<i64> = self.0["input"]
                .as_array()
                .unwrap()
                .iter()
                .map(|v| v.as_i64().unwrap())
                .collect();
            let sum: i64 = numbers.iter().sum();
            Ok(json!({
                "count": numbers.len(),
                "average": sum / numbers.len() as i64,
                "max": numbers.iter().max().unwrap(),
                "min": numbers.iter().min().unwrap(),
            }))
        }
    }

    struct SaverTask(Value);
    #[async_trait]
    impl Task for SaverTask {
        async fn execute(&self, _ctx: &TaskContext) -> crate::task::Result<Value> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn condition_gates_exactly_one_branch() {
        let mut builder = WorkflowBuilder::new("branch");
        builder.register("stats", |_id, _cfg| Box::new(Stats) as Box<dyn Task>);
        builder.register("noop", |_id, _cfg| Box::new(Echo) as Box<dyn Task>);

        builder.create_task("stats", base_task("stats"));
        let mut big = base_task("noop");
        big.dependencies = vec!["stats".to_string()];
        big.condition = Some(Condition::Structured(StructuredCondition {
            operator: Operator::Gt,
            value: json!(50),
            path: "stats.average".to_string(),
        }));
        builder.create_task("big", big);
        let mut small = base_task("noop");
        small.dependencies = vec!["stats".to_string()];
        small.condition = Some(Condition::Structured(StructuredCondition {
            operator: Operator::Lte,
            value: json!(50),
            path: "stats.average".to_string(),
        }));
        builder.create_task("small", small);

        let scheduler = builder.build(WorkflowEngineConfig::default()).await.unwrap();
        let results = scheduler.run().await.unwrap();

        assert!(results["big"].skipped);
        assert!(!results["small"].skipped);
    }

    #[tokio::test]
    async fn cache_hit_on_second_identical_run() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        struct Counted;
        #[async_trait]
        impl Task for Counted {
            async fn execute(&self, _ctx: &TaskContext) -> crate::task::Result<Value> {
                CALLS.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"v": 1}))
            }
        }

        let cache: Arc<dyn CacheProvider> = Arc::new(crate::cache::memory::MemoryCache::new(10));

        for _ in 0..2 {
            let mut registry = TaskRegistry::new();
            registry.register("compute", |_id, _cfg| Box::new(Counted) as Box<dyn Task>);
            let mut tasks = HashMap::new();
            let mut compute = base_task("compute");
            compute.cache_enabled = true;
            compute.cache_ttl = Some(300);
            tasks.insert("compute".to_string(), compute);
            let spec = WorkflowSpec {
                name: "cache".to_string(),
                cache: None,
                tasks,
                dependencies: HashMap::new(),
            }
            .finalize();
            let scheduler = Scheduler::new(spec, registry, Some(Arc::clone(&cache)), WorkflowEngineConfig::default())
                .await
                .unwrap();
            let results = scheduler.run().await.unwrap();
            assert_eq!(results["compute"].output, json!({"v": 1}));
        }

        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().await.hits, 1);
    }

    #[tokio::test]
    async fn fan_out_respects_max_concurrent_and_orders_results() {
        static CONCURRENT: AtomicUsize = AtomicUsize::new(0);
        static MAX_OBSERVED: AtomicUsize = AtomicUsize::new(0);
        struct Check;
        #[async_trait]
        impl Task for Check {
            async fn execute(&self, ctx: &TaskContext) -> crate::task::Result<Value> {
                let _ = ctx;
                let current = CONCURRENT.fetch_add(1, Ordering::SeqCst) + 1;
                MAX_OBSERVED.fetch_max(current, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                CONCURRENT.fetch_sub(1, Ordering::SeqCst);
                Ok(json!({"domain": ctx.instance_id.clone()}))
            }
        }

        struct ScanTask;
        #[async_trait]
        impl Task for ScanTask {
            async fn execute(&self, _ctx: &TaskContext) -> crate::task::Result<Value> {
                Ok(json!({"subdomains": (0..12).map(|i| format!("s{i}.example.com")).collect::<Vec<_>>()}))
            }
        }

        let mut registry = TaskRegistry::new();
        registry.register("scan", |_id, _cfg| Box::new(ScanTask) as Box<dyn Task>);
        registry.register("check", |_id, _cfg| Box::new(Check) as Box<dyn Task>);

        let mut check = base_task("check");
        check.for_each = Some("scan.subdomains".to_string());
        check.config_template = Some(json!({"domain": "$."}));
        check.max_concurrent = 5;
        check.dependencies = vec!["scan".to_string()];

        let mut tasks = HashMap::new();
        tasks.insert("scan".to_string(), base_task("scan"));
        tasks.insert("check".to_string(), check);
        let spec = WorkflowSpec {
            name: "fanout".to_string(),
            cache: None,
            tasks,
            dependencies: HashMap::new(),
        }
        .finalize();

        let scheduler = Scheduler::new(spec, registry, None, WorkflowEngineConfig::default())
            .await
            .unwrap();
        let results = scheduler.run().await.unwrap();

        assert_eq!(results["check"].output["items"].as_array().unwrap().len(), 12);
        assert_eq!(results["check"].output["success_count"], json!(12));
        assert!(MAX_OBSERVED.load(Ordering::SeqCst) <= 5);
    }

    #[tokio::test]
    async fn retry_succeeds_on_third_attempt() {
        static ATTEMPT: AtomicUsize = AtomicUsize::new(0);
        struct Flaky;
        #[async_trait]
        impl Task for Flaky {
            async fn execute(&self, _ctx: &TaskContext) -> crate::task::Result<Value> {
                let n = ATTEMPT.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    return Err(crate::task::Error::Execution {
                        message: "not yet".to_string(),
                    });
                }
                Ok(json!({"done": true}))
            }
        }

        let mut registry = TaskRegistry::new();
        registry.register("flaky", |_id, _cfg| Box::new(Flaky) as Box<dyn Task>);
        let mut tasks = HashMap::new();
        let mut t = base_task("flaky");
        t.retry = RetryPolicy {
            max_attempts: 3,
            backoff_seconds: 0.0,
        };
        tasks.insert("t".to_string(), t);
        let spec = WorkflowSpec {
            name: "retry".to_string(),
            cache: None,
            tasks,
            dependencies: HashMap::new(),
        }
        .finalize();
        let scheduler = Scheduler::new(spec, registry, None, WorkflowEngineConfig::default())
            .await
            .unwrap();
        let results = scheduler.run().await.unwrap();
        assert!(results["t"].success);
        assert_eq!(results["t"].attempts, 3);
    }

    #[tokio::test]
    async fn upstream_failure_propagates_without_aborting_unrelated_subgraph() {
        struct Boom;
        #[async_trait]
        impl Task for Boom {
            async fn execute(&self, _ctx: &TaskContext) -> crate::task::Result<Value> {
                Err(crate::task::Error::Execution {
                    message: "boom".to_string(),
                })
            }
        }

        let mut registry = TaskRegistry::new();
        registry.register("boom", |_id, _cfg| Box::new(Boom) as Box<dyn Task>);
        registry.register("noop", |_id, _cfg| Box::new(Echo) as Box<dyn Task>);

        let mut tasks = HashMap::new();
        tasks.insert("a".to_string(), base_task("boom"));
        let mut b = base_task("noop");
        b.dependencies = vec!["a".to_string()];
        tasks.insert("b".to_string(), b);
        tasks.insert("c".to_string(), base_task("noop"));

        let spec = WorkflowSpec {
            name: "upstream".to_string(),
            cache: None,
            tasks,
            dependencies: HashMap::new(),
        }
        .finalize();
        let scheduler = Scheduler::new(spec, registry, None, WorkflowEngineConfig::default())
            .await
            .unwrap();
        let results = scheduler.run().await.unwrap();

        assert!(!results["a"].success);
        assert!(results["b"].skipped);
        assert_eq!(results["b"].error.as_ref().unwrap().origin.as_deref(), Some("a"));
        assert!(results["c"].success);
        assert!(!results["c"].skipped);
    }

    #[tokio::test]
    async fn validation_rejects_cycles() {
        let mut registry = TaskRegistry::new();
        registry.register("noop", |_id, _cfg| Box::new(Echo) as Box<dyn Task>);
        let mut tasks = HashMap::new();
        let mut a = base_task("noop");
        a.dependencies = vec!["b".to_string()];
        let mut b = base_task("noop");
        b.dependencies = vec!["a".to_string()];
        tasks.insert("a".to_string(), a);
        tasks.insert("b".to_string(), b);
        let spec = WorkflowSpec {
            name: "cyclic".to_string(),
            cache: None,
            tasks,
            dependencies: HashMap::new(),
        }
        .finalize();
        let result = Scheduler::new(spec, registry, None, WorkflowEngineConfig::default()).await;
        match result {
            Err(Error::Validation { .. }) => {}
            other => panic!("expected a validation error, got {}", other.is_ok()),
        }
    }

    struct Producer;
    #[async_trait]
    impl Task for Producer {
        async fn execute(&self, _ctx: &TaskContext) -> crate::task::Result<Value> {
            unreachable!("producer tasks run through stream_output")
        }

        async fn stream_output(&self, ctx: &TaskContext) -> crate::task::Result<Value> {
            let StreamHandle::Producer(sender) = ctx.stream.as_ref().unwrap() else {
                panic!("producer task did not get a producer stream handle");
            };
            for n in [1, 2, 3] {
                sender.publish(json!(n)).await;
            }
            Ok(json!({"published": 3}))
        }
    }

    struct Consumer;
    #[async_trait]
    impl Task for Consumer {
        async fn execute(&self, _ctx: &TaskContext) -> crate::task::Result<Value> {
            unreachable!("consumer tasks run through consume_stream")
        }

        async fn consume_stream(&self, ctx: &TaskContext) -> crate::task::Result<Value> {
            let StreamHandle::Consumer(receiver) = ctx.stream.as_ref().unwrap() else {
                panic!("consumer task did not get a consumer stream handle");
            };
            let mut receiver = receiver.lock().await;
            let mut sum = 0i64;
            let mut failed = false;
            loop {
                match receiver.recv().await {
                    Some(stream::StreamMessage::Item(v)) => sum += v.as_i64().unwrap_or(0),
                    Some(stream::StreamMessage::End { failed: f }) => {
                        failed = f;
                        break;
                    }
                    None => break,
                }
            }
            Ok(json!({"sum": sum, "producer_failed": failed}))
        }
    }

    #[tokio::test]
    async fn consumer_drains_every_item_and_observes_producer_end() {
        let mut builder = WorkflowBuilder::new("streaming");
        builder.register("producer", |_id, _cfg| Box::new(Producer) as Box<dyn Task>);
        builder.register("consumer", |_id, _cfg| Box::new(Consumer) as Box<dyn Task>);

        let mut producer = base_task("producer");
        producer.produces_stream = true;
        builder.create_task("gen", producer);

        let mut consumer = base_task("consumer");
        consumer.consumes_stream = Some("gen".to_string());
        builder.create_task("sink", consumer);

        let scheduler = builder.build(WorkflowEngineConfig::default()).await.unwrap();
        let results = tokio::time::timeout(Duration::from_secs(5), scheduler.run())
            .await
            .expect("consumer must not hang waiting on stream end")
            .unwrap();

        assert_eq!(results["gen"].output, json!({"published": 3}));
        assert_eq!(results["sink"].output, json!({"sum": 6, "producer_failed": false}));
    }

    #[tokio::test]
    async fn consumer_sees_failed_flag_when_producer_errors() {
        struct FailingProducer;
        #[async_trait]
        impl Task for FailingProducer {
            async fn execute(&self, _ctx: &TaskContext) -> crate::task::Result<Value> {
                unreachable!("producer tasks run through stream_output")
            }

            async fn stream_output(&self, ctx: &TaskContext) -> crate::task::Result<Value> {
                let StreamHandle::Producer(sender) = ctx.stream.as_ref().unwrap() else {
                    panic!("producer task did not get a producer stream handle");
                };
                sender.publish(json!(1)).await;
                Err(crate::task::Error::Execution {
                    message: "producer blew up mid-stream".to_string(),
                })
            }
        }

        let mut builder = WorkflowBuilder::new("streaming-failure");
        builder.register("producer", |_id, _cfg| Box::new(FailingProducer) as Box<dyn Task>);
        builder.register("consumer", |_id, _cfg| Box::new(Consumer) as Box<dyn Task>);

        let mut producer = base_task("producer");
        producer.produces_stream = true;
        builder.create_task("gen", producer);

        let mut consumer = base_task("consumer");
        consumer.consumes_stream = Some("gen".to_string());
        builder.create_task("sink", consumer);

        let scheduler = builder.build(WorkflowEngineConfig::default()).await.unwrap();
        let results = tokio::time::timeout(Duration::from_secs(5), scheduler.run())
            .await
            .expect("consumer must not hang when the producer fails mid-stream")
            .unwrap();

        assert!(!results["gen"].success);
        assert_eq!(results["sink"].output, json!({"sum": 1, "producer_failed": true}));
    }
}
