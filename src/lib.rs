//! # Weirflow
//!
//! A DAG-based workflow automation engine. Tasks declare dependencies on
//! each other; weirflow resolves the graph, interpolates each task's
//! configuration from upstream outputs, evaluates per-task run conditions,
//! fans dynamic task groups out over a sequence, and dispatches everything
//! concurrently up to a configurable limit — with pluggable result
//! caching, retries, timeouts and cooperative cancellation along the way.
//!
//! ## Core modules
//!
//! - [`spec`] - the static workflow/task definition model, loaded from YAML or JSON
//! - [`template`] - deserializes and canonicalizes workflow specs
//! - [`value`] - dotted-path segment parsing and JSON canonicalization
//! - [`value_store`] - per-run task output store and reference resolution
//! - [`interpolate`] - `${path}` and `$.field` token substitution
//! - [`condition`] - structured and expression-form run conditions
//! - [`task`] - the task contract and result envelope
//! - [`registry`] - maps task `type` strings to constructors
//! - [`stream`] - bounded producer/consumer channel for streaming tasks
//! - [`cache`] - pluggable result cache (memory, file, Redis)
//! - [`scheduler`] - the DAG dispatch loop
//! - [`config`] - engine configuration
//! - [`output`] - console progress reporting

pub mod cache;
pub mod condition;
pub mod config;
pub mod interpolate;
pub mod output;
pub mod registry;
pub mod scheduler;
pub mod spec;
pub mod stream;
pub mod task;
pub mod template;
pub mod value;
pub mod value_store;
