//! Maps registry `type` strings to task constructors.

use serde_json::Value;
use snafu::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

use crate::task::{BoxedFn, FunctionTask, Task};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("no task type registered for '{type_name}'"))]
    UnknownType { type_name: String },
}

pub type Result<T> = std::result::Result<T, Error>;

type Constructor = Arc<dyn Fn(&str, Value) -> Box<dyn Task> + Send + Sync>;

/// Maps `type` strings to task constructors. Registration is explicit;
/// lookup failures are graph-validation errors (`ValidationError`).
#[derive(Clone, Default)]
pub struct TaskRegistry {
    constructors: HashMap<String, Constructor>,
}

impl TaskRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task type backed by a full `Task` implementation.
    pub fn register<C>(&mut self, type_name: impl Into<String>, ctor: C)
    where
        C: Fn(&str, Value) -> Box<dyn Task> + Send + Sync + 'static,
    {
        self.constructors.insert(type_name.into(), Arc::new(ctor));
    }

    /// Register a task type backed by a plain async callable, wrapping it
    /// into a `Task` whose `execute` invokes it with the resolved config.
    pub fn register_function(&mut self, type_name: impl Into<String>, func: BoxedFn) {
        self.constructors.insert(
            type_name.into(),
            Arc::new(move |_instance_id: &str, config: Value| -> Box<dyn Task> {
                Box::new(FunctionTask::new(config, func.clone()))
            }),
        );
    }

    #[must_use]
    pub fn contains(&self, type_name: &str) -> bool {
        self.constructors.contains_key(type_name)
    }

    pub fn create_task(
        &self,
        type_name: &str,
        instance_id: &str,
        config: Value,
    ) -> Result<Box<dyn Task>> {
        let ctor = self
            .constructors
            .get(type_name)
            .context(UnknownTypeSnafu {
                type_name: type_name.to_string(),
            })?;
        Ok(ctor(instance_id, config))
    }
}
