//! Process-wide engine defaults, layered the same way as the rest of this
//! crate's configuration.

use serde::{Deserialize, Serialize};

use crate::spec::CacheSpec;
use crate::stream::DEFAULT_CAPACITY;

/// Engine-wide defaults a caller can override per workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEngineConfig {
    /// Global cap on simultaneously dispatched tasks. `None` means
    /// unbounded.
    #[serde(default)]
    pub max_concurrent: Option<usize>,

    /// Cache backend used when a template declares no `cache:` block and
    /// the caller supplies no explicit backend.
    #[serde(default)]
    pub default_cache: Option<CacheSpec>,

    /// Default bounded-channel capacity for producer/consumer streaming
    /// pairs.
    #[serde(default = "default_stream_capacity")]
    pub stream_capacity: usize,

    /// Whether cache fingerprints additionally hash the task's own source.
    /// Off by default; see DESIGN.md.
    #[serde(default)]
    pub include_source_hash: bool,
}

fn default_stream_capacity() -> usize {
    DEFAULT_CAPACITY
}

impl Default for WorkflowEngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: None,
            default_cache: None,
            stream_capacity: default_stream_capacity(),
            include_source_hash: false,
        }
    }
}

impl WorkflowEngineConfig {
    /// Load configuration from environment variables with a
    /// `WORKFLOW_ENGINE__` prefix, falling back to `Default`.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?)
            .add_source(
                config::Environment::with_prefix("WORKFLOW_ENGINE")
                    .separator("__")
                    .try_parsing(true),
            );
        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_has_unbounded_concurrency_and_no_cache() {
        let cfg = WorkflowEngineConfig::default();
        assert_eq!(cfg.max_concurrent, None);
        assert!(cfg.default_cache.is_none());
        assert_eq!(cfg.stream_capacity, DEFAULT_CAPACITY);
        assert!(!cfg.include_source_hash);
    }

    #[test]
    fn from_env_overrides_defaults() {
        std::env::set_var("WORKFLOW_ENGINE__MAX_CONCURRENT", "4");
        let cfg = WorkflowEngineConfig::from_env().unwrap();
        assert_eq!(cfg.max_concurrent, Some(4));
        std::env::remove_var("WORKFLOW_ENGINE__MAX_CONCURRENT");
    }
}
