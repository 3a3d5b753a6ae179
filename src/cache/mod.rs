//! Pluggable task-result cache. Backends are dumb
//! key/blob stores; fingerprinting and TTL policy live here, not in the
//! individual backends.

pub mod file;
pub mod memory;
pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use snafu::prelude::*;

use crate::value::canonical_json;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("cache backend error: {message}"))]
    Backend { message: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// A cached task output together with its expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    #[must_use]
    pub fn new(value: Value, ttl_seconds: Option<u64>) -> Self {
        let created_at = Utc::now();
        let expires_at = ttl_seconds.map(|s| created_at + chrono::Duration::seconds(s as i64));
        Self {
            value,
            created_at,
            expires_at,
        }
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| exp <= Utc::now())
    }
}

/// Cumulative counters for one cache instance's lifetime.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub size: u64,
}

/// Contract every cache backend implements.
#[async_trait]
pub trait CacheProvider: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;
    async fn put(&self, key: &str, entry: CacheEntry) -> Result<()>;
    async fn invalidate(&self, key: &str) -> Result<()>;
    async fn clear(&self) -> Result<()>;
    /// Scan for and drop expired entries, returning how many were removed.
    async fn cleanup_expired(&self) -> Result<usize>;
    async fn stats(&self) -> CacheStats;
}

/// Computes the stable fingerprint of a task invocation: its type,
/// canonically-serialized resolved config, and the fingerprints of
/// upstream outputs it references. Hashing the task's own source is
/// deliberately left out and off by default; see DESIGN.md.
///
/// `upstream_fingerprints` carries the fingerprints of every dependency
/// output actually referenced by the interpolated config, so two
/// structurally different graphs producing identical effective inputs
/// hit the same cache line.
#[must_use]
pub fn fingerprint(task_type: &str, resolved_config: &Value, upstream_fingerprints: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(task_type.as_bytes());
    hasher.update(b"\0");
    hasher.update(canonical_json(resolved_config).as_bytes());
    hasher.update(b"\0");
    let mut sorted = upstream_fingerprints.to_vec();
    sorted.sort();
    for fp in sorted {
        hasher.update(fp.as_bytes());
        hasher.update(b",");
    }
    format!("{:x}", hasher.finalize())
}

/// Hash of a task's stored output, used as one dependency's contribution to
/// a downstream fingerprint.
#[must_use]
pub fn output_fingerprint(result: &crate::task::TaskResult) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(&result.output).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Construct the cache backend selected by a template's `cache:` block.
pub async fn build_backend(spec: &crate::spec::CacheSpec) -> Result<std::sync::Arc<dyn CacheProvider>> {
    use crate::spec::CacheSpec;
    match spec {
        CacheSpec::Memory { max_size, .. } => Ok(std::sync::Arc::new(memory::MemoryCache::new(*max_size))),
        CacheSpec::File { cache_dir, .. } => {
            let backend = file::FileCache::new(cache_dir.clone()).await?;
            Ok(std::sync::Arc::new(backend))
        }
        CacheSpec::Redis {
            host,
            port,
            db,
            password,
            key_prefix,
            ..
        } => {
            let url = match password {
                Some(pw) => format!("redis://:{pw}@{host}:{port}/{db}"),
                None => format!("redis://{host}:{port}/{db}"),
            };
            let backend = redis::RedisCache::connect(&url, key_prefix.clone()).await?;
            Ok(std::sync::Arc::new(backend))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fingerprint_is_stable_across_object_key_order() {
        let a = fingerprint("http", &json!({"url": "x", "method": "GET"}), &[]);
        let b = fingerprint("http", &json!({"method": "GET", "url": "x"}), &[]);
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_differs_on_config() {
        let a = fingerprint("http", &json!({"url": "x"}), &[]);
        let b = fingerprint("http", &json!({"url": "y"}), &[]);
        assert_ne!(a, b);
    }

    #[test]
    fn fingerprint_differs_on_upstream() {
        let a = fingerprint("http", &json!({"url": "x"}), &["aaa".to_string()]);
        let b = fingerprint("http", &json!({"url": "x"}), &["bbb".to_string()]);
        assert_ne!(a, b);
    }

    #[test]
    fn entry_expiry() {
        let fresh = CacheEntry::new(json!(1), Some(300));
        assert!(!fresh.is_expired());
        let expired = CacheEntry {
            value: json!(1),
            created_at: Utc::now() - chrono::Duration::seconds(10),
            expires_at: Some(Utc::now() - chrono::Duration::seconds(5)),
        };
        assert!(expired.is_expired());
    }
}
