//! Redis-backed cache: opaque JSON blobs under `<key_prefix><fingerprint>`,
//! server-side TTL via `SET ... EX`.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{CacheEntry, CacheProvider, CacheStats, Result};

pub struct RedisCache {
    conn: ConnectionManager,
    key_prefix: String,
    hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
}

impl RedisCache {
    pub async fn connect(url: &str, key_prefix: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| super::Error::Backend {
            message: format!("failed to create Redis client: {e}"),
        })?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| super::Error::Backend {
                message: format!("failed to connect to Redis: {e}"),
            })?;
        Ok(Self {
            conn,
            key_prefix: key_prefix.into(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            puts: AtomicU64::new(0),
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

#[async_trait]
impl CacheProvider for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(self.full_key(key))
            .await
            .map_err(|e| super::Error::Backend {
                message: format!("GET for '{key}': {e}"),
            })?;
        let hit = raw.and_then(|s| serde_json::from_str::<CacheEntry>(&s).ok());
        if hit.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        Ok(hit)
    }

    async fn put(&self, key: &str, entry: CacheEntry) -> Result<()> {
        let serialized = serde_json::to_string(&entry).map_err(|e| super::Error::Backend {
            message: format!("serializing cache entry for '{key}': {e}"),
        })?;
        let mut conn = self.conn.clone();
        let full_key = self.full_key(key);
        match entry.expires_at {
            Some(expires_at) => {
                let ttl = (expires_at - chrono::Utc::now()).num_seconds().max(1) as u64;
                let _: () = conn
                    .set_ex(full_key, serialized, ttl)
                    .await
                    .map_err(|e| super::Error::Backend {
                        message: format!("SET EX for '{key}': {e}"),
                    })?;
            }
            None => {
                let _: () = conn
                    .set(full_key, serialized)
                    .await
                    .map_err(|e| super::Error::Backend {
                        message: format!("SET for '{key}': {e}"),
                    })?;
            }
        }
        self.puts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .del(self.full_key(key))
            .await
            .map_err(|e| super::Error::Backend {
                message: format!("DEL for '{key}': {e}"),
            })?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", self.key_prefix);
        let keys: Vec<String> = conn
            .keys(&pattern)
            .await
            .map_err(|e| super::Error::Backend {
                message: format!("KEYS for '{pattern}': {e}"),
            })?;
        if !keys.is_empty() {
            let _: () = conn.del(keys).await.map_err(|e| super::Error::Backend {
                message: format!("DEL for cleared keys: {e}"),
            })?;
        }
        Ok(())
    }

    /// No-op: Redis expires keys server-side via `SET ... EX`.
    async fn cleanup_expired(&self) -> Result<usize> {
        Ok(0)
    }

    async fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            size: 0,
        }
    }
}
