//! In-process LRU cache backend, bounded by entry count.

use async_trait::async_trait;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use super::{CacheEntry, CacheProvider, CacheStats, Result};

pub struct MemoryCache {
    inner: Mutex<Inner>,
}

struct Inner {
    entries: LruCache<String, CacheEntry>,
    stats: CacheStats,
}

impl MemoryCache {
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        let capacity = NonZeroUsize::new(max_size.max(1)).unwrap();
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(capacity),
                stats: CacheStats::default(),
            }),
        }
    }
}

#[async_trait]
impl CacheProvider for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let mut inner = self.inner.lock().unwrap();
        let hit = match inner.entries.get(key) {
            Some(entry) if entry.is_expired() => {
                inner.entries.pop(key);
                None
            }
            Some(entry) => Some(entry.clone()),
            None => None,
        };
        inner.stats.size = inner.entries.len() as u64;
        if hit.is_some() {
            inner.stats.hits += 1;
        } else {
            inner.stats.misses += 1;
        }
        Ok(hit)
    }

    async fn put(&self, key: &str, entry: CacheEntry) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.put(key.to_string(), entry);
        inner.stats.puts += 1;
        inner.stats.size = inner.entries.len() as u64;
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.pop(key);
        inner.stats.size = inner.entries.len() as u64;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.stats.size = 0;
        Ok(())
    }

    async fn cleanup_expired(&self) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired())
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            inner.entries.pop(key);
        }
        inner.stats.size = inner.entries.len() as u64;
        Ok(expired.len())
    }

    async fn stats(&self) -> CacheStats {
        self.inner.lock().unwrap().stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn put_then_get_hits() {
        let cache = MemoryCache::new(10);
        cache.put("a", CacheEntry::new(json!(1), None)).await.unwrap();
        let hit = cache.get("a").await.unwrap();
        assert_eq!(hit.unwrap().value, json!(1));
        assert_eq!(cache.stats().await.hits, 1);
    }

    #[tokio::test]
    async fn miss_is_counted() {
        let cache = MemoryCache::new(10);
        assert!(cache.get("missing").await.unwrap().is_none());
        assert_eq!(cache.stats().await.misses, 1);
    }

    #[tokio::test]
    async fn lru_evicts_least_recently_used() {
        let cache = MemoryCache::new(2);
        cache.put("a", CacheEntry::new(json!(1), None)).await.unwrap();
        cache.put("b", CacheEntry::new(json!(2), None)).await.unwrap();
        cache.put("c", CacheEntry::new(json!(3), None)).await.unwrap();
        assert!(cache.get("a").await.unwrap().is_none());
        assert!(cache.get("b").await.unwrap().is_some());
        assert!(cache.get("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_entry_is_a_miss_and_evicted() {
        let cache = MemoryCache::new(10);
        let mut entry = CacheEntry::new(json!(1), Some(300));
        entry.expires_at = Some(chrono::Utc::now() - chrono::Duration::seconds(1));
        cache.put("a", entry).await.unwrap();
        assert!(cache.get("a").await.unwrap().is_none());
        assert_eq!(cache.stats().await.size, 0);
    }

    #[tokio::test]
    async fn cleanup_expired_removes_stale_entries() {
        let cache = MemoryCache::new(10);
        let mut entry = CacheEntry::new(json!(1), Some(300));
        entry.expires_at = Some(chrono::Utc::now() - chrono::Duration::seconds(1));
        cache.put("a", entry).await.unwrap();
        cache.put("b", CacheEntry::new(json!(2), None)).await.unwrap();
        let removed = cache.cleanup_expired().await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(cache.stats().await.size, 1);
    }
}
