//! One-file-per-key cache backend with atomic writes.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;

use super::{CacheEntry, CacheProvider, CacheStats, Result};

pub struct FileCache {
    dir: PathBuf,
    hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
    size: AtomicU64,
}

impl FileCache {
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| super::Error::Backend {
                message: format!("failed to create cache dir {}: {e}", dir.display()),
            })?;
        Ok(Self {
            dir,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            puts: AtomicU64::new(0),
            size: AtomicU64::new(0),
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        let hashed = format!("{:x}", hasher.finalize());
        self.dir.join(format!("{hashed}.json"))
    }
}

async fn read_entry(path: &Path) -> Option<CacheEntry> {
    let bytes = tokio::fs::read(path).await.ok()?;
    serde_json::from_slice(&bytes).ok()
}

#[async_trait]
impl CacheProvider for FileCache {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let path = self.path_for(key);
        let entry = read_entry(&path).await;
        let hit = match entry {
            Some(e) if e.is_expired() => {
                if tokio::fs::remove_file(&path).await.is_ok() {
                    self.size.fetch_sub(1, Ordering::Relaxed);
                }
                None
            }
            other => other,
        };
        if hit.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        Ok(hit)
    }

    async fn put(&self, key: &str, entry: CacheEntry) -> Result<()> {
        let path = self.path_for(key);
        let bytes = serde_json::to_vec(&entry).map_err(|e| super::Error::Backend {
            message: format!("serializing cache entry for '{key}': {e}"),
        })?;
        let already_present = tokio::fs::try_exists(&path).await.unwrap_or(false);

        let tmp = tempfile::NamedTempFile::new_in(&self.dir).map_err(|e| super::Error::Backend {
            message: format!("creating temp file for '{key}': {e}"),
        })?;

        let mut file = tokio::fs::File::from_std(tmp.as_file().try_clone().map_err(|e| {
            super::Error::Backend {
                message: format!("cloning temp file handle for '{key}': {e}"),
            }
        })?);
        file.write_all(&bytes)
            .await
            .map_err(|e| super::Error::Backend {
                message: format!("writing cache entry for '{key}': {e}"),
            })?;
        file.flush().await.map_err(|e| super::Error::Backend {
            message: format!("flushing cache entry for '{key}': {e}"),
        })?;

        let persisted = tokio::task::spawn_blocking(move || tmp.persist(path))
            .await
            .map_err(|e| super::Error::Backend {
                message: format!("joining persist task for '{key}': {e}"),
            })?;
        persisted.map_err(|e| super::Error::Backend {
            message: format!("renaming temp file into place for '{key}': {e}"),
        })?;

        self.puts.fetch_add(1, Ordering::Relaxed);
        if !already_present {
            self.size.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> Result<()> {
        if tokio::fs::remove_file(self.path_for(key)).await.is_ok() {
            self.size.fetch_sub(1, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let mut read_dir = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| super::Error::Backend {
                message: format!("listing cache dir: {e}"),
            })?;
        while let Ok(Some(entry)) = read_dir.next_entry().await {
            let _ = tokio::fs::remove_file(entry.path()).await;
        }
        self.size.store(0, Ordering::Relaxed);
        Ok(())
    }

    async fn cleanup_expired(&self) -> Result<usize> {
        let mut read_dir = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| super::Error::Backend {
                message: format!("listing cache dir: {e}"),
            })?;
        let mut removed = 0;
        while let Ok(Some(entry)) = read_dir.next_entry().await {
            let path = entry.path();
            if let Some(cached) = read_entry(&path).await {
                if cached.is_expired() {
                    let _ = tokio::fs::remove_file(&path).await;
                    removed += 1;
                }
            }
        }
        self.size.fetch_sub(removed as u64, Ordering::Relaxed);
        Ok(removed)
    }

    async fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            size: self.size.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path()).await.unwrap();
        cache.put("k", CacheEntry::new(json!({"x": 1}), None)).await.unwrap();
        let hit = cache.get("k").await.unwrap().unwrap();
        assert_eq!(hit.value, json!({"x": 1}));
    }

    #[tokio::test]
    async fn missing_key_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path()).await.unwrap();
        assert!(cache.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_entry_is_removed_on_get() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path()).await.unwrap();
        let mut entry = CacheEntry::new(json!(1), Some(300));
        entry.expires_at = Some(chrono::Utc::now() - chrono::Duration::seconds(1));
        cache.put("k", entry).await.unwrap();
        assert!(cache.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn invalidate_removes_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path()).await.unwrap();
        cache.put("k", CacheEntry::new(json!(1), None)).await.unwrap();
        cache.invalidate("k").await.unwrap();
        assert!(cache.get("k").await.unwrap().is_none());
    }
}
