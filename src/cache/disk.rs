use super::index::{CacheEntry, CacheIndex, EntryMeta, Lookup};
use super::{etag_for, CacheCounters, CachePolicy, CacheStats, CachedVariant, NewVariant};
use crate::key::storage_file_name;
use crate::{CdnError, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio::fs;

/// Variant cache writing payloads to files below `dir`, with the index kept
/// in memory.
///
/// Each put writes a fresh file (`{generation}-{escaped key}`), so removing a
/// replaced or evicted entry can never delete the file of a newer one.
/// Failing to delete a file never keeps an entry in the index: the orphan is
/// logged and left behind.
pub struct DiskCache {
    dir: PathBuf,
    index: Mutex<CacheIndex<PathBuf>>,
    generation: AtomicU64,
    counters: CacheCounters,
}

impl DiskCache {
    /// Opens the cache directory, creating it if needed and removing files
    /// left over from a previous process (the index does not survive
    /// restarts).
    pub async fn init(dir: PathBuf, max_entries: usize) -> Result<Self> {
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| CdnError::InternalCache(format!("create {}: {}", dir.display(), e)))?;

        let mut stale = 0usize;
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| CdnError::InternalCache(format!("read {}: {}", dir.display(), e)))?;
        while let Ok(Some(item)) = entries.next_entry().await {
            let is_file = item.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            if is_file {
                remove_file_logged(&item.path()).await;
                stale += 1;
            }
        }
        if stale > 0 {
            tracing::info!("Removed {} stale cache files from {}", stale, dir.display());
        }

        Ok(Self {
            dir,
            index: Mutex::new(CacheIndex::new(max_entries)),
            generation: AtomicU64::new(0),
            counters: CacheCounters::default(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        self.dir.join(format!("{:016x}-{}", generation, storage_file_name(key)))
    }

    async fn release(&self, entries: Vec<CacheEntry<PathBuf>>) {
        for entry in entries {
            remove_file_logged(&entry.payload).await;
        }
    }
}

/// Deletes a cache file; failures are logged and swallowed.
async fn remove_file_logged(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to delete cache file {}: {}", path.display(), e),
    }
}

impl DiskCache {
    async fn lookup(&self, key: &str, counted: bool) -> Option<CachedVariant> {
        let lookup = self.index.lock().get(key, Instant::now());
        let entry = match lookup {
            Lookup::Hit(entry) => entry,
            Lookup::Expired(entry) => {
                tracing::debug!("Expired cache entry dropped: key={}", key);
                self.counters.expired(1);
                if counted {
                    self.counters.miss();
                }
                remove_file_logged(&entry.payload).await;
                return None;
            }
            Lookup::Miss => {
                if counted {
                    self.counters.miss();
                }
                return None;
            }
        };

        match fs::read(&entry.payload).await {
            Ok(data) => {
                if counted {
                    self.counters.hit();
                }
                Some(CachedVariant {
                    bytes: Bytes::from(data),
                    content_type: entry.content_type,
                    etag: entry.etag,
                    transformed: entry.transformed,
                    stored_at: entry.stored_at,
                })
            }
            Err(e) => {
                // Index and filesystem disagree; drop the entry and serve a miss
                let err = CdnError::InternalCache(format!("read {}: {}", entry.payload.display(), e));
                tracing::warn!("{}; treating key={} as a miss", err, key);
                let path = entry.payload.clone();
                self.index.lock().remove_if(key, |current| current.payload == path);
                remove_file_logged(&entry.payload).await;
                if counted {
                    self.counters.miss();
                }
                None
            }
        }
    }
}

#[async_trait::async_trait]
impl CachePolicy for DiskCache {
    async fn get(&self, key: &str) -> Option<CachedVariant> {
        self.lookup(key, true).await
    }

    async fn recheck(&self, key: &str) -> Option<CachedVariant> {
        self.lookup(key, false).await
    }

    async fn put(&self, key: &str, variant: NewVariant, ttl: Duration) -> Result<CachedVariant> {
        let path = self.path_for(key);
        if let Err(e) = fs::write(&path, &variant.bytes).await {
            remove_file_logged(&path).await;
            return Err(CdnError::InternalCache(format!("write {}: {}", path.display(), e)));
        }

        let stored_at = OffsetDateTime::now_utc();
        let etag = etag_for(variant.bytes.len(), variant.freshness_token.as_deref(), stored_at);
        let meta = EntryMeta {
            len: variant.bytes.len(),
            content_type: variant.content_type.clone(),
            freshness_token: variant.freshness_token,
            etag: etag.clone(),
            transformed: variant.transformed,
            stored_at,
        };

        let displaced = self.index.lock().insert(key, path, meta, ttl, Instant::now());
        let mut released = Vec::with_capacity(2);
        if let Some(replaced) = displaced.replaced {
            released.push(replaced);
        }
        if let Some(evicted) = displaced.evicted {
            self.counters.evicted(1);
            tracing::info!("Evicted oldest entry: key={}, size={}", evicted.key, evicted.len);
            released.push(evicted);
        }
        self.release(released).await;

        tracing::info!("Stored variant: key={}, type={}, size={} bytes", key, variant.content_type, variant.bytes.len());
        Ok(CachedVariant {
            bytes: variant.bytes,
            content_type: variant.content_type,
            etag,
            transformed: variant.transformed,
            stored_at,
        })
    }

    async fn invalidate_prefix(&self, base: &str) -> usize {
        let removed = self.index.lock().remove_base(base);
        let n = removed.len();
        self.release(removed).await;
        tracing::info!("Invalidated {} variants of {}", n, base);
        n
    }

    async fn purge_expired(&self) -> usize {
        let removed = self.index.lock().remove_expired(Instant::now());
        let n = removed.len();
        self.counters.expired(n);
        self.release(removed).await;
        tracing::info!("Cleared {} expired cache entries", n);
        n
    }

    async fn clear(&self) -> usize {
        let removed = self.index.lock().drain();
        let n = removed.len();
        self.release(removed).await;
        tracing::info!("Cache cleared: {} entries removed", n);
        n
    }

    fn len(&self) -> usize {
        self.index.lock().len()
    }

    fn stats(&self) -> CacheStats {
        let index = self.index.lock();
        self.counters.stats("disk", index.len(), index.capacity(), index.total_len())
    }
}
