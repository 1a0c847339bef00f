//! CacheStore (component C7): two bounded, mtime-validated LRU caches —
//! one for ETags, one for compressed response bodies.
//!
//! Grounded in the dependency choice the other_examples manifests make
//! for this exact problem (`lru` for bounded eviction, `sha2` for
//! content hashing, paired with `dashmap`/`parking_lot` for the
//! concurrent-map half — the same combination spec §5 calls out for
//! every process-global table in this crate, not just this one).

use bytes::Bytes;
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::Notify;

/// Files at or under this size get a strong (content-hash) ETag; larger
/// files get a weak `size-mtime` ETag to avoid hashing the whole file on
/// every cold lookup. Named per Design Note 3 / Open Question rather
/// than buried as a bare literal.
pub const WEAK_ETAG_THRESHOLD_BYTES: u64 = 100 * 1024 * 1024;

/// Only files at or under this size are worth holding a compressed copy
/// of in memory (spec §4.7).
pub const COMPRESSION_CACHE_MAX_FILE_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone)]
struct CacheKey(PathBuf);

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}
impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for CacheKey {}

#[derive(Debug, Clone)]
struct EtagEntry {
    etag: String,
    mtime: SystemTime,
    size: u64,
}

#[derive(Debug, Clone)]
struct CompressedEntry {
    bytes: Bytes,
    mtime: SystemTime,
    size: u64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
}

impl CacheStats {
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Coalesces concurrent cold misses on the same key so at most one
/// recomputation runs per key at a time; followers await the leader's
/// result instead of recomputing it themselves (spec §4.7).
struct Coalescer {
    inflight: DashMap<PathBuf, Arc<Notify>>,
}

impl Coalescer {
    fn new() -> Self {
        Self { inflight: DashMap::new() }
    }

    /// Returns `true` if the caller became the leader for `key` and must
    /// call `finish(key)` when done; `false` means a leader already
    /// exists and the caller should await its `Notify` then retry.
    fn try_become_leader(&self, key: &Path) -> Result<(), Arc<Notify>> {
        match self.inflight.entry(key.to_path_buf()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => Err(entry.get().clone()),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Arc::new(Notify::new()));
                Ok(())
            }
        }
    }

    fn finish(&self, key: &Path) {
        if let Some((_, notify)) = self.inflight.remove(key) {
            notify.notify_waiters();
        }
    }
}

pub struct EtagCache {
    entries: Mutex<LruCache<CacheKey, EtagEntry>>,
    coalescer: Coalescer,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl EtagCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).unwrap(),
            )),
            coalescer: Coalescer::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns the ETag for `path`, recomputing it (hashing, for small
    /// files; stat-only, for large ones) on a stale or cold entry.
    pub async fn get(&self, path: &Path) -> std::io::Result<String> {
        loop {
            let metadata = tokio::fs::metadata(path).await?;
            let mtime = metadata.modified()?;
            let size = metadata.len();

            {
                let mut entries = self.entries.lock();
                if let Some(entry) = entries.get(&CacheKey(path.to_path_buf())) {
                    if entry.mtime == mtime && entry.size == size {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        return Ok(entry.etag.clone());
                    }
                }
            }

            match self.coalescer.try_become_leader(path) {
                Ok(()) => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    let etag = compute_etag(path, size).await?;
                    self.entries.lock().put(
                        CacheKey(path.to_path_buf()),
                        EtagEntry { etag: etag.clone(), mtime, size },
                    );
                    self.coalescer.finish(path);
                    return Ok(etag);
                }
                Err(notify) => {
                    notify.notified().await;
                    // Loop around: the leader has published (or the
                    // file changed again), re-check from the top.
                }
            }
        }
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: self.entries.lock().len(),
        }
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

async fn compute_etag(path: &Path, size: u64) -> std::io::Result<String> {
    if size > WEAK_ETAG_THRESHOLD_BYTES {
        let mtime_secs = tokio::fs::metadata(path)
            .await?
            .modified()?
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        return Ok(format!("W/\"{size:x}-{mtime_secs:x}\""));
    }
    let bytes = tokio::fs::read(path).await?;
    let digest = Sha256::digest(&bytes);
    Ok(format!("\"{}\"", hex_encode(&digest)))
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

pub struct CompressionCache {
    entries: Mutex<LruCache<CacheKey, CompressedEntry>>,
    coalescer: Coalescer,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CompressionCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).unwrap(),
            )),
            coalescer: Coalescer::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns a cached compressed copy if present and fresh. Does not
    /// compress itself — callers recompute via `compress_and_store` on a
    /// miss (compression strategy lives in `compression.rs`, C8).
    pub fn get(&self, path: &Path, mtime: SystemTime, size: u64) -> Option<Bytes> {
        let mut entries = self.entries.lock();
        let entry = entries.get(&CacheKey(path.to_path_buf()))?;
        if entry.mtime == mtime && entry.size == size {
            self.hits.fetch_add(1, Ordering::Relaxed);
            Some(entry.bytes.clone())
        } else {
            None
        }
    }

    pub fn try_become_leader(&self, path: &Path) -> Result<(), Arc<Notify>> {
        self.coalescer.try_become_leader(path)
    }

    pub fn store(&self, path: &Path, mtime: SystemTime, size: u64, compressed: Bytes) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        if size <= COMPRESSION_CACHE_MAX_FILE_BYTES {
            self.entries.lock().put(
                CacheKey(path.to_path_buf()),
                CompressedEntry { bytes: compressed, mtime, size },
            );
        }
        self.coalescer.finish(path);
    }

    pub fn abandon(&self, path: &Path) {
        self.coalescer.finish(path);
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: self.entries.lock().len(),
        }
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn etag_is_stable_until_mtime_changes() {
        let (path, mut file) = tempfile_with_content(b"hello world");
        let cache = EtagCache::new(10);
        let first = cache.get(&path).await.unwrap();
        let second = cache.get(&path).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);

        // Touch content so both size and mtime move forward.
        std::thread::sleep(std::time::Duration::from_millis(10));
        file.write_all(b"!!!").unwrap();
        file.flush().unwrap();
        let third = cache.get(&path).await.unwrap();
        assert_ne!(first, third);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn large_file_gets_weak_etag() {
        let path = std::env::temp_dir().join(format!("http2core-etag-test-{}", std::process::id()));
        tokio::fs::write(&path, b"small file, but we force the weak path via threshold").await.unwrap();
        let etag = compute_etag(&path, WEAK_ETAG_THRESHOLD_BYTES + 1).await.unwrap();
        assert!(etag.starts_with("W/\""));
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[test]
    fn hit_rate_is_zero_with_no_samples() {
        let stats = CacheStats::default();
        assert_eq!(stats.hit_rate(), 0.0);
    }

    fn tempfile_with_content(content: &[u8]) -> (std::path::PathBuf, std::fs::File) {
        let path = std::env::temp_dir().join(format!("http2core-etag-{}-{:?}", std::process::id(), std::time::Instant::now()));
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .open(&path)
            .unwrap();
        file.write_all(content).unwrap();
        (path, file)
    }
}
