//! Whole-file cache with mtime validation.
//!
//! Endpoint context files and session files are read repeatedly on the
//! request path; this cache keeps their contents in memory. Entries checked
//! within the last second are served as-is; older entries are revalidated
//! against the file's mtime. Every tenth call runs maintenance: TTL-expired
//! entries are evicted, then the oldest entries (by last check) until the
//! total size fits the cap.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;

struct CachedFile {
    content: String,
    mtime: SystemTime,
    last_check: Instant,
}

struct CacheInner {
    entries: HashMap<String, CachedFile>,
    total_size: usize,
}

impl CacheInner {
    fn remove(&mut self, path: &str) {
        if let Some(old) = self.entries.remove(path) {
            self.total_size -= old.content.len();
        }
    }

    fn insert(&mut self, path: String, content: String, mtime: SystemTime) {
        self.remove(&path);
        self.total_size += content.len();
        self.entries.insert(
            path,
            CachedFile {
                content,
                mtime,
                last_check: Instant::now(),
            },
        );
    }

    fn evict_ttl(&mut self, ttl: Duration) {
        let now = Instant::now();
        let mut removed = 0usize;
        self.entries.retain(|_, entry| {
            if now.duration_since(entry.last_check) > ttl {
                removed += entry.content.len();
                false
            } else {
                true
            }
        });
        self.total_size -= removed;
    }

    fn evict_to_size(&mut self, max_size: usize) {
        while self.total_size > max_size && !self.entries.is_empty() {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_check)
                .map(|(path, _)| path.clone());
            if let Some(path) = oldest {
                self.remove(&path);
            }
        }
    }
}

/// Cache statistics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cached files.
    pub total_entries: usize,
    /// Sum of cached content sizes.
    pub total_size: usize,
    /// Configured size cap.
    pub max_size: usize,
}

/// Mtime-validated whole-file cache.
pub struct FileCache {
    inner: Mutex<CacheInner>,
    calls: AtomicU32,
    ttl: Duration,
    max_size: usize,
}

impl FileCache {
    /// Creates a cache with the given entry TTL and total size cap.
    #[must_use]
    pub fn new(ttl: Duration, max_size: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                total_size: 0,
            }),
            calls: AtomicU32::new(0),
            ttl,
            max_size,
        }
    }

    /// Reads a file through the cache. Returns `None` when the file does
    /// not exist or cannot be read.
    #[must_use]
    pub fn read(&self, path: &str) -> Option<String> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed) + 1;

        {
            let mut inner = self.inner.lock();
            if call % 10 == 0 {
                inner.evict_ttl(self.ttl);
                inner.evict_to_size(self.max_size);
            }
            if let Some(entry) = inner.entries.get(path) {
                if entry.last_check.elapsed() < Duration::from_secs(1) {
                    return Some(entry.content.clone());
                }
            }
        }

        let metadata = std::fs::metadata(path).ok()?;
        let mtime = metadata.modified().ok()?;

        {
            let mut inner = self.inner.lock();
            if let Some(entry) = inner.entries.get_mut(path) {
                entry.last_check = Instant::now();
                if entry.mtime == mtime {
                    return Some(entry.content.clone());
                }
                inner.remove(path);
            }
        }

        let content = std::fs::read_to_string(path).ok()?;
        if content.len() > self.max_size {
            // Too large to cache; hand it back uncached.
            return Some(content);
        }

        let mut inner = self.inner.lock();
        inner.insert(path.to_string(), content.clone(), mtime);
        inner.evict_to_size(self.max_size);
        Some(content)
    }

    /// Writes a file and refreshes its cache entry.
    ///
    /// # Errors
    ///
    /// Propagates the underlying filesystem error.
    pub fn write(&self, path: &str, content: &str) -> std::io::Result<()> {
        std::fs::write(path, content)?;
        let mtime = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut inner = self.inner.lock();
        if content.len() > self.max_size {
            inner.remove(path);
        } else {
            inner.insert(path.to_string(), content.to_string(), mtime);
            inner.evict_to_size(self.max_size);
        }
        Ok(())
    }

    /// Current cache statistics.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            total_entries: inner.entries.len(),
            total_size: inner.total_size,
            max_size: self.max_size,
        }
    }
}

impl std::fmt::Debug for FileCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("FileCache")
            .field("entries", &stats.total_entries)
            .field("total_size", &stats.total_size)
            .field("max_size", &stats.max_size)
            .finish()
    }
}
