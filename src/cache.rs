//! Bounded LRU cache for origin responses.
//!
//! Entries are keyed by normalized URL (see [`crate::url::normalize_url`])
//! and stored as shared immutable snapshots so many connections can serve
//! the same response concurrently. The cache is bounded by a total byte
//! budget; inserts evict least-recently-used entries until the new body
//! fits. Admission takes only `GET` responses with status 200 whose body is
//! within the per-object limit.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use http::{Method, StatusCode};
use lru::LruCache;
use parking_lot::Mutex;
use tracing::trace;

use crate::parse::{Request, Response};

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub entries: usize,
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

#[derive(Debug)]
struct CacheInner {
    lru: LruCache<String, Arc<Response>>,
    bytes_in_use: usize,
}

/// Thread-safe LRU response cache with byte-budget eviction.
#[derive(Debug)]
pub struct HttpCache {
    max_cache_bytes: usize,
    max_object_bytes: usize,
    inner: Mutex<CacheInner>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl HttpCache {
    pub fn new(max_cache_bytes: usize, max_object_bytes: usize) -> Self {
        Self {
            max_cache_bytes,
            max_object_bytes,
            inner: Mutex::new(CacheInner {
                lru: LruCache::unbounded(),
                bytes_in_use: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Whether `response` may be stored for `request`.
    pub fn is_admissible(&self, request: &Request, response: &Response) -> bool {
        request.method == Method::GET
            && response.status == StatusCode::OK
            && response.body.len() <= self.max_object_bytes
    }

    /// Looks up `key`, touching its recency and counting a hit or miss.
    pub fn get(&self, key: &str) -> Option<Arc<Response>> {
        let mut inner = self.inner.lock();
        match inner.lru.get(key) {
            Some(response) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(response.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Whether `key` is present, without touching recency or counters.
    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().lru.contains(key)
    }

    /// Stores `response` under `key` if admissible, evicting LRU entries
    /// until the byte budget holds. Returns whether the entry was admitted.
    ///
    /// An existing entry under the same key is replaced; its bytes are freed
    /// before eviction is considered.
    pub fn put(&self, key: String, response: Response, request: &Request) -> bool {
        if !self.is_admissible(request, &response) {
            return false;
        }
        let size = response.body.len();
        let mut inner = self.inner.lock();
        if let Some(old) = inner.lru.pop(&key) {
            inner.bytes_in_use -= old.body.len();
        }
        while inner.bytes_in_use + size > self.max_cache_bytes {
            let Some((evicted_key, evicted)) = inner.lru.pop_lru() else {
                break;
            };
            inner.bytes_in_use -= evicted.body.len();
            trace!(key = %evicted_key, bytes = evicted.body.len(), "cache evicted");
        }
        inner.lru.put(key, Arc::new(response));
        inner.bytes_in_use += size;
        true
    }

    /// Consistent snapshot of entry count, byte usage, and counters.
    pub fn stats(&self) -> CacheStats {
        let (entries, size) = {
            let inner = self.inner.lock();
            (inner.lru.len(), inner.bytes_in_use)
        };
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        let hit_rate = if lookups > 0 {
            hits as f64 / lookups as f64
        } else {
            0.0
        };
        CacheStats {
            entries,
            size,
            hits,
            misses,
            hit_rate,
        }
    }

    /// Drops all entries. Hit and miss counters are preserved.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.lru.clear();
        inner.bytes_in_use = 0;
    }
}
