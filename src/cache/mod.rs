//! Cache Module
//!
//! Bounded in-memory store of ready-to-send responses keyed by request path.
//!
//! Entries are evicted first-in first-out: a cache hit never changes an
//! entry's position. Pinned entries (index and error pages) are seeded once
//! at startup and live outside the FIFO accounting.

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// A complete response buffer as handed out by the cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    /// Status line, headers and gzip body
    pub data: Bytes,

    /// Whether this is the shared 404 page
    pub not_found: bool,
}

impl CachedResponse {
    /// A found resource
    pub fn found(data: Bytes) -> Self {
        Self {
            data,
            not_found: false,
        }
    }

    /// The 404 page
    pub fn not_found(data: Bytes) -> Self {
        Self {
            data,
            not_found: true,
        }
    }
}

/// Cache entry
struct CacheEntry {
    response: CachedResponse,

    /// Bytes charged against capacity
    size: u64,
}

/// Insertion order plus the running size total
#[derive(Default)]
struct FifoIndex {
    order: VecDeque<String>,
    size: u64,
}

/// Cache statistics
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStats {
    fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }
}

/// Path-keyed response cache with FIFO eviction
pub struct ContentCache {
    /// Startup entries, read-only once the cache is shared
    pinned: HashMap<String, CachedResponse>,

    /// Evictable entries
    entries: DashMap<String, CacheEntry>,

    /// Eviction order; inserts and evictions serialize on this lock
    fifo: Mutex<FifoIndex>,

    /// Maximum accounted size in bytes
    capacity: u64,

    /// Statistics
    stats: CacheStats,
}

impl ContentCache {
    /// Create an empty cache holding at most `capacity` accounted bytes
    pub fn new(capacity: u64) -> Self {
        info!("Initializing content cache: capacity={} bytes", capacity);

        Self {
            pinned: HashMap::new(),
            entries: DashMap::new(),
            fifo: Mutex::new(FifoIndex::default()),
            capacity,
            stats: CacheStats::new(),
        }
    }

    /// Seed an entry that is never evicted nor counted against capacity
    pub fn pin(&mut self, path: &str, response: CachedResponse) {
        debug!("Cache pin: {} ({} bytes)", path, response.data.len());
        self.pinned.insert(path.to_string(), response);
    }

    /// Look up a path
    pub fn get(&self, path: &str) -> Option<CachedResponse> {
        let found = match self.pinned.get(path) {
            Some(response) => Some(response.clone()),
            None => self.entries.get(path).map(|e| e.response.clone()),
        };

        match found {
            Some(response) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                debug!("Cache hit: {}", path);
                Some(response)
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert a response charged at `size` bytes
    ///
    /// Returns `false` without touching order or size when the path is
    /// already present. After a successful insert the oldest entries are
    /// evicted until the total is back within capacity; an entry larger
    /// than the whole capacity is evicted straight away.
    pub fn put(&self, path: &str, response: CachedResponse, size: u64) -> bool {
        if self.pinned.contains_key(path) {
            return false;
        }

        let mut fifo = self.fifo.lock();
        if self.entries.contains_key(path) {
            return false;
        }

        self.entries
            .insert(path.to_string(), CacheEntry { response, size });
        fifo.order.push_back(path.to_string());
        fifo.size += size;
        debug!("Cache put: {} ({} bytes, total={})", path, size, fifo.size);

        let mut evicted = 0;
        while fifo.size > self.capacity {
            let Some(oldest) = fifo.order.pop_front() else {
                break;
            };
            if let Some((_, entry)) = self.entries.remove(&oldest) {
                fifo.size -= entry.size;
                evicted += 1;
                debug!("Cache evict: {} ({} bytes)", oldest, entry.size);
            }
        }

        if evicted > 0 {
            self.stats.evictions.fetch_add(evicted, Ordering::Relaxed);
        }

        true
    }

    /// Number of evictable entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no evictable entries are held
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Accounted size of evictable entries
    pub fn size(&self) -> u64 {
        self.fifo.lock().size
    }

    /// Configured capacity
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Paths in eviction order, oldest first
    pub fn eviction_order(&self) -> Vec<String> {
        self.fifo.lock().order.iter().cloned().collect()
    }

    /// Get cache statistics
    pub fn stats(&self) -> serde_json::Value {
        let hits = self.stats.hits.load(Ordering::Relaxed);
        let misses = self.stats.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        json!({
            "entries": self.entries.len(),
            "pinned": self.pinned.len(),
            "hits": hits,
            "misses": misses,
            "evictions": self.stats.evictions.load(Ordering::Relaxed),
            "size_bytes": self.size(),
            "capacity": self.capacity,
            "hit_rate": if total == 0 { 0.0 } else { hits as f64 / total as f64 * 100.0 },
        })
    }
}
