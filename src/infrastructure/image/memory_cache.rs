//! In-memory LRU image cache implementation.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use chrono::Utc;
use lru::LruCache;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use super::eviction::{EvictionCandidate, EvictionPolicy, LeastRecentlyUsed};
use crate::domain::entities::{CacheEntry, ImageId, ImagePayload};
use crate::domain::ports::{CacheError, CacheResult, ImageCachePort};
use crate::infrastructure::config::CacheBudget;

/// Default memory budget in bytes (64 MB of decoded pixels).
pub const DEFAULT_MEMORY_BYTES: u64 = 64 * 1024 * 1024;

/// Maximum number of oldest entries offered to the eviction policy at once.
const CANDIDATE_WINDOW: usize = 32;

struct Inner {
    entries: LruCache<ImageId, CacheEntry>,
    total_bytes: u64,
}

impl Inner {
    fn candidates(&self) -> Vec<EvictionCandidate> {
        self.entries
            .iter()
            .rev()
            .take(CANDIDATE_WINDOW)
            .map(|(id, entry)| EvictionCandidate {
                id: id.clone(),
                byte_size: entry.metadata.byte_size,
                last_access: entry.last_access,
            })
            .collect()
    }

    fn pop(&mut self, id: &ImageId) -> Option<CacheEntry> {
        let entry = self.entries.pop(id)?;
        self.total_bytes = self.total_bytes.saturating_sub(entry.metadata.byte_size);
        Some(entry)
    }
}

/// In-memory cache of decoded images bounded by a byte budget.
/// Thread-safe; mutations are serialised by the internal lock.
pub struct MemoryImageCache {
    inner: RwLock<Inner>,
    budget: Arc<CacheBudget>,
    policy: Arc<dyn EvictionPolicy>,
    bytes: AtomicU64,
    count: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl MemoryImageCache {
    /// Creates a cache bounded by `budget`, evicting with `policy`.
    #[must_use]
    pub fn new(budget: Arc<CacheBudget>, policy: Arc<dyn EvictionPolicy>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                entries: LruCache::unbounded(),
                total_bytes: 0,
            }),
            budget,
            policy,
            bytes: AtomicU64::new(0),
            count: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Creates a least-recently-used cache with a fixed byte budget.
    #[must_use]
    pub fn with_capacity(max_bytes: u64) -> Self {
        Self::new(
            Arc::new(CacheBudget::new(max_bytes, 0)),
            Arc::new(LeastRecentlyUsed),
        )
    }

    /// Returns cache statistics.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            (hits as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        CacheStats {
            hits,
            misses,
            hit_rate,
            entries: self.len(),
            bytes: self.total_bytes(),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Evicts entries until the cache fits its current budget.
    pub async fn trim(&self) {
        let mut inner = self.inner.write().await;
        self.evict_until(&mut inner, self.budget.max_bytes(), 0);
        self.sync_counters(&inner);
    }

    /// Evicts entries until at most `max_bytes` remain resident.
    pub async fn trim_to(&self, max_bytes: u64) {
        let mut inner = self.inner.write().await;
        self.evict_until(&mut inner, max_bytes.min(self.budget.max_bytes()), 0);
        self.sync_counters(&inner);
    }

    /// Evicts until `incoming` more bytes and one more entry would fit under `max_bytes`.
    fn evict_until(&self, inner: &mut Inner, max_bytes: u64, incoming: u64) {
        let max_entries = self.budget.max_entries();
        let extra = usize::from(incoming > 0);
        loop {
            let over_bytes = inner.total_bytes + incoming > max_bytes;
            let over_count = max_entries > 0 && inner.entries.len() + extra > max_entries;
            if !over_bytes && !over_count {
                break;
            }
            let candidates = inner.candidates();
            let Some(victim) = self
                .policy
                .select_victim(&candidates)
                .and_then(|index| candidates.get(index))
            else {
                break;
            };
            if inner.pop(&victim.id).is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                trace!(id = %victim.id, policy = self.policy.name(), "Evicted from memory cache");
            } else {
                break;
            }
        }
    }

    /// Removes an entry found past its expiry; the lookup counts as a miss.
    fn drop_expired(&self, inner: &mut Inner, id: &ImageId) {
        inner.pop(id);
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.sync_counters(inner);
        debug!(id = %id, "Dropped expired image from memory cache");
    }

    fn sync_counters(&self, inner: &Inner) {
        self.bytes.store(inner.total_bytes, Ordering::Relaxed);
        self.count.store(inner.entries.len(), Ordering::Relaxed);
    }
}

impl Default for MemoryImageCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MEMORY_BYTES)
    }
}

/// Statistics about cache performance.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Hit rate as a percentage.
    pub hit_rate: f64,
    /// Current number of cached images.
    pub entries: usize,
    /// Resident bytes.
    pub bytes: u64,
    /// Entries evicted to stay within budget.
    pub evictions: u64,
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} images, {} bytes, {:.1}% hit rate ({} hits, {} misses, {} evictions)",
            self.entries, self.bytes, self.hit_rate, self.hits, self.misses, self.evictions
        )
    }
}

#[async_trait::async_trait]
impl ImageCachePort for MemoryImageCache {
    async fn get(&self, id: &ImageId) -> CacheResult<Option<CacheEntry>> {
        let now = Utc::now();
        let mut inner = self.inner.write().await;
        match inner.entries.get_mut(id) {
            Some(entry) if !entry.is_expired(now) => {
                entry.refresh(now);
                self.hits.fetch_add(1, Ordering::Relaxed);
                trace!(id = %id, "Memory cache hit");
                Ok(Some(entry.clone()))
            }
            Some(_) => {
                self.drop_expired(&mut inner, id);
                Ok(None)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                trace!(id = %id, "Memory cache miss");
                Ok(None)
            }
        }
    }

    async fn peek(&self, id: &ImageId) -> CacheResult<Option<CacheEntry>> {
        let now = Utc::now();
        {
            let inner = self.inner.read().await;
            match inner.entries.peek(id) {
                Some(entry) if !entry.is_expired(now) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Some(entry.clone()));
                }
                Some(_) => {}
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return Ok(None);
                }
            }
        }
        let mut inner = self.inner.write().await;
        if inner.entries.peek(id).is_some_and(|entry| entry.is_expired(now)) {
            self.drop_expired(&mut inner, id);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        Ok(None)
    }

    async fn put(&self, mut entry: CacheEntry) -> CacheResult<bool> {
        if matches!(entry.payload, ImagePayload::Encoded(_)) {
            return Err(CacheError::UnsupportedPayload("memory"));
        }
        let size = entry.metadata.byte_size;
        if size > self.budget.max_bytes() {
            debug!(id = %entry.id, size, "Image exceeds memory budget, not cached");
            return Ok(false);
        }

        let mut inner = self.inner.write().await;
        inner.pop(&entry.id);
        self.evict_until(&mut inner, self.budget.max_bytes(), size.max(1));
        if !self
            .budget
            .fits(inner.total_bytes + size, inner.entries.len() + 1)
        {
            debug!(
                id = %entry.id,
                size,
                policy = self.policy.name(),
                "Eviction policy freed too little room, not cached"
            );
            self.sync_counters(&inner);
            return Ok(false);
        }

        entry.refresh(Utc::now());
        debug!(id = %entry.id, size, "Storing image in memory cache");
        inner.total_bytes += size;
        inner.entries.push(entry.id.clone(), entry);
        self.sync_counters(&inner);
        Ok(true)
    }

    async fn remove(&self, id: &ImageId) -> CacheResult<()> {
        let mut inner = self.inner.write().await;
        if inner.pop(id).is_some() {
            debug!(id = %id, "Removed image from memory cache");
        }
        self.sync_counters(&inner);
        Ok(())
    }

    async fn clear(&self) -> CacheResult<()> {
        let mut inner = self.inner.write().await;
        inner.entries.clear();
        inner.total_bytes = 0;
        self.sync_counters(&inner);
        debug!("Cleared memory image cache");
        Ok(())
    }

    fn total_bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }
}
