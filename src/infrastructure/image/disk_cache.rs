//! Disk-based image cache for persistence across sessions.
//!
//! Encoded bytes live in `<key>.img` files next to an `index.json` that holds
//! each entry's metadata and recency. Every file and index write goes through
//! a temporary file and a rename, so a crash leaves either the old or the new
//! version. Files the index does not know about are removed on open.
//!
//! Reads only mark recency dirty; it is written with the next mutation, every
//! [`RECENCY_FLUSH_INTERVAL`] touches, or on [`DiskImageCache::flush`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use super::eviction::{EvictionCandidate, EvictionPolicy, LeastRecentlyUsed};
use super::memory_cache::CacheStats;
use crate::domain::entities::{
    CacheEntry, DEFAULT_TIME_TO_LIVE, EntryMetadata, ImageId, ImagePayload, expiry_from,
};
use crate::domain::ports::{CacheError, CacheResult, ImageCachePort};
use crate::infrastructure::config::CacheBudget;

/// Maximum disk cache size in bytes (200 MB default).
pub const DEFAULT_MAX_CACHE_SIZE: u64 = 200 * 1024 * 1024;

const INDEX_FILE: &str = "index.json";
const INDEX_VERSION: u32 = 2;
const DATA_EXTENSION: &str = "img";
const TEMP_EXTENSION: &str = "tmp";

/// Touches accumulated before recency is written without another mutation.
pub const RECENCY_FLUSH_INTERVAL: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexRecord {
    file: String,
    metadata: EntryMetadata,
    last_access: DateTime<Utc>,
    /// Monotonic access counter; orders entries that share a timestamp.
    sequence: u64,
    time_to_live_ms: i64,
    expires_at: DateTime<Utc>,
}

impl IndexRecord {
    fn time_to_live(&self) -> TimeDelta {
        TimeDelta::try_milliseconds(self.time_to_live_ms).unwrap_or(DEFAULT_TIME_TO_LIVE)
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DiskIndex {
    version: u32,
    next_sequence: u64,
    entries: HashMap<ImageId, IndexRecord>,
    #[serde(skip)]
    unsaved_touches: usize,
}

impl DiskIndex {
    fn empty() -> Self {
        Self {
            version: INDEX_VERSION,
            ..Self::default()
        }
    }

    fn total_bytes(&self) -> u64 {
        self.entries.values().map(|r| r.metadata.byte_size).sum()
    }

    /// Marks `id` most recently used and restarts its lifetime.
    fn touch(&mut self, id: &ImageId, now: DateTime<Utc>) {
        self.next_sequence += 1;
        let sequence = self.next_sequence;
        if let Some(record) = self.entries.get_mut(id) {
            record.last_access = now;
            record.expires_at = expiry_from(now, record.time_to_live());
            record.sequence = sequence;
            self.unsaved_touches += 1;
        }
    }

    /// Drops every record past its expiry and returns them.
    fn purge_expired(&mut self, now: DateTime<Utc>) -> Vec<(ImageId, IndexRecord)> {
        let expired: Vec<ImageId> = self
            .entries
            .iter()
            .filter(|(_, record)| record.is_expired(now))
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|record| (id, record)))
            .collect()
    }

    /// Entries ordered least recently used first.
    fn candidates(&self, exclude: Option<&ImageId>) -> Vec<EvictionCandidate> {
        let mut records: Vec<_> = self
            .entries
            .iter()
            .filter(|(id, _)| Some(*id) != exclude)
            .collect();
        records.sort_by_key(|(_, r)| r.sequence);
        records
            .into_iter()
            .map(|(id, r)| EvictionCandidate {
                id: id.clone(),
                byte_size: r.metadata.byte_size,
                last_access: r.last_access,
            })
            .collect()
    }
}

/// Disk-based image cache that persists encoded image bytes.
pub struct DiskImageCache {
    cache_dir: PathBuf,
    index: Mutex<DiskIndex>,
    budget: Arc<CacheBudget>,
    policy: Arc<dyn EvictionPolicy>,
    current_size: AtomicU64,
    item_count: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl DiskImageCache {
    /// Opens (or creates) a disk cache in the specified directory.
    ///
    /// Drops index records whose files are gone, deletes unindexed files and
    /// evicts down to the budget.
    ///
    /// # Errors
    /// Returns error if the cache directory cannot be created or read.
    pub async fn open(
        cache_dir: PathBuf,
        budget: Arc<CacheBudget>,
        policy: Arc<dyn EvictionPolicy>,
    ) -> CacheResult<Self> {
        fs::create_dir_all(&cache_dir)
            .await
            .map_err(|e| CacheError::IoError(format!("Failed to create cache dir: {e}")))?;

        let mut index = load_index(&cache_dir.join(INDEX_FILE)).await;
        let mut dropped = Vec::new();
        for (id, record) in &index.entries {
            if !fs::try_exists(cache_dir.join(&record.file))
                .await
                .unwrap_or(false)
            {
                dropped.push(id.clone());
            }
        }
        for id in &dropped {
            debug!(id = %id, "Dropping index record with missing file");
            index.entries.remove(id);
        }
        for (id, _) in index.purge_expired(Utc::now()) {
            debug!(id = %id, "Dropping expired disk cache entry");
        }

        remove_orphans(&cache_dir, &index).await?;

        let cache = Self {
            cache_dir,
            index: Mutex::new(index),
            budget,
            policy,
            current_size: AtomicU64::new(0),
            item_count: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        };

        {
            let mut index = cache.index.lock().await;
            cache.evict_until(&mut index, cache.budget.max_bytes(), 0, None).await;
            cache.persist(&mut index).await?;
            cache.sync_counters(&index);
        }

        debug!(
            dir = %cache.cache_dir.display(),
            entries = cache.len(),
            bytes = cache.total_bytes(),
            "Opened disk cache"
        );
        Ok(cache)
    }

    /// Opens a least-recently-used cache with a fixed byte budget.
    ///
    /// # Errors
    /// Returns error if the cache directory cannot be created.
    pub async fn with_capacity(cache_dir: PathBuf, max_bytes: u64) -> CacheResult<Self> {
        Self::open(
            cache_dir,
            Arc::new(CacheBudget::new(max_bytes, 0)),
            Arc::new(LeastRecentlyUsed),
        )
        .await
    }

    /// Opens a cache in the default location (`~/.cache/imagepipe/images/`).
    ///
    /// # Errors
    /// Returns error if cache directory cannot be created.
    pub async fn default_location(
        budget: Arc<CacheBudget>,
        policy: Arc<dyn EvictionPolicy>,
    ) -> CacheResult<Self> {
        Self::open(default_cache_dir(), budget, policy).await
    }

    /// Returns the cache directory.
    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
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
    ///
    /// # Errors
    /// Returns error if the index cannot be written.
    pub async fn trim(&self) -> CacheResult<()> {
        let mut index = self.index.lock().await;
        self.evict_until(&mut index, self.budget.max_bytes(), 0, None)
            .await;
        self.sync_counters(&index);
        self.persist(&mut index).await
    }

    /// Writes recency recorded by reads since the last index write.
    ///
    /// # Errors
    /// Returns error if the index cannot be written.
    pub async fn flush(&self) -> CacheResult<()> {
        let mut index = self.index.lock().await;
        if index.unsaved_touches == 0 {
            return Ok(());
        }
        self.persist(&mut index).await
    }

    /// Checks if an unexpired image is cached.
    pub async fn contains(&self, id: &ImageId) -> bool {
        self.index
            .lock()
            .await
            .entries
            .get(id)
            .is_some_and(|record| !record.is_expired(Utc::now()))
    }

    fn file_name(id: &ImageId) -> String {
        format!("{}.{DATA_EXTENSION}", id.storage_key())
    }

    async fn lookup(&self, id: &ImageId, touch: bool) -> CacheResult<Option<CacheEntry>> {
        let now = Utc::now();
        let mut index = self.index.lock().await;
        let Some(record) = index.entries.get(id).cloned() else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            trace!(id = %id, "Disk cache miss");
            return Ok(None);
        };

        let path = self.cache_dir.join(&record.file);
        if record.is_expired(now) {
            debug!(id = %id, expired = %record.expires_at, "Dropping expired disk cache entry");
            index.entries.remove(id);
            remove_data_file(&path).await;
            self.sync_counters(&index);
            self.persist(&mut index).await?;
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(id = %id, path = %path.display(), "Cached file vanished, dropping record");
                index.entries.remove(id);
                self.sync_counters(&index);
                self.persist(&mut index).await?;
                self.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
            Err(e) => {
                return Err(CacheError::IoError(format!(
                    "Failed to read {}: {e}",
                    path.display()
                )));
            }
        };

        self.hits.fetch_add(1, Ordering::Relaxed);
        trace!(id = %id, path = %path.display(), "Disk cache hit");

        let record = if touch {
            index.touch(id, now);
            if index.unsaved_touches >= RECENCY_FLUSH_INTERVAL
                && let Err(e) = self.persist(&mut index).await
            {
                warn!(error = %e, "Failed to write disk cache recency, keeping it in memory");
            }
            index.entries.get(id).cloned().unwrap_or(record)
        } else {
            record
        };

        let time_to_live = record.time_to_live();
        let mut entry = CacheEntry::encoded(id.clone(), Bytes::from(bytes), record.metadata);
        entry.last_access = record.last_access;
        entry.time_to_live = time_to_live;
        entry.expires_at = record.expires_at;
        Ok(Some(entry))
    }

    /// Evicts until `incoming` more bytes fit under `max_bytes`, never evicting `keep`.
    async fn evict_until(
        &self,
        index: &mut DiskIndex,
        max_bytes: u64,
        incoming: u64,
        keep: Option<&ImageId>,
    ) {
        let max_entries = self.budget.max_entries();
        let extra = usize::from(keep.is_some());
        loop {
            let total = index.total_bytes();
            let over_bytes = total + incoming > max_bytes;
            let over_count = max_entries > 0 && index.entries.len() + extra > max_entries;
            if !over_bytes && !over_count {
                break;
            }
            let candidates = index.candidates(keep);
            let Some(victim) = self
                .policy
                .select_victim(&candidates)
                .and_then(|i| candidates.get(i))
            else {
                break;
            };
            if let Some(record) = index.entries.remove(&victim.id) {
                remove_data_file(&self.cache_dir.join(&record.file)).await;
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(id = %victim.id, policy = self.policy.name(), "Evicted from disk cache");
            }
        }
    }

    async fn persist(&self, index: &mut DiskIndex) -> CacheResult<()> {
        let json = serde_json::to_vec(&*index)
            .map_err(|e| CacheError::IndexError(format!("Failed to serialise index: {e}")))?;
        write_atomic(&self.cache_dir.join(INDEX_FILE), &json)
            .await
            .map_err(|e| CacheError::IndexError(format!("Failed to write index: {e}")))?;
        index.unsaved_touches = 0;
        Ok(())
    }

    fn sync_counters(&self, index: &DiskIndex) {
        self.current_size
            .store(index.total_bytes(), Ordering::Relaxed);
        self.item_count
            .store(index.entries.len(), Ordering::Relaxed);
    }
}

#[async_trait::async_trait]
impl ImageCachePort for DiskImageCache {
    async fn get(&self, id: &ImageId) -> CacheResult<Option<CacheEntry>> {
        self.lookup(id, true).await
    }

    async fn peek(&self, id: &ImageId) -> CacheResult<Option<CacheEntry>> {
        self.lookup(id, false).await
    }

    async fn put(&self, entry: CacheEntry) -> CacheResult<bool> {
        let ImagePayload::Encoded(bytes) = &entry.payload else {
            return Err(CacheError::UnsupportedPayload("disk"));
        };
        let size = bytes.len() as u64;
        if size > self.budget.max_bytes() {
            debug!(id = %entry.id, size, "Image exceeds disk budget, not cached");
            return Ok(false);
        }

        let mut index = self.index.lock().await;
        let file = Self::file_name(&entry.id);
        let path = self.cache_dir.join(&file);
        let replaced = index.entries.remove(&entry.id).is_some();
        self.evict_until(&mut index, self.budget.max_bytes(), size, Some(&entry.id))
            .await;
        if !self
            .budget
            .fits(index.total_bytes() + size, index.entries.len() + 1)
        {
            debug!(
                id = %entry.id,
                size,
                policy = self.policy.name(),
                "Eviction policy freed too little room, not cached"
            );
            if replaced {
                remove_data_file(&path).await;
            }
            self.sync_counters(&index);
            self.persist(&mut index).await?;
            return Ok(false);
        }

        if let Err(e) = write_atomic(&path, bytes).await {
            self.sync_counters(&index);
            self.persist(&mut index).await?;
            return Err(CacheError::IoError(format!("Failed to write cache file: {e}")));
        }

        let now = Utc::now();
        let mut metadata = entry.metadata;
        metadata.byte_size = size;
        index.next_sequence += 1;
        let sequence = index.next_sequence;
        index.entries.insert(
            entry.id.clone(),
            IndexRecord {
                file,
                metadata,
                last_access: now,
                sequence,
                time_to_live_ms: entry.time_to_live.num_milliseconds(),
                expires_at: expiry_from(now, entry.time_to_live),
            },
        );
        self.sync_counters(&index);
        self.persist(&mut index).await?;

        debug!(id = %entry.id, path = %path.display(), size, "Stored image in disk cache");
        Ok(true)
    }

    async fn remove(&self, id: &ImageId) -> CacheResult<()> {
        let mut index = self.index.lock().await;
        let Some(record) = index.entries.remove(id) else {
            return Ok(());
        };
        remove_data_file(&self.cache_dir.join(&record.file)).await;
        self.sync_counters(&index);
        self.persist(&mut index).await?;
        debug!(id = %id, "Removed from disk cache");
        Ok(())
    }

    async fn clear(&self) -> CacheResult<()> {
        let mut index = self.index.lock().await;
        index.entries.clear();
        remove_orphans(&self.cache_dir, &index).await?;
        self.sync_counters(&index);
        self.persist(&mut index).await?;
        debug!("Cleared disk cache");
        Ok(())
    }

    fn total_bytes(&self) -> u64 {
        self.current_size.load(Ordering::Relaxed)
    }

    fn len(&self) -> usize {
        self.item_count.load(Ordering::Relaxed)
    }
}

async fn load_index(path: &Path) -> DiskIndex {
    match fs::read(path).await {
        Ok(bytes) => match serde_json::from_slice::<DiskIndex>(&bytes) {
            Ok(index) if index.version == INDEX_VERSION => index,
            Ok(index) => {
                warn!(version = index.version, "Unknown disk index version, starting empty");
                DiskIndex::empty()
            }
            Err(e) => {
                warn!(error = %e, "Corrupt disk index, starting empty");
                DiskIndex::empty()
            }
        },
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %e, "Failed to read disk index, starting empty");
            }
            DiskIndex::empty()
        }
    }
}

/// Deletes data files the index does not reference and leftover temporaries.
async fn remove_orphans(cache_dir: &Path, index: &DiskIndex) -> CacheResult<()> {
    let mut entries = fs::read_dir(cache_dir)
        .await
        .map_err(|e| CacheError::IoError(format!("Failed to read cache dir: {e}")))?;

    let known: std::collections::HashSet<&str> =
        index.entries.values().map(|r| r.file.as_str()).collect();

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| CacheError::IoError(format!("Failed to read entry: {e}")))?
    {
        let path = entry.path();
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            continue;
        };
        let name = entry.file_name();
        let orphan = match ext {
            DATA_EXTENSION => !known.contains(name.to_string_lossy().as_ref()),
            TEMP_EXTENSION => true,
            _ => false,
        };
        if orphan {
            trace!(path = %path.display(), "Removing orphaned cache file");
            if let Err(e) = fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "Failed to remove cache file");
            }
        }
    }
    Ok(())
}

async fn remove_data_file(path: &Path) {
    if let Err(e) = fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "Failed to remove cache file");
    }
}

async fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension(TEMP_EXTENSION);
    let mut file = fs::File::create(&tmp).await?;
    file.write_all(data).await?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&tmp, path).await
}

/// Returns the default cache directory path.
#[must_use]
pub fn default_cache_dir() -> PathBuf {
    directories::ProjectDirs::from("com", "linuxmobile", crate::NAME).map_or_else(
        || {
            std::env::temp_dir()
                .join(crate::NAME)
                .join("cache")
                .join("images")
        },
        |dirs| dirs.cache_dir().join("images"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::Dimensions;
    use tempfile::TempDir;

    /// Never offers a victim.
    struct RefuseEviction;

    impl EvictionPolicy for RefuseEviction {
        fn select_victim(&self, _candidates: &[EvictionCandidate]) -> Option<usize> {
            None
        }

        fn name(&self) -> &'static str {
            "refuse"
        }
    }

    fn sized(id: &str, len: usize) -> CacheEntry {
        let mut entry = entry(id, b"");
        entry.payload = ImagePayload::Encoded(Bytes::from(vec![7u8; len]));
        entry
    }

    fn read_index(dir: &Path) -> DiskIndex {
        serde_json::from_slice(&std::fs::read(dir.join(INDEX_FILE)).unwrap()).unwrap()
    }

    fn entry(id: &str, data: &'static [u8]) -> CacheEntry {
        let metadata = EntryMetadata {
            dimensions: Dimensions::new(1, 1),
            byte_size: 0,
            image_type: None,
            animated: false,
            placeholder: false,
            url: format!("https://example.com/{id}"),
        };
        CacheEntry::encoded(ImageId::new(id), Bytes::from_static(data), metadata)
    }

    async fn create_test_cache() -> (DiskImageCache, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let cache = DiskImageCache::with_capacity(temp_dir.path().to_path_buf(), 1024 * 1024)
            .await
            .unwrap();
        (cache, temp_dir)
    }

    #[tokio::test]
    async fn test_put_and_get_bytes() {
        let (cache, _temp) = create_test_cache().await;
        let id = ImageId::new("test1");

        assert!(cache.put(entry("test1", b"test image data")).await.unwrap());
        let retrieved = cache.get(&id).await.unwrap().unwrap();

        assert_eq!(retrieved.encoded_bytes().unwrap().as_ref(), b"test image data");
        assert_eq!(retrieved.metadata.byte_size, 15);
        assert_eq!(retrieved.metadata.url, "https://example.com/test1");
    }

    #[tokio::test]
    async fn test_cache_miss() {
        let (cache, _temp) = create_test_cache().await;
        let result = cache.get(&ImageId::new("nonexistent")).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_remove() {
        let (cache, _temp) = create_test_cache().await;
        let id = ImageId::new("test1");

        cache.put(entry("test1", b"test")).await.unwrap();
        assert!(cache.contains(&id).await);

        cache.remove(&id).await.unwrap();
        assert!(!cache.contains(&id).await);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_atomic_counters_sync() {
        let (cache, _temp) = create_test_cache().await;

        assert_eq!(cache.total_bytes(), 0);
        assert_eq!(cache.len(), 0);

        cache.put(entry("test1", b"hello")).await.unwrap();
        cache.put(entry("test2", b"world!")).await.unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.total_bytes(), 11);

        cache.put(entry("test1", b"hey")).await.unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.total_bytes(), 9);

        cache.remove(&ImageId::new("test2")).await.unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_bytes(), 3);

        cache.clear().await.unwrap();
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.total_bytes(), 0);
    }

    #[tokio::test]
    async fn test_eviction_is_least_recently_used() {
        let temp_dir = TempDir::new().unwrap();
        let cache = DiskImageCache::with_capacity(temp_dir.path().to_path_buf(), 12)
            .await
            .unwrap();

        cache.put(entry("test1", b"123456")).await.unwrap();
        cache.put(entry("test2", b"123456")).await.unwrap();
        let _ = cache.get(&ImageId::new("test1")).await.unwrap();
        cache.put(entry("test3", b"123456")).await.unwrap();

        assert!(cache.contains(&ImageId::new("test1")).await);
        assert!(!cache.contains(&ImageId::new("test2")).await);
        assert_eq!(cache.total_bytes(), 12);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_peek_does_not_touch() {
        let temp_dir = TempDir::new().unwrap();
        let cache = DiskImageCache::with_capacity(temp_dir.path().to_path_buf(), 12)
            .await
            .unwrap();

        cache.put(entry("test1", b"123456")).await.unwrap();
        cache.put(entry("test2", b"123456")).await.unwrap();
        let _ = cache.peek(&ImageId::new("test1")).await.unwrap();
        cache.put(entry("test3", b"123456")).await.unwrap();

        assert!(!cache.contains(&ImageId::new("test1")).await);
    }

    #[tokio::test]
    async fn test_oversized_entry_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let cache = DiskImageCache::with_capacity(temp_dir.path().to_path_buf(), 4)
            .await
            .unwrap();
        assert!(!cache.put(entry("big", b"123456")).await.unwrap());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_decoded_payload() {
        let (cache, _temp) = create_test_cache().await;
        let image = crate::domain::entities::ImageContainer::new(image::DynamicImage::new_rgba8(1, 1));
        let decoded = CacheEntry::decoded(ImageId::new("x"), image, "u", false);
        assert!(matches!(
            cache.put(decoded).await,
            Err(CacheError::UnsupportedPayload("disk"))
        ));
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().to_path_buf();
        {
            let cache = DiskImageCache::with_capacity(dir.clone(), 1024).await.unwrap();
            cache.put(entry("test1", b"persisted")).await.unwrap();
        }

        let cache = DiskImageCache::with_capacity(dir, 1024).await.unwrap();
        assert_eq!(cache.len(), 1);
        let entry = cache.get(&ImageId::new("test1")).await.unwrap().unwrap();
        assert_eq!(entry.encoded_bytes().unwrap().as_ref(), b"persisted");
    }

    #[tokio::test]
    async fn test_open_removes_orphans_and_stale_records() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().to_path_buf();
        {
            let cache = DiskImageCache::with_capacity(dir.clone(), 1024).await.unwrap();
            cache.put(entry("kept", b"kept")).await.unwrap();
            cache.put(entry("lost", b"lost")).await.unwrap();
        }
        std::fs::remove_file(dir.join(DiskImageCache::file_name(&ImageId::new("lost")))).unwrap();
        std::fs::write(dir.join("stray.img"), b"stray").unwrap();
        std::fs::write(dir.join("half.tmp"), b"half").unwrap();

        let cache = DiskImageCache::with_capacity(dir.clone(), 1024).await.unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&ImageId::new("kept")).await);
        assert!(!dir.join("stray.img").exists());
        assert!(!dir.join("half.tmp").exists());
    }

    #[tokio::test]
    async fn test_vanished_file_is_a_miss() {
        let (cache, temp) = create_test_cache().await;
        let id = ImageId::new("test1");
        cache.put(entry("test1", b"data")).await.unwrap();
        std::fs::remove_file(temp.path().join(DiskImageCache::file_name(&id))).unwrap();

        assert!(cache.get(&id).await.unwrap().is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_index_starts_empty() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join(INDEX_FILE), b"{not json").unwrap();
        let cache = DiskImageCache::with_capacity(temp_dir.path().to_path_buf(), 1024)
            .await
            .unwrap();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_refusing_policy_never_exceeds_budget() {
        let temp_dir = TempDir::new().unwrap();
        let cache = DiskImageCache::open(
            temp_dir.path().to_path_buf(),
            Arc::new(CacheBudget::new(1000, 0)),
            Arc::new(RefuseEviction),
        )
        .await
        .unwrap();

        assert!(cache.put(sized("a", 400)).await.unwrap());
        assert!(cache.put(sized("b", 400)).await.unwrap());
        assert!(!cache.put(sized("c", 400)).await.unwrap());

        assert!(cache.total_bytes() <= 1000);
        assert_eq!(cache.len(), 2);
        let rejected = temp_dir.path().join(DiskImageCache::file_name(&ImageId::new("c")));
        assert!(!rejected.exists());
    }

    #[tokio::test]
    async fn test_rejected_replacement_removes_old_file() {
        let temp_dir = TempDir::new().unwrap();
        let cache = DiskImageCache::open(
            temp_dir.path().to_path_buf(),
            Arc::new(CacheBudget::new(1000, 0)),
            Arc::new(RefuseEviction),
        )
        .await
        .unwrap();
        cache.put(sized("a", 400)).await.unwrap();
        cache.put(sized("b", 400)).await.unwrap();

        assert!(!cache.put(sized("a", 700)).await.unwrap());
        assert!(!cache.contains(&ImageId::new("a")).await);
        assert_eq!(cache.total_bytes(), 400);
        let old = temp_dir.path().join(DiskImageCache::file_name(&ImageId::new("a")));
        assert!(!old.exists());
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss_and_deleted() {
        let (cache, temp) = create_test_cache().await;
        let id = ImageId::new("stale");
        cache
            .put(entry("stale", b"old").with_time_to_live(TimeDelta::milliseconds(1)))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        assert!(!cache.contains(&id).await);
        assert!(cache.peek(&id).await.unwrap().is_none());
        assert!(cache.is_empty());
        assert!(!temp.path().join(DiskImageCache::file_name(&id)).exists());
    }

    #[tokio::test]
    async fn test_expired_entries_dropped_on_open() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().to_path_buf();
        {
            let cache = DiskImageCache::with_capacity(dir.clone(), 1024).await.unwrap();
            cache.put(entry("kept", b"kept")).await.unwrap();
            cache
                .put(entry("stale", b"stale").with_time_to_live(TimeDelta::milliseconds(1)))
                .await
                .unwrap();
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let cache = DiskImageCache::with_capacity(dir.clone(), 1024).await.unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_bytes(), 4);
        assert!(!dir.join(DiskImageCache::file_name(&ImageId::new("stale"))).exists());
    }

    #[tokio::test]
    async fn test_get_refreshes_expiry_but_peek_does_not() {
        let (cache, _temp) = create_test_cache().await;
        let id = ImageId::new("a");
        cache
            .put(entry("a", b"data").with_time_to_live(TimeDelta::hours(1)))
            .await
            .unwrap();
        let stored = cache.peek(&id).await.unwrap().unwrap();
        assert_eq!(stored.time_to_live, TimeDelta::hours(1));

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(cache.peek(&id).await.unwrap().unwrap().expires_at, stored.expires_at);
        assert!(cache.get(&id).await.unwrap().unwrap().expires_at > stored.expires_at);
    }

    #[tokio::test]
    async fn test_recency_written_lazily() {
        let (cache, temp) = create_test_cache().await;
        let id = ImageId::new("a");
        cache.put(entry("a", b"data")).await.unwrap();
        let written = read_index(temp.path()).entries[&id].sequence;

        cache.get(&id).await.unwrap().unwrap();
        assert_eq!(read_index(temp.path()).entries[&id].sequence, written);

        cache.flush().await.unwrap();
        assert!(read_index(temp.path()).entries[&id].sequence > written);
    }

    #[tokio::test]
    async fn test_recency_write_failure_keeps_hits() {
        let (cache, temp) = create_test_cache().await;
        let id = ImageId::new("a");
        cache.put(entry("a", b"data")).await.unwrap();

        // A directory where the staged index goes makes every index write fail.
        let staged = temp.path().join(INDEX_FILE).with_extension(TEMP_EXTENSION);
        std::fs::create_dir(&staged).unwrap();
        for _ in 0..=RECENCY_FLUSH_INTERVAL {
            let hit = cache.get(&id).await.unwrap().unwrap();
            assert_eq!(hit.encoded_bytes().unwrap().as_ref(), b"data");
        }
        assert!(cache.flush().await.is_err());

        std::fs::remove_dir(&staged).unwrap();
        cache.flush().await.unwrap();
        assert_eq!(cache.stats().hits, u64::try_from(RECENCY_FLUSH_INTERVAL).unwrap() + 1);
    }
}
