//! Process-wide pipeline configuration.
//!
//! Constructed once at the top of the call graph and shared by `Arc`; there is
//! no ambient singleton. Reads are lock-free or behind read-mostly locks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::RwLock;

use super::app_config::PipelineConfig;
use crate::domain::ports::{AdditionalCache, PipelineLogger, PipelineObserver};
use crate::infrastructure::logging::LoggerLayer;

/// Byte and entry-count limits of one cache tier.
/// Shared with the tier, which reads it on every insertion.
#[derive(Debug)]
pub struct CacheBudget {
    max_bytes: AtomicU64,
    max_entries: AtomicUsize,
}

impl CacheBudget {
    /// Creates a budget. `max_entries == 0` means no entry limit.
    #[must_use]
    pub const fn new(max_bytes: u64, max_entries: usize) -> Self {
        Self {
            max_bytes: AtomicU64::new(max_bytes),
            max_entries: AtomicUsize::new(max_entries),
        }
    }

    /// Returns the byte budget.
    #[must_use]
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes.load(Ordering::Relaxed)
    }

    /// Returns the entry limit, 0 for unlimited.
    #[must_use]
    pub fn max_entries(&self) -> usize {
        self.max_entries.load(Ordering::Relaxed)
    }

    /// Sets the byte budget. Takes effect on the tier's next insertion or trim.
    pub fn set_max_bytes(&self, bytes: u64) {
        self.max_bytes.store(bytes, Ordering::Relaxed);
    }

    /// Sets the entry limit.
    pub fn set_max_entries(&self, entries: usize) {
        self.max_entries.store(entries, Ordering::Relaxed);
    }

    /// Returns true when `bytes` across `entries` fit.
    #[must_use]
    pub fn fits(&self, bytes: u64, entries: usize) -> bool {
        let max_entries = self.max_entries();
        bytes <= self.max_bytes() && (max_entries == 0 || entries <= max_entries)
    }
}

/// Process-wide policy read by the pipeline and its caches.
pub struct GlobalConfiguration {
    memory_budget: Arc<CacheBudget>,
    disk_budget: Arc<CacheBudget>,
    max_concurrent_downloads: usize,
    clear_memory_on_background: AtomicBool,
    observers: RwLock<Vec<Arc<dyn PipelineObserver>>>,
    additional_caches: RwLock<Vec<Arc<dyn AdditionalCache>>>,
    logger: RwLock<Option<Arc<dyn PipelineLogger>>>,
}

impl std::fmt::Debug for GlobalConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalConfiguration")
            .field("memory_budget", &self.memory_budget)
            .field("disk_budget", &self.disk_budget)
            .field("max_concurrent_downloads", &self.max_concurrent_downloads)
            .field(
                "clear_memory_on_background",
                &self.clear_memory_on_background(),
            )
            .field("observers", &self.observers.read().len())
            .field("additional_caches", &self.additional_caches.read().len())
            .finish_non_exhaustive()
    }
}

impl Default for GlobalConfiguration {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

impl GlobalConfiguration {
    /// Builds the runtime configuration from the file/CLI configuration.
    #[must_use]
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            memory_budget: Arc::new(CacheBudget::new(
                config.cache.memory_bytes,
                config.cache.memory_entries,
            )),
            disk_budget: Arc::new(CacheBudget::new(
                config.cache.disk_bytes,
                config.cache.disk_entries,
            )),
            max_concurrent_downloads: config.network.max_concurrent_downloads.max(1),
            clear_memory_on_background: AtomicBool::new(config.clear_memory_on_background),
            observers: RwLock::new(Vec::new()),
            additional_caches: RwLock::new(Vec::new()),
            logger: RwLock::new(None),
        }
    }

    /// Memory tier budget.
    #[must_use]
    pub fn memory_budget(&self) -> &Arc<CacheBudget> {
        &self.memory_budget
    }

    /// Disk tier budget.
    #[must_use]
    pub fn disk_budget(&self) -> &Arc<CacheBudget> {
        &self.disk_budget
    }

    /// Maximum simultaneous network downloads. Fixed at construction.
    #[must_use]
    pub const fn max_concurrent_downloads(&self) -> usize {
        self.max_concurrent_downloads
    }

    /// Whether a background/low-memory signal clears the memory tier.
    #[must_use]
    pub fn clear_memory_on_background(&self) -> bool {
        self.clear_memory_on_background.load(Ordering::Relaxed)
    }

    /// Sets whether a background/low-memory signal clears the memory tier.
    pub fn set_clear_memory_on_background(&self, enabled: bool) {
        self.clear_memory_on_background
            .store(enabled, Ordering::Relaxed);
    }

    /// Registers a pipeline observer.
    pub fn add_observer(&self, observer: Arc<dyn PipelineObserver>) {
        self.observers.write().push(observer);
    }

    /// Unregisters a pipeline observer.
    pub fn remove_observer(&self, observer: &Arc<dyn PipelineObserver>) {
        self.observers.write().retain(|o| !Arc::ptr_eq(o, observer));
    }

    /// Snapshot of the registered observers.
    #[must_use]
    pub fn observers(&self) -> Vec<Arc<dyn PipelineObserver>> {
        self.observers.read().clone()
    }

    /// Registers an additional cache, consulted after those already registered.
    pub fn add_additional_cache(&self, cache: Arc<dyn AdditionalCache>) {
        self.additional_caches.write().push(cache);
    }

    /// Unregisters an additional cache.
    pub fn remove_additional_cache(&self, cache: &Arc<dyn AdditionalCache>) {
        self.additional_caches
            .write()
            .retain(|c| !Arc::ptr_eq(c, cache));
    }

    /// Snapshot of the additional caches in registration order.
    #[must_use]
    pub fn additional_caches(&self) -> Vec<Arc<dyn AdditionalCache>> {
        self.additional_caches.read().clone()
    }

    /// Installs or removes the logger sink.
    pub fn set_logger(&self, logger: Option<Arc<dyn PipelineLogger>>) {
        *self.logger.write() = logger;
    }

    /// Returns the logger sink.
    #[must_use]
    pub fn logger(&self) -> Option<Arc<dyn PipelineLogger>> {
        self.logger.read().clone()
    }

    /// Returns a `tracing` layer forwarding this crate's events to the logger sink.
    #[must_use]
    pub fn logging_layer(self: &Arc<Self>) -> LoggerLayer {
        LoggerLayer::new(self.clone())
    }
}
