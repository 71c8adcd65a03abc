//! Port definition for image caching.

use async_trait::async_trait;

use crate::domain::entities::{CacheEntry, ImageId};
use crate::domain::errors::FetchError;

/// Result type for cache operations.
pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Errors that can occur during cache operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    /// I/O error during cache operation.
    #[error("IO error: {0}")]
    IoError(String),
    /// The persistent index could not be read or written.
    #[error("Index error: {0}")]
    IndexError(String),
    /// The tier cannot hold this kind of payload.
    #[error("Unsupported payload for {0} cache")]
    UnsupportedPayload(&'static str),
}

impl From<CacheError> for FetchError {
    fn from(err: CacheError) -> Self {
        Self::CacheFailure(err.to_string())
    }
}

/// Port for a byte-budgeted image cache tier.
/// Implementations must be thread-safe and serialise their own mutations.
#[async_trait]
pub trait ImageCachePort: Send + Sync {
    /// Looks up an unexpired entry, marks it most recently used and restarts
    /// its lifetime. Expired entries are removed and reported as absent.
    async fn get(&self, id: &ImageId) -> CacheResult<Option<CacheEntry>>;

    /// Looks up an unexpired entry without touching its recency or expiry.
    async fn peek(&self, id: &ImageId) -> CacheResult<Option<CacheEntry>>;

    /// Stores an entry, evicting others to stay within budget.
    /// Returns false, leaving no copy of the entry behind, when it still does
    /// not fit after the eviction policy stopped offering victims.
    async fn put(&self, entry: CacheEntry) -> CacheResult<bool>;

    /// Removes an entry.
    async fn remove(&self, id: &ImageId) -> CacheResult<()>;

    /// Clears all entries.
    async fn clear(&self) -> CacheResult<()>;

    /// Returns the resident size in bytes.
    fn total_bytes(&self) -> u64;

    /// Returns the current number of cached images.
    fn len(&self) -> usize;

    /// Returns true if the cache is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
