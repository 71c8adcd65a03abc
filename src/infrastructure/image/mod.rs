//! Image pipeline infrastructure.
//!
//! This module provides:
//! - Memory caching with pluggable eviction
//! - Disk caching for persistence
//! - Codec catalogue with progressive and animated decoding
//! - HTTP downloading behind a priority gate
//! - Coalesced fetch operations and ordered callback delivery

pub mod codec;
mod delivery;
pub mod disk_cache;
pub mod downloader;
pub mod eviction;
pub mod memory_cache;
mod operation;
mod pipeline;
pub mod placeholder;
pub mod throttle;

pub use codec::{CodecCatalogue, CodecLookup, StandardCodec};
pub use delivery::CallbackExecutor;
pub use disk_cache::DiskImageCache;
pub use downloader::{HttpDownloader, HttpDownloaderConfig};
pub use eviction::{EvictionCandidate, EvictionKind, EvictionPolicy, LeastRecentlyUsed, SizeWeightedLru};
pub use memory_cache::{CacheStats, MemoryImageCache};
pub use operation::OperationState;
pub use pipeline::{FetchHandle, ImagePipeline, MemoryPressure, PipelineStats};
pub use placeholder::{PLACEHOLDER_SCHEME, PlaceholderSchemeCache};
pub use throttle::{DownloadGate, DownloadPermit};
