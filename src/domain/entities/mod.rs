//! Domain entity definitions.

mod cache_entry;
mod image;
mod request;

pub use cache_entry::{CacheEntry, CacheTier, EntryMetadata, ImagePayload, expiry_from};
pub use image::{
    AnimationFrame, ContentMode, Dimensions, DownloadSummary, ImageContainer, ImageId, ImageType,
    LoadSource, LoadedImage,
};
pub use request::{
    CoalescingKey, DEFAULT_TIME_TO_LIVE, FetchOptions, ImageRequest, LoadingSources, Priority,
};
