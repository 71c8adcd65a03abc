//! Image fetch requests.

use bitflags::bitflags;
use chrono::TimeDelta;

use super::cache_entry::EntryMetadata;
use super::image::{ContentMode, Dimensions, ImageId, ImageType};
use crate::domain::errors::FetchError;

bitflags! {
    /// Per-request option flags. Part of the coalescing key.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FetchOptions: u32 {
        /// The resolved image is a stand-in, not the true content.
        /// Placeholder results are never persisted to the disk cache.
        const PLACEHOLDER = 1 << 0;
        /// Cache lookups refresh neither the entry's recency nor its expiry.
        const DO_NOT_RESET_EXPIRY = 1 << 1;
    }
}

bitflags! {
    /// Stages a request may be resolved from. Part of the coalescing key.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LoadingSources: u8 {
        /// The in-process memory tier.
        const MEMORY_CACHE = 1 << 0;
        /// The persistent disk tier.
        const DISK_CACHE = 1 << 1;
        /// Host-registered additional caches.
        const ADDITIONAL_CACHE = 1 << 2;
        /// The network downloader.
        const NETWORK = 1 << 3;
    }
}

impl Default for LoadingSources {
    fn default() -> Self {
        Self::all()
    }
}

/// Lifetime given to cached images unless a request asks for another.
pub const DEFAULT_TIME_TO_LIVE: TimeDelta = TimeDelta::days(30);

/// Scheduling priority for the network stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Prefetching and other speculative work.
    Low,
    /// Default priority.
    #[default]
    Normal,
    /// Visible content.
    High,
}

/// Identity under which concurrent requests share one fetch operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CoalescingKey {
    /// The image identifier.
    pub id: ImageId,
    /// The request options.
    pub options: FetchOptions,
    /// The stages the request may use.
    pub sources: LoadingSources,
}

impl std::fmt::Display for CoalescingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}#{:x}/{:x}",
            self.id,
            self.options.bits(),
            self.sources.bits()
        )
    }
}

/// An abstract request for an image. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRequest {
    /// Cache and coalescing identifier.
    pub id: ImageId,
    /// Where the image can be resolved from.
    pub url: String,
    /// Size the caller intends to display the image at.
    pub target: Option<Dimensions>,
    /// How the image is fitted into `target`.
    pub content_mode: ContentMode,
    /// Option flags.
    pub options: FetchOptions,
    /// Network scheduling priority.
    pub priority: Priority,
    /// Expected encoding, used before the bytes can be sniffed.
    pub type_hint: Option<ImageType>,
    /// Lifetime of the cache entries written for this request.
    pub time_to_live: TimeDelta,
    /// Stages the request may be resolved from.
    pub sources: LoadingSources,
}

impl ImageRequest {
    /// Creates a request whose identifier is derived from the URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            id: ImageId::from_url(&url),
            url,
            target: None,
            content_mode: ContentMode::default(),
            options: FetchOptions::empty(),
            priority: Priority::default(),
            type_hint: None,
            time_to_live: DEFAULT_TIME_TO_LIVE,
            sources: LoadingSources::default(),
        }
    }

    /// Sets an explicit identifier.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<ImageId>) -> Self {
        self.id = id.into();
        self
    }

    /// Sets the target dimensions.
    #[must_use]
    pub const fn with_target(mut self, width: u32, height: u32) -> Self {
        self.target = Some(Dimensions::new(width, height));
        self
    }

    /// Sets the content mode.
    #[must_use]
    pub const fn with_content_mode(mut self, mode: ContentMode) -> Self {
        self.content_mode = mode;
        self
    }

    /// Sets the option flags.
    #[must_use]
    pub const fn with_options(mut self, options: FetchOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the network priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the expected image type.
    #[must_use]
    pub fn with_type_hint(mut self, image_type: ImageType) -> Self {
        self.type_hint = Some(image_type);
        self
    }

    /// Sets the lifetime of cache entries written for this request.
    #[must_use]
    pub const fn with_time_to_live(mut self, time_to_live: TimeDelta) -> Self {
        self.time_to_live = time_to_live;
        self
    }

    /// Restricts the stages the request may be resolved from.
    #[must_use]
    pub const fn with_sources(mut self, sources: LoadingSources) -> Self {
        self.sources = sources;
        self
    }

    /// Returns true when `source` may be consulted.
    #[must_use]
    pub const fn allows(&self, source: LoadingSources) -> bool {
        self.sources.contains(source)
    }

    /// Returns true for placeholder requests.
    #[must_use]
    pub const fn is_placeholder(&self) -> bool {
        self.options.contains(FetchOptions::PLACEHOLDER)
    }

    /// Returns true when cache hits should refresh recency and expiry.
    #[must_use]
    pub const fn resets_expiry(&self) -> bool {
        !self.options.contains(FetchOptions::DO_NOT_RESET_EXPIRY)
    }

    /// Returns the key used to deduplicate concurrent fetches.
    #[must_use]
    pub fn coalescing_key(&self) -> CoalescingKey {
        CoalescingKey {
            id: self.id.clone(),
            options: self.options,
            sources: self.sources,
        }
    }

    /// Checks that the request can be fetched.
    ///
    /// # Errors
    /// Returns `FetchError::InvalidRequest` for an empty identifier or URL, a
    /// target with a zero side, a non-positive lifetime or no loading sources.
    pub fn validate(&self) -> Result<(), FetchError> {
        if self.id.as_str().is_empty() {
            return Err(FetchError::InvalidRequest("empty image identifier".into()));
        }
        if self.url.trim().is_empty() {
            return Err(FetchError::InvalidRequest("empty image URL".into()));
        }
        if self.target.is_some_and(|t| t.is_empty()) {
            return Err(FetchError::InvalidRequest(
                "target dimensions must be non-zero".into(),
            ));
        }
        if self.time_to_live <= TimeDelta::zero() {
            return Err(FetchError::InvalidRequest(
                "time to live must be positive".into(),
            ));
        }
        if self.sources.is_empty() {
            return Err(FetchError::InvalidRequest("no loading sources".into()));
        }
        Ok(())
    }

    /// Returns true when a cached image with `meta` is good enough to be the
    /// final result, false when it can only serve as a preview.
    #[must_use]
    pub fn is_satisfied_by(&self, meta: &EntryMetadata) -> bool {
        if meta.placeholder && !self.is_placeholder() {
            return false;
        }
        let Some(target) = self.target else {
            return true;
        };
        if meta.dimensions.is_empty() {
            return false;
        }
        let scale_x = f64::from(target.width) / f64::from(meta.dimensions.width);
        let scale_y = f64::from(target.height) / f64::from(meta.dimensions.height);
        match self.content_mode {
            ContentMode::Fit => scale_x.min(scale_y) <= 1.0,
            ContentMode::Fill => scale_x.max(scale_y) <= 1.0,
            ContentMode::Center => true,
        }
    }
}
