//! Cache entries shared by the memory and disk tiers.

use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use super::image::{Dimensions, ImageContainer, ImageId, ImageType};
use super::request::DEFAULT_TIME_TO_LIVE;

/// Which tier an entry lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheTier {
    /// In-process working set of decoded images.
    Memory,
    /// Durable store of encoded bytes.
    Disk,
}

impl std::fmt::Display for CacheTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::Disk => write!(f, "disk"),
        }
    }
}

/// Metadata stored alongside every cached image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// Pixel dimensions.
    pub dimensions: Dimensions,
    /// Bytes the entry occupies in its tier.
    pub byte_size: u64,
    /// Encoded format, if known.
    pub image_type: Option<ImageType>,
    /// Whether the image has more than one frame.
    pub animated: bool,
    /// Whether the image is a placeholder.
    pub placeholder: bool,
    /// URL the image was fetched from.
    pub url: String,
}

/// Image payload: decoded pixels in memory, encoded bytes on disk.
#[derive(Debug, Clone)]
pub enum ImagePayload {
    /// Decoded image.
    Decoded(ImageContainer),
    /// Encoded bytes as received or re-encoded.
    Encoded(Bytes),
}

/// A cached image.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The image ID.
    pub id: ImageId,
    /// The payload.
    pub payload: ImagePayload,
    /// Descriptive metadata.
    pub metadata: EntryMetadata,
    /// Last time the entry was read or written.
    pub last_access: DateTime<Utc>,
    /// Tier holding the entry.
    pub tier: CacheTier,
    /// Lifetime granted on store and on every refreshing read.
    pub time_to_live: TimeDelta,
    /// After this instant the entry is treated as absent.
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Creates a memory-tier entry from a decoded image.
    #[must_use]
    pub fn decoded(
        id: ImageId,
        image: ImageContainer,
        url: impl Into<String>,
        placeholder: bool,
    ) -> Self {
        let metadata = EntryMetadata {
            dimensions: image.dimensions(),
            byte_size: image.byte_cost(),
            image_type: image.image_type().cloned(),
            animated: image.is_animated(),
            placeholder,
            url: url.into(),
        };
        let now = Utc::now();
        Self {
            id,
            payload: ImagePayload::Decoded(image),
            metadata,
            last_access: now,
            tier: CacheTier::Memory,
            time_to_live: DEFAULT_TIME_TO_LIVE,
            expires_at: now + DEFAULT_TIME_TO_LIVE,
        }
    }

    /// Creates a disk-tier entry from encoded bytes.
    /// `metadata.byte_size` is overwritten with the encoded length.
    #[must_use]
    pub fn encoded(id: ImageId, bytes: Bytes, mut metadata: EntryMetadata) -> Self {
        metadata.byte_size = bytes.len() as u64;
        let now = Utc::now();
        Self {
            id,
            payload: ImagePayload::Encoded(bytes),
            metadata,
            last_access: now,
            tier: CacheTier::Disk,
            time_to_live: DEFAULT_TIME_TO_LIVE,
            expires_at: now + DEFAULT_TIME_TO_LIVE,
        }
    }

    /// Sets the lifetime, counted from now.
    #[must_use]
    pub fn with_time_to_live(mut self, time_to_live: TimeDelta) -> Self {
        self.time_to_live = time_to_live;
        self.expires_at = expiry_from(Utc::now(), time_to_live);
        self
    }

    /// Returns true once `now` has reached the expiry.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Records an access at `now` and restarts the lifetime.
    pub fn refresh(&mut self, now: DateTime<Utc>) {
        self.last_access = now;
        self.expires_at = expiry_from(now, self.time_to_live);
    }

    /// Returns the decoded image, if this is a memory entry.
    #[must_use]
    pub const fn decoded_image(&self) -> Option<&ImageContainer> {
        match &self.payload {
            ImagePayload::Decoded(image) => Some(image),
            ImagePayload::Encoded(_) => None,
        }
    }

    /// Returns the encoded bytes, if this is a disk entry.
    #[must_use]
    pub const fn encoded_bytes(&self) -> Option<&Bytes> {
        match &self.payload {
            ImagePayload::Encoded(bytes) => Some(bytes),
            ImagePayload::Decoded(_) => None,
        }
    }
}

/// `now + time_to_live`, saturating at the latest representable instant.
#[must_use]
pub fn expiry_from(now: DateTime<Utc>, time_to_live: TimeDelta) -> DateTime<Utc> {
    now.checked_add_signed(time_to_live)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> CacheEntry {
        let image = ImageContainer::new(image::DynamicImage::new_rgba8(2, 2));
        CacheEntry::decoded(ImageId::new("a"), image, "https://example.com/a", false)
    }

    #[test]
    fn test_default_lifetime_is_thirty_days() {
        let entry = entry();
        assert_eq!(entry.time_to_live, TimeDelta::days(30));
        assert!(!entry.is_expired(Utc::now()));
        assert!(entry.is_expired(Utc::now() + TimeDelta::days(31)));
    }

    #[test]
    fn test_refresh_restarts_lifetime() {
        let mut entry = entry().with_time_to_live(TimeDelta::seconds(10));
        let later = Utc::now() + TimeDelta::seconds(8);
        entry.refresh(later);
        assert_eq!(entry.last_access, later);
        assert!(!entry.is_expired(later + TimeDelta::seconds(9)));
        assert!(entry.is_expired(later + TimeDelta::seconds(10)));
    }

    #[test]
    fn test_zero_lifetime_expires_immediately() {
        let entry = entry().with_time_to_live(TimeDelta::zero());
        assert!(entry.is_expired(Utc::now()));
    }

    #[test]
    fn test_huge_lifetime_saturates() {
        let entry = entry().with_time_to_live(TimeDelta::MAX);
        assert_eq!(entry.expires_at, DateTime::<Utc>::MAX_UTC);
    }
}
