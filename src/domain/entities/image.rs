//! Domain types for images moving through the pipeline.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use image::DynamicImage;
use image::imageops::FilterType;
use serde::{Deserialize, Serialize};

/// Unique identifier for a cached image.
/// Used both as the cache key and as the coalescing key for in-flight fetches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageId(pub String);

impl ImageId {
    /// Creates a new `ImageId` from any string-like input.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Creates an `ImageId` from a URL by hashing it.
    #[must_use]
    pub fn from_url(url: &str) -> Self {
        Self(hash_hex(url))
    }

    /// Returns the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a filesystem-safe key derived from the identifier.
    #[must_use]
    pub fn storage_key(&self) -> String {
        hash_hex(&self.0)
    }
}

fn hash_hex(input: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..16])
}

impl std::fmt::Display for ImageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ImageId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ImageId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Short format tag identifying an image encoding (e.g. `png`).
///
/// Codecs are registered and looked up by this tag, never by file extension.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageType(Cow<'static, str>);

impl ImageType {
    /// Portable Network Graphics.
    pub const PNG: Self = Self(Cow::Borrowed("png"));
    /// JPEG, baseline or progressive.
    pub const JPEG: Self = Self(Cow::Borrowed("jpeg"));
    /// GIF, possibly animated.
    pub const GIF: Self = Self(Cow::Borrowed("gif"));
    /// WebP.
    pub const WEBP: Self = Self(Cow::Borrowed("webp"));
    /// Windows bitmap.
    pub const BMP: Self = Self(Cow::Borrowed("bmp"));
    /// TIFF.
    pub const TIFF: Self = Self(Cow::Borrowed("tiff"));

    /// Creates a custom image type tag. Tags are compared case-insensitively.
    #[must_use]
    pub fn new(tag: impl Into<String>) -> Self {
        Self(Cow::Owned(tag.into().to_ascii_lowercase()))
    }

    /// Returns the tag.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Maps a MIME content type such as `image/png; charset=binary` to a tag.
    #[must_use]
    pub fn from_mime(content_type: &str) -> Option<Self> {
        let mime = content_type.split(';').next()?.trim().to_ascii_lowercase();
        let subtype = mime.strip_prefix("image/")?;
        match subtype {
            "png" => Some(Self::PNG),
            "jpeg" | "jpg" | "pjpeg" => Some(Self::JPEG),
            "gif" => Some(Self::GIF),
            "webp" => Some(Self::WEBP),
            "bmp" | "x-ms-bmp" => Some(Self::BMP),
            "tiff" => Some(Self::TIFF),
            "" => None,
            other => Some(Self::new(other)),
        }
    }

    /// Maps an `image` crate format to a tag.
    #[must_use]
    pub fn from_format(format: image::ImageFormat) -> Option<Self> {
        match format {
            image::ImageFormat::Png => Some(Self::PNG),
            image::ImageFormat::Jpeg => Some(Self::JPEG),
            image::ImageFormat::Gif => Some(Self::GIF),
            image::ImageFormat::WebP => Some(Self::WEBP),
            image::ImageFormat::Bmp => Some(Self::BMP),
            image::ImageFormat::Tiff => Some(Self::TIFF),
            _ => None,
        }
    }
}

impl std::fmt::Display for ImageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pixel dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Dimensions {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Dimensions {
    /// Creates new dimensions.
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Returns true if either side is zero.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl std::fmt::Display for Dimensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// How an image is fitted into the requested target dimensions.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum ContentMode {
    /// Scale to fit entirely within the target, preserving aspect ratio.
    #[default]
    Fit,
    /// Scale to cover the target, cropping the overflow.
    Fill,
    /// Keep the original size.
    Center,
}

/// One composited frame of an animation.
#[derive(Debug, Clone)]
pub struct AnimationFrame {
    /// Full-canvas pixels.
    pub image: Arc<DynamicImage>,
    /// How long the frame is shown.
    pub delay: Duration,
}

impl AnimationFrame {
    /// Creates a frame.
    #[must_use]
    pub fn new(image: DynamicImage, delay: Duration) -> Self {
        Self {
            image: Arc::new(image),
            delay,
        }
    }
}

/// A decoded image together with the metadata the pipeline tracks for it.
///
/// Animated images keep every frame; `image()` is the first one.
#[derive(Debug, Clone)]
pub struct ImageContainer {
    image: Arc<DynamicImage>,
    image_type: Option<ImageType>,
    frame_count: u32,
    frames: Option<Arc<[AnimationFrame]>>,
}

impl ImageContainer {
    /// Wraps a decoded static image.
    #[must_use]
    pub fn new(image: DynamicImage) -> Self {
        Self {
            image: Arc::new(image),
            image_type: None,
            frame_count: 1,
            frames: None,
        }
    }

    /// Wraps the frames of an animation. Returns `None` when `frames` is empty.
    #[must_use]
    pub fn animated(frames: Vec<AnimationFrame>) -> Option<Self> {
        let image = frames.first()?.image.clone();
        let frame_count = u32::try_from(frames.len()).unwrap_or(u32::MAX);
        Some(Self {
            image,
            image_type: None,
            frame_count,
            frames: (frame_count > 1).then(|| frames.into()),
        })
    }

    /// Sets the encoded format the image came from.
    #[must_use]
    pub fn with_type(mut self, image_type: ImageType) -> Self {
        self.image_type = Some(image_type);
        self
    }

    /// Sets the number of animation frames without carrying them, as for a
    /// first-frame snapshot. More than one marks the image animated.
    #[must_use]
    pub const fn with_frame_count(mut self, frame_count: u32) -> Self {
        self.frame_count = frame_count;
        self
    }

    /// Returns the decoded pixels (the first frame for animations).
    #[must_use]
    pub fn image(&self) -> &Arc<DynamicImage> {
        &self.image
    }

    /// Returns the encoded format, if known.
    #[must_use]
    pub const fn image_type(&self) -> Option<&ImageType> {
        self.image_type.as_ref()
    }

    /// Returns the pixel dimensions.
    #[must_use]
    pub fn dimensions(&self) -> Dimensions {
        Dimensions::new(self.image.width(), self.image.height())
    }

    /// Returns true for multi-frame images.
    #[must_use]
    pub const fn is_animated(&self) -> bool {
        self.frame_count > 1
    }

    /// Returns the number of frames.
    #[must_use]
    pub const fn frame_count(&self) -> u32 {
        self.frame_count
    }

    /// Returns every frame of a decoded animation.
    #[must_use]
    pub fn frames(&self) -> Option<&[AnimationFrame]> {
        self.frames.as_deref()
    }

    /// Total display time of one animation loop.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.frames()
            .map_or(Duration::ZERO, |frames| frames.iter().map(|f| f.delay).sum())
    }

    /// Resident size of the decoded pixels in bytes, across all frames.
    #[must_use]
    pub fn byte_cost(&self) -> u64 {
        match self.frames() {
            Some(frames) => frames
                .iter()
                .map(|frame| frame.image.as_bytes().len() as u64)
                .sum(),
            None => self.image.as_bytes().len() as u64,
        }
    }

    /// Returns a copy scaled down to `target` according to `mode`.
    ///
    /// Never upscales; returns a cheap clone when no scaling is needed.
    #[must_use]
    pub fn scaled_to(&self, target: Dimensions, mode: ContentMode) -> Self {
        let current = self.dimensions();
        if target.is_empty() || current.is_empty() {
            return self.clone();
        }
        let needed = match mode {
            ContentMode::Center => false,
            ContentMode::Fit => current.width > target.width || current.height > target.height,
            ContentMode::Fill => current.width > target.width && current.height > target.height,
        };
        if !needed {
            return self.clone();
        }
        let scale = |image: &DynamicImage| match mode {
            ContentMode::Fill => {
                image.resize_to_fill(target.width, target.height, FilterType::Lanczos3)
            }
            ContentMode::Fit | ContentMode::Center => {
                image.resize(target.width, target.height, FilterType::Lanczos3)
            }
        };
        let frames: Option<Arc<[AnimationFrame]>> = self.frames().map(|frames| {
            frames
                .iter()
                .map(|frame| AnimationFrame::new(scale(&*frame.image), frame.delay))
                .collect()
        });
        let image = frames
            .as_ref()
            .and_then(|frames| frames.first())
            .map_or_else(|| Arc::new(scale(&*self.image)), |first| first.image.clone());
        Self {
            image,
            image_type: self.image_type.clone(),
            frame_count: self.frame_count,
            frames,
        }
    }
}

/// Where an image was loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadSource {
    /// Loaded from in-memory LRU cache.
    MemoryCache,
    /// Loaded from disk cache.
    DiskCache,
    /// Resolved by a registered additional cache.
    AdditionalCache,
    /// Downloaded from network.
    Network,
}

impl std::fmt::Display for LoadSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MemoryCache => write!(f, "memory"),
            Self::DiskCache => write!(f, "disk"),
            Self::AdditionalCache => write!(f, "additional"),
            Self::Network => write!(f, "network"),
        }
    }
}

/// An image delivered to an observer: a preview, a partial or the final result.
#[derive(Debug, Clone)]
pub struct LoadedImage {
    /// The image ID.
    pub id: ImageId,
    /// The URL of the request that produced it.
    pub url: String,
    /// The decoded image.
    pub image: ImageContainer,
    /// Where it came from.
    pub source: LoadSource,
    /// Whether the image is a placeholder rather than the true content.
    pub placeholder: bool,
    /// Encoded size when known, otherwise the decoded size.
    pub byte_size: u64,
}

/// Summary of a finished network download, reported to pipeline observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSummary {
    /// The downloaded URL.
    pub url: String,
    /// Detected image type.
    pub image_type: Option<ImageType>,
    /// Number of bytes received.
    pub byte_size: u64,
    /// Decoded dimensions, if the payload decoded.
    pub dimensions: Option<Dimensions>,
    /// Whether the download resumed a previous partial transfer.
    pub resumed: bool,
}
