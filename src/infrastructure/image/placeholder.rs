//! Additional cache synthesising solid-colour images for `placeholder://` URLs.
//!
//! `placeholder://64x32` yields a 64x32 light grey image and
//! `placeholder://64x32/ff8800` one filled with the given colour.

use async_trait::async_trait;
use image::{DynamicImage, Rgba, RgbaImage};
use tracing::{debug, warn};

use crate::domain::entities::{Dimensions, ImageContainer};
use crate::domain::ports::AdditionalCache;

/// URL scheme served by [`PlaceholderSchemeCache`].
pub const PLACEHOLDER_SCHEME: &str = "placeholder://";

const DEFAULT_COLOR: [u8; 4] = [0xd0, 0xd0, 0xd0, 0xff];
const MAX_SIDE: u32 = 4096;

/// Resolves `placeholder://WxH[/rrggbb[aa]]` URLs without touching the network.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaceholderSchemeCache;

impl PlaceholderSchemeCache {
    /// Parses a placeholder URL into its size and colour.
    #[must_use]
    pub fn parse(url: &str) -> Option<(Dimensions, [u8; 4])> {
        let rest = url.strip_prefix(PLACEHOLDER_SCHEME)?;
        let (size, color) = rest.split_once('/').unwrap_or((rest, ""));
        let (width, height) = size.split_once('x')?;
        let width: u32 = width.parse().ok()?;
        let height: u32 = height.parse().ok()?;
        if width == 0 || height == 0 || width > MAX_SIDE || height > MAX_SIDE {
            return None;
        }
        let color = if color.is_empty() {
            DEFAULT_COLOR
        } else {
            parse_color(color)?
        };
        Some((Dimensions::new(width, height), color))
    }
}

fn parse_color(hex_color: &str) -> Option<[u8; 4]> {
    let bytes = hex::decode(hex_color.trim_start_matches('#')).ok()?;
    match bytes.as_slice() {
        [r, g, b] => Some([*r, *g, *b, 0xff]),
        [r, g, b, a] => Some([*r, *g, *b, *a]),
        _ => None,
    }
}

#[async_trait]
impl AdditionalCache for PlaceholderSchemeCache {
    async fn resolve(&self, url: &str) -> Option<ImageContainer> {
        if !url.starts_with(PLACEHOLDER_SCHEME) {
            return None;
        }
        let Some((size, color)) = Self::parse(url) else {
            warn!(url = %url, "Malformed placeholder URL");
            return None;
        };
        debug!(url = %url, size = %size, "Synthesising placeholder");
        let image = RgbaImage::from_pixel(size.width, size.height, Rgba(color));
        Some(ImageContainer::new(DynamicImage::ImageRgba8(image)))
    }
}
