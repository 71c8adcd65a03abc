//! Codec port: format-pluggable decoding with progressive support.

use bitflags::bitflags;

use crate::domain::entities::{ImageContainer, ImageType};
use crate::domain::errors::{FetchError, FetchResult};

bitflags! {
    /// What a codec can do.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CodecCapabilities: u8 {
        const DECODE = 1 << 0;
        const ENCODE = 1 << 1;
        const ANIMATION = 1 << 2;
        const PROGRESSIVE = 1 << 3;
    }
}

/// Outcome of sniffing a (possibly incomplete) byte prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection {
    /// The codec can decode this data.
    Match,
    /// The codec cannot decode this data.
    NoMatch,
    /// Inconclusive until more bytes arrive.
    NeedMoreData,
}

/// A viewable snapshot produced from a prefix of the encoded bytes.
#[derive(Debug, Clone)]
pub enum PartialImage {
    /// A progressively refined rendition of the whole image.
    Progressive {
        /// The rendition; undecoded areas are transparent.
        image: ImageContainer,
        /// Fraction of the image decoded so far, in `0.0..1.0`.
        completeness: f32,
    },
    /// The first frame of an animation.
    FirstFrame(ImageContainer),
}

/// A codec registered in the catalogue under an image type.
pub trait ImageCodec: Send + Sync {
    /// The type this codec handles.
    fn image_type(&self) -> ImageType;

    /// Capability flags.
    fn capabilities(&self) -> CodecCapabilities;

    /// Sniffs whether `data` is in this codec's format.
    fn detect(&self, data: &[u8]) -> Detection;

    /// Starts an incremental decode.
    fn begin_decode(&self, expected_len: Option<u64>) -> Box<dyn DecodeSession>;

    /// Encodes an image into this codec's format.
    ///
    /// # Errors
    /// Returns `FetchError::EncodingUnsupported` unless overridden.
    fn encode(&self, _image: &ImageContainer) -> FetchResult<Vec<u8>> {
        Err(FetchError::EncodingUnsupported(self.image_type().to_string()))
    }
}

/// State of one incremental decode.
pub trait DecodeSession: Send {
    /// Feeds more bytes. Returns a snapshot when one became newly available.
    fn append(&mut self, data: &[u8]) -> Option<PartialImage>;

    /// Completes the decode.
    ///
    /// # Errors
    /// Returns `FetchError::DecodeFailure` for malformed or truncated data.
    fn finish(self: Box<Self>) -> FetchResult<ImageContainer>;
}

/// Decodes a complete payload in one go.
///
/// # Errors
/// Returns the codec's decode error.
pub fn decode_complete(codec: &dyn ImageCodec, data: &[u8]) -> FetchResult<ImageContainer> {
    let mut session = codec.begin_decode(Some(data.len() as u64));
    session.append(data);
    session.finish()
}
