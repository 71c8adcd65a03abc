//! Codec catalogue and the built-in codecs backed by the `image` crate.
//!
//! PNG decodes row by row as bytes arrive. GIF and WebP count complete frames
//! with a structural scan and decode the first frame once a second one exists.

use std::io::Cursor;
use std::sync::Arc;

use image::codecs::gif::{GifDecoder, GifEncoder, Repeat};
use image::codecs::webp::WebPDecoder;
use image::{AnimationDecoder, Delay, DynamicImage, Frame, Frames, ImageFormat, Rgba, RgbaImage};
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::domain::entities::{AnimationFrame, ImageContainer, ImageType};
use crate::domain::errors::{FetchError, FetchResult};
use crate::domain::ports::{
    CodecCapabilities, DecodeSession, Detection, ImageCodec, PartialImage,
};

/// Bytes `image::guess_format` needs before a negative answer is final.
const SNIFF_LEN: usize = 12;

/// Partial PNG decodes per download when the length is known.
const PROGRESSIVE_STEPS: u64 = 8;

/// Smallest growth that triggers another partial decode of an unsized download.
const MIN_PROGRESSIVE_STEP: usize = 16 * 1024;

/// Result of choosing a codec for a byte prefix.
#[derive(Clone)]
pub enum CodecLookup {
    /// A codec was chosen.
    Found(ImageType, Arc<dyn ImageCodec>),
    /// Some codec may match once more bytes arrive.
    Pending,
    /// No registered codec recognises the data.
    Unknown,
}

impl std::fmt::Debug for CodecLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Found(image_type, _) => write!(f, "Found({image_type})"),
            Self::Pending => write!(f, "Pending"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Maps image types to codecs. Registration may happen at any time; the
/// last registration for a type wins.
pub struct CodecCatalogue {
    codecs: RwLock<Vec<(ImageType, Arc<dyn ImageCodec>)>>,
}

impl CodecCatalogue {
    /// Creates a catalogue with no codecs.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            codecs: RwLock::new(Vec::new()),
        }
    }

    /// Creates a catalogue with the built-in codecs registered.
    #[must_use]
    pub fn with_defaults() -> Self {
        let catalogue = Self::empty();
        for codec in StandardCodec::all() {
            catalogue.register(codec.image_type(), Arc::new(codec));
        }
        catalogue
    }

    /// Registers `codec` under `image_type`, replacing any previous codec for
    /// that type in place so detection order is preserved.
    pub fn register(&self, image_type: ImageType, codec: Arc<dyn ImageCodec>) {
        let mut codecs = self.codecs.write();
        if let Some(slot) = codecs.iter_mut().find(|(t, _)| *t == image_type) {
            debug!(image_type = %image_type, "Replacing registered codec");
            slot.1 = codec;
        } else {
            debug!(image_type = %image_type, "Registering codec");
            codecs.push((image_type, codec));
        }
    }

    /// Removes the codec for `image_type`.
    pub fn unregister(&self, image_type: &ImageType) -> Option<Arc<dyn ImageCodec>> {
        let mut codecs = self.codecs.write();
        let index = codecs.iter().position(|(t, _)| t == image_type)?;
        Some(codecs.remove(index).1)
    }

    /// Returns the codec registered for `image_type`.
    #[must_use]
    pub fn codec(&self, image_type: &ImageType) -> Option<Arc<dyn ImageCodec>> {
        self.codecs
            .read()
            .iter()
            .find(|(t, _)| t == image_type)
            .map(|(_, c)| c.clone())
    }

    /// Registered types in detection order.
    #[must_use]
    pub fn image_types(&self) -> Vec<ImageType> {
        self.codecs.read().iter().map(|(t, _)| t.clone()).collect()
    }

    /// Detects the image type of `data` by consulting codecs in registration order.
    #[must_use]
    pub fn detect_image_type(&self, data: &[u8]) -> Option<ImageType> {
        match self.resolve(data, None) {
            CodecLookup::Found(image_type, _) => Some(image_type),
            CodecLookup::Pending | CodecLookup::Unknown => None,
        }
    }

    /// Chooses a codec for `data`.
    ///
    /// A hinted type is trusted unless its codec positively rejects the bytes;
    /// otherwise codecs are consulted in registration order.
    #[must_use]
    pub fn resolve(&self, data: &[u8], hint: Option<&ImageType>) -> CodecLookup {
        let codecs = self.codecs.read();
        if let Some(hint) = hint
            && let Some((image_type, codec)) = codecs.iter().find(|(t, _)| t == hint)
            && codec.detect(data) != Detection::NoMatch
        {
            trace!(image_type = %image_type, "Using hinted codec");
            return CodecLookup::Found(image_type.clone(), codec.clone());
        }

        let mut pending = false;
        for (image_type, codec) in codecs.iter() {
            match codec.detect(data) {
                Detection::Match => {
                    return CodecLookup::Found(image_type.clone(), codec.clone());
                }
                Detection::NeedMoreData => pending = true,
                Detection::NoMatch => {}
            }
        }
        if pending {
            CodecLookup::Pending
        } else {
            CodecLookup::Unknown
        }
    }
}

impl Default for CodecCatalogue {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for CodecCatalogue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecCatalogue")
            .field("types", &self.image_types())
            .finish()
    }
}

/// A codec for one format supported by the `image` crate.
#[derive(Debug, Clone)]
pub struct StandardCodec {
    image_type: ImageType,
    format: ImageFormat,
    capabilities: CodecCapabilities,
}

impl StandardCodec {
    /// Creates a codec for `format`, or `None` if the crate was built without it.
    #[must_use]
    pub fn new(format: ImageFormat) -> Option<Self> {
        let image_type = ImageType::from_format(format)?;
        let mut capabilities = CodecCapabilities::empty();
        if format.reading_enabled() {
            capabilities |= CodecCapabilities::DECODE;
        }
        if matches!(
            format,
            ImageFormat::Png
                | ImageFormat::Jpeg
                | ImageFormat::Gif
                | ImageFormat::Bmp
                | ImageFormat::Tiff
        ) && format.writing_enabled()
        {
            capabilities |= CodecCapabilities::ENCODE;
        }
        if matches!(format, ImageFormat::Gif | ImageFormat::WebP) {
            capabilities |= CodecCapabilities::ANIMATION;
        }
        if format == ImageFormat::Png {
            capabilities |= CodecCapabilities::PROGRESSIVE;
        }
        capabilities
            .contains(CodecCapabilities::DECODE)
            .then_some(Self {
                image_type,
                format,
                capabilities,
            })
    }

    /// All built-in codecs, in detection order.
    #[must_use]
    pub fn all() -> Vec<Self> {
        [
            ImageFormat::Png,
            ImageFormat::Jpeg,
            ImageFormat::Gif,
            ImageFormat::WebP,
            ImageFormat::Bmp,
            ImageFormat::Tiff,
        ]
        .into_iter()
        .filter_map(Self::new)
        .collect()
    }
}

impl ImageCodec for StandardCodec {
    fn image_type(&self) -> ImageType {
        self.image_type.clone()
    }

    fn capabilities(&self) -> CodecCapabilities {
        self.capabilities
    }

    fn detect(&self, data: &[u8]) -> Detection {
        match image::guess_format(data) {
            Ok(format) if format == self.format => Detection::Match,
            _ if data.len() < SNIFF_LEN => Detection::NeedMoreData,
            _ => Detection::NoMatch,
        }
    }

    fn begin_decode(&self, expected_len: Option<u64>) -> Box<dyn DecodeSession> {
        let capacity = expected_len
            .and_then(|len| usize::try_from(len).ok())
            .unwrap_or(0)
            .min(64 * 1024 * 1024);
        Box::new(StandardSession::new(self.clone(), expected_len, capacity))
    }

    fn encode(&self, image: &ImageContainer) -> FetchResult<Vec<u8>> {
        if !self.capabilities.contains(CodecCapabilities::ENCODE) {
            return Err(FetchError::EncodingUnsupported(self.image_type.to_string()));
        }
        let mut out = Cursor::new(Vec::new());
        let result = match self.format {
            ImageFormat::Jpeg => {
                DynamicImage::ImageRgb8(image.image().to_rgb8()).write_to(&mut out, self.format)
            }
            ImageFormat::Gif => encode_gif(image, out.get_mut()),
            _ => image.image().write_to(&mut out, self.format),
        };
        result.map_err(|e| FetchError::EncodingUnsupported(format!("{}: {e}", self.image_type)))?;
        Ok(out.into_inner())
    }
}

/// Writes every frame, looping forever; a static image becomes one frame.
fn encode_gif(image: &ImageContainer, out: &mut Vec<u8>) -> image::ImageResult<()> {
    let frames: Vec<Frame> = match image.frames() {
        Some(frames) => frames
            .iter()
            .map(|frame| {
                Frame::from_parts(
                    frame.image.to_rgba8(),
                    0,
                    0,
                    Delay::from_saturating_duration(frame.delay),
                )
            })
            .collect(),
        None => vec![Frame::new(image.image().to_rgba8())],
    };
    let mut encoder = GifEncoder::new(out);
    encoder.set_repeat(Repeat::Infinite)?;
    encoder.encode_frames(frames)
}

/// Counts complete frames in a growing buffer without decoding pixels.
#[derive(Debug)]
enum FrameScan {
    Gif(GifScan),
    Riff(RiffScan),
}

impl FrameScan {
    fn for_format(format: ImageFormat) -> Option<Self> {
        match format {
            ImageFormat::Gif => Some(Self::Gif(GifScan::default())),
            ImageFormat::WebP => Some(Self::Riff(RiffScan::default())),
            _ => None,
        }
    }

    fn advance(&mut self, buffer: &[u8]) {
        match self {
            Self::Gif(scan) => scan.advance(buffer),
            Self::Riff(scan) => scan.advance(buffer),
        }
    }

    /// Complete frames seen so far, and whether the stream has ended.
    const fn progress(&self) -> (u32, bool) {
        match self {
            Self::Gif(scan) => (scan.frames, matches!(scan.state, GifState::End)),
            Self::Riff(scan) => (scan.frames, scan.ended),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum GifState {
    #[default]
    Header,
    Block,
    Descriptor,
    SubBlocks {
        image: bool,
    },
    End,
}

/// Walks GIF blocks, resuming where the previous call stopped.
#[derive(Debug, Default)]
struct GifScan {
    state: GifState,
    pos: usize,
    frames: u32,
}

impl GifScan {
    /// Signature plus logical screen descriptor.
    const HEADER_LEN: usize = 13;

    fn color_table_len(flags: u8) -> usize {
        if flags & 0x80 == 0 {
            0
        } else {
            3 << ((flags & 0x07) + 1)
        }
    }

    fn advance(&mut self, buffer: &[u8]) {
        loop {
            match self.state {
                GifState::Header => {
                    if buffer.len() < Self::HEADER_LEN {
                        return;
                    }
                    self.pos = Self::HEADER_LEN + Self::color_table_len(buffer[10]);
                    self.state = GifState::Block;
                }
                GifState::Block => match buffer.get(self.pos) {
                    None => return,
                    Some(0x21) => {
                        if buffer.len() < self.pos + 2 {
                            return;
                        }
                        // Introducer and label.
                        self.pos += 2;
                        self.state = GifState::SubBlocks { image: false };
                    }
                    Some(0x2C) => {
                        self.pos += 1;
                        self.state = GifState::Descriptor;
                    }
                    Some(_) => self.state = GifState::End,
                },
                GifState::Descriptor => {
                    let Some(&flags) = buffer.get(self.pos + 8) else {
                        return;
                    };
                    // Descriptor, local colour table, LZW minimum code size.
                    let len = 9 + Self::color_table_len(flags) + 1;
                    if buffer.len() < self.pos + len {
                        return;
                    }
                    self.pos += len;
                    self.state = GifState::SubBlocks { image: true };
                }
                GifState::SubBlocks { image } => {
                    let Some(&size) = buffer.get(self.pos) else {
                        return;
                    };
                    self.pos += 1 + usize::from(size);
                    if size == 0 {
                        if image {
                            self.frames += 1;
                        }
                        self.state = GifState::Block;
                    }
                }
                GifState::End => return,
            }
        }
    }
}

/// Walks RIFF chunks of a WebP file, counting `ANMF` frames.
#[derive(Debug, Default)]
struct RiffScan {
    pos: usize,
    frames: u32,
    ended: bool,
}

impl RiffScan {
    /// `RIFF`, payload size, `WEBP`.
    const HEADER_LEN: usize = 12;

    fn advance(&mut self, buffer: &[u8]) {
        let Some(riff_len) = buffer
            .get(4..8)
            .and_then(|size| size.try_into().ok())
            .map(|size: [u8; 4]| 8usize.saturating_add(u32::from_le_bytes(size) as usize))
        else {
            return;
        };
        self.pos = self.pos.max(Self::HEADER_LEN);
        while !self.ended {
            let Some(header) = buffer.get(self.pos..self.pos + 8) else {
                return;
            };
            let size = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
            let end = self
                .pos
                .saturating_add(8)
                .saturating_add(size)
                .saturating_add(size & 1);
            if buffer.len() < end {
                return;
            }
            if &header[..4] == b"ANMF" {
                self.frames += 1;
            }
            self.pos = end;
            self.ended = self.pos >= riff_len;
        }
    }
}

/// Outcome of decoding the rows of a PNG prefix.
enum PngRows {
    /// Header or first rows not available yet.
    Unavailable,
    /// Adam7 rows do not map to a top-down prefix.
    Interlaced,
    /// A canvas with the first `rows` rows filled in.
    Decoded(RgbaImage, u32),
}

/// Decodes as many leading rows of `data` as are complete.
fn decode_png_rows(data: &[u8]) -> PngRows {
    let mut decoder = png::Decoder::new(Cursor::new(data));
    decoder.set_transformations(png::Transformations::EXPAND | png::Transformations::STRIP_16);
    let Ok(mut reader) = decoder.read_info() else {
        return PngRows::Unavailable;
    };
    let info = reader.info();
    if info.interlaced {
        return PngRows::Interlaced;
    }
    let (width, height) = (info.width, info.height);
    let (color, depth) = reader.output_color_type();
    if depth != png::BitDepth::Eight {
        return PngRows::Unavailable;
    }
    let channels = color.samples();

    let mut canvas = RgbaImage::new(width, height);
    let mut rows = 0;
    while rows < height {
        let Ok(Some(row)) = reader.next_row() else {
            break;
        };
        copy_row(&mut canvas, rows, row.data(), channels);
        rows += 1;
    }
    PngRows::Decoded(canvas, rows)
}

fn copy_row(canvas: &mut RgbaImage, y: u32, data: &[u8], channels: usize) {
    for (x, sample) in (0..canvas.width()).zip(data.chunks_exact(channels)) {
        let pixel = match *sample {
            [l] => [l, l, l, u8::MAX],
            [l, a] => [l, l, l, a],
            [r, g, b] => [r, g, b, u8::MAX],
            [r, g, b, a] => [r, g, b, a],
            _ => continue,
        };
        canvas.put_pixel(x, y, Rgba(pixel));
    }
}

struct StandardSession {
    codec: StandardCodec,
    buffer: Vec<u8>,
    expected_len: Option<u64>,
    scan: Option<FrameScan>,
    /// Frame scan state at the last first-frame decode attempt.
    last_attempt: Option<(u32, bool)>,
    first_frame_sent: bool,
    /// Buffer length at the last partial PNG decode.
    rows_attempted_len: usize,
    rows_shown: u32,
    interlaced: bool,
}

impl StandardSession {
    fn new(codec: StandardCodec, expected_len: Option<u64>, capacity: usize) -> Self {
        Self {
            scan: FrameScan::for_format(codec.format),
            codec,
            buffer: Vec::with_capacity(capacity),
            expected_len,
            last_attempt: None,
            first_frame_sent: false,
            rows_attempted_len: 0,
            rows_shown: 0,
            interlaced: false,
        }
    }

    fn next_first_frame(&mut self) -> Option<PartialImage> {
        if self.first_frame_sent {
            return None;
        }
        let scan = self.scan.as_mut()?;
        scan.advance(&self.buffer);
        let progress = scan.progress();
        if progress.0 < 2 || self.last_attempt == Some(progress) {
            return None;
        }
        self.last_attempt = Some(progress);
        let frame = self.first_frame()?;
        self.first_frame_sent = true;
        Some(PartialImage::FirstFrame(frame))
    }

    /// Decodes the first frame of an image known to have at least two.
    fn first_frame(&self) -> Option<ImageContainer> {
        let first = self.frames()?.next()?.ok()?;
        Some(
            ImageContainer::new(DynamicImage::ImageRgba8(first.into_buffer()))
                .with_type(self.codec.image_type.clone())
                .with_frame_count(2),
        )
    }

    fn frames(&self) -> Option<Frames<'_>> {
        match self.codec.format {
            ImageFormat::Gif => Some(GifDecoder::new(Cursor::new(&self.buffer)).ok()?.into_frames()),
            ImageFormat::WebP => {
                let decoder = WebPDecoder::new(Cursor::new(&self.buffer)).ok()?;
                decoder.has_animation().then(|| decoder.into_frames())
            }
            _ => None,
        }
    }

    fn next_rows(&mut self) -> Option<PartialImage> {
        if self.interlaced
            || self
                .expected_len
                .is_some_and(|total| self.buffer.len() as u64 >= total)
        {
            return None;
        }
        let step = match self.expected_len {
            Some(total) => usize::try_from(total / PROGRESSIVE_STEPS).unwrap_or(usize::MAX),
            None => (self.rows_attempted_len / 4).max(MIN_PROGRESSIVE_STEP),
        };
        if self.buffer.len() - self.rows_attempted_len < step.max(1) {
            return None;
        }
        self.rows_attempted_len = self.buffer.len();

        let (canvas, rows) = match decode_png_rows(&self.buffer) {
            PngRows::Decoded(canvas, rows) => (canvas, rows),
            PngRows::Interlaced => {
                trace!("Interlaced PNG, no progressive rows");
                self.interlaced = true;
                return None;
            }
            PngRows::Unavailable => return None,
        };
        let height = canvas.height();
        if rows <= self.rows_shown || rows >= height {
            return None;
        }
        self.rows_shown = rows;
        #[allow(clippy::cast_precision_loss)]
        let completeness = rows as f32 / height as f32;
        Some(PartialImage::Progressive {
            image: ImageContainer::new(DynamicImage::ImageRgba8(canvas))
                .with_type(self.codec.image_type.clone()),
            completeness,
        })
    }

    /// Every frame of an animation, composited to the full canvas.
    fn decode_frames(&self) -> Option<Vec<AnimationFrame>> {
        let frames = self.frames()?.collect_frames().ok()?;
        Some(
            frames
                .into_iter()
                .map(|frame| {
                    let delay = std::time::Duration::from(frame.delay());
                    AnimationFrame::new(DynamicImage::ImageRgba8(frame.into_buffer()), delay)
                })
                .collect(),
        )
    }
}

impl DecodeSession for StandardSession {
    fn append(&mut self, data: &[u8]) -> Option<PartialImage> {
        self.buffer.extend_from_slice(data);
        let capabilities = self.codec.capabilities;
        if capabilities.contains(CodecCapabilities::PROGRESSIVE) {
            self.next_rows()
        } else if capabilities.contains(CodecCapabilities::ANIMATION) {
            self.next_first_frame()
        } else {
            None
        }
    }

    fn finish(self: Box<Self>) -> FetchResult<ImageContainer> {
        if let Some(frames) = self.decode_frames()
            && let Some(animation) = ImageContainer::animated(frames)
        {
            return Ok(animation.with_type(self.codec.image_type.clone()));
        }
        let image = image::load_from_memory_with_format(&self.buffer, self.codec.format)
            .map_err(|e| FetchError::decode(format!("{}: {e}", self.codec.image_type)))?;
        Ok(ImageContainer::new(image).with_type(self.codec.image_type.clone()))
    }
}
