mod additional_cache_port;
mod codec_port;
mod download_port;
mod fetch_delegate_port;
mod image_cache_port;
mod logger_port;
mod pipeline_observer_port;

pub use additional_cache_port::AdditionalCache;
pub use codec_port::{
    CodecCapabilities, DecodeSession, Detection, ImageCodec, PartialImage, decode_complete,
};
pub use download_port::{DownloadStream, ImageDownloader};
pub use fetch_delegate_port::{FetchDelegate, PreviewDecision, ProgressiveQuery};
pub use image_cache_port::{CacheError, CacheResult, ImageCachePort};
pub use logger_port::{LogRecord, PipelineLogger, Severity};
pub use pipeline_observer_port::PipelineObserver;
