//! Infrastructure layer with the pipeline and its adapters.

/// Pipeline configuration.
pub mod config;
/// Image pipeline (caches, codecs, downloader, fetch operations).
pub mod image;
/// Forwarding of log events to a host logger.
pub mod logging;

pub use config::{
    CliArgs, Command, ConfigStorage, GlobalConfiguration, LogLevel, PipelineConfig,
};
pub use image::{
    CacheStats, CodecCatalogue, DiskImageCache, FetchHandle, HttpDownloader, ImagePipeline,
    MemoryImageCache, MemoryPressure, OperationState, PipelineStats, PlaceholderSchemeCache,
};
pub use logging::LoggerLayer;
