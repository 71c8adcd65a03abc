use super::app_config::LogLevel;
use crate::domain::entities::ContentMode;
use crate::infrastructure::image::EvictionKind;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Command line arguments.
#[derive(Debug, Parser)]
#[command(
    name = "imagepipe",
    version,
    about = "Fetch images through a tiered memory/disk cache",
    long_about = None
)]
pub struct CliArgs {
    /// Configuration file path.
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log file path.
    #[arg(long, value_name = "PATH")]
    pub log_path: Option<PathBuf>,

    /// Log verbosity level.
    #[arg(long, value_enum)]
    pub log_level: Option<LogLevel>,

    /// Disk cache directory.
    #[arg(long, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Memory cache byte budget.
    #[arg(long, value_name = "BYTES")]
    pub memory_bytes: Option<u64>,

    /// Disk cache byte budget.
    #[arg(long, value_name = "BYTES")]
    pub disk_bytes: Option<u64>,

    /// Eviction policy for both cache tiers.
    #[arg(long, value_enum)]
    pub eviction: Option<EvictionKind>,

    /// Downloads allowed to run at once.
    #[arg(long)]
    pub max_concurrent_downloads: Option<usize>,

    /// Request timeout in seconds.
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fetch images and print pipeline callbacks as they arrive.
    Fetch {
        /// Image URLs. `placeholder://WxH[/rrggbb]` URLs are synthesised locally.
        #[arg(required = true)]
        urls: Vec<String>,

        /// Target width; requires --height.
        #[arg(long, requires = "height")]
        width: Option<u32>,

        /// Target height; requires --width.
        #[arg(long, requires = "width")]
        height: Option<u32>,

        /// How results are fitted to the target size.
        #[arg(long, value_enum, default_value = "fit")]
        mode: ContentMode,

        /// Treat the results as placeholders.
        #[arg(long)]
        placeholder: bool,

        /// Accept progressive partial images.
        #[arg(long)]
        progressive: bool,

        /// Do not refresh recency or expiry on cache hits.
        #[arg(long)]
        no_reset_expiry: bool,

        /// Lifetime of newly cached images, in hours.
        #[arg(long, value_name = "HOURS", value_parser = clap::value_parser!(u32).range(1..))]
        ttl_hours: Option<u32>,

        /// Resolve from the caches only, never the network.
        #[arg(long)]
        offline: bool,

        /// Write each final image as PNG into this directory.
        #[arg(short, long, value_name = "DIR")]
        output: Option<PathBuf>,
    },

    /// Print cache statistics.
    Stats,

    /// Remove images from the disk cache; everything when no URL is given.
    Clear {
        /// Image URLs to remove.
        urls: Vec<String>,
    },
}
