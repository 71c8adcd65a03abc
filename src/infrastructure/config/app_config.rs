//! Pipeline configuration file.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::args::CliArgs;
use crate::infrastructure::image::EvictionKind;
use crate::infrastructure::image::disk_cache::default_cache_dir;

/// Minimum level written by the log subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Everything, including per-chunk decode traces.
    Trace,
    /// Cache lookups and operation lifecycle.
    Debug,
    /// Downloads and completed loads.
    #[default]
    Info,
    /// Failures the pipeline recovered from.
    Warn,
    /// Failed fetches only.
    Error,
}

impl LogLevel {
    /// Directive understood by `EnvFilter`.
    #[must_use]
    pub const fn as_directive(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_directive())
    }
}

/// Pipeline configuration, read from `config.toml` and overridden by CLI flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Log file path.
    #[serde(skip)]
    pub log_path: Option<PathBuf>,

    /// Log verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Empty the memory cache when the host moves to the background.
    #[serde(default = "default_true")]
    pub clear_memory_on_background: bool,

    /// Cache configuration.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Network configuration.
    #[serde(default)]
    pub network: NetworkConfig,
}

/// Cache tier budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Disk cache directory. Defaults to the platform cache directory.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    /// Memory tier byte budget.
    #[serde(default = "default_memory_bytes")]
    pub memory_bytes: u64,

    /// Memory tier entry limit, 0 for unlimited.
    #[serde(default)]
    pub memory_entries: usize,

    /// Disk tier byte budget.
    #[serde(default = "default_disk_bytes")]
    pub disk_bytes: u64,

    /// Disk tier entry limit, 0 for unlimited.
    #[serde(default)]
    pub disk_entries: usize,

    /// Victim selection for both tiers.
    #[serde(default)]
    pub eviction: EvictionKind,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            memory_bytes: default_memory_bytes(),
            memory_entries: 0,
            disk_bytes: default_disk_bytes(),
            disk_entries: 0,
            eviction: EvictionKind::default(),
        }
    }
}

/// Downloader settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Downloads allowed to run at once.
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: usize,

    /// Whole-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Connect timeout in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// User agent header.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: default_max_concurrent_downloads(),
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_true() -> bool {
    true
}

const fn default_memory_bytes() -> u64 {
    crate::infrastructure::image::memory_cache::DEFAULT_MEMORY_BYTES
}

const fn default_disk_bytes() -> u64 {
    crate::infrastructure::image::disk_cache::DEFAULT_MAX_CACHE_SIZE
}

const fn default_max_concurrent_downloads() -> usize {
    6
}

const fn default_timeout_secs() -> u64 {
    30
}

const fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_user_agent() -> String {
    format!("{}/{}", crate::NAME, crate::VERSION)
}

impl PipelineConfig {
    /// Applies CLI flags on top of values read from the file.
    pub fn merge_with_args(&mut self, args: &CliArgs) {
        if let Some(log_path) = &args.log_path {
            self.log_path = Some(log_path.clone());
        }
        if let Some(log_level) = args.log_level {
            self.log_level = log_level;
        }
        if let Some(cache_dir) = &args.cache_dir {
            self.cache.cache_dir = Some(cache_dir.clone());
        }
        if let Some(memory_bytes) = args.memory_bytes {
            self.cache.memory_bytes = memory_bytes;
        }
        if let Some(disk_bytes) = args.disk_bytes {
            self.cache.disk_bytes = disk_bytes;
        }
        if let Some(eviction) = args.eviction {
            self.cache.eviction = eviction;
        }
        if let Some(max_concurrent_downloads) = args.max_concurrent_downloads {
            self.network.max_concurrent_downloads = max_concurrent_downloads;
        }
        if let Some(timeout_secs) = args.timeout_secs {
            self.network.timeout_secs = timeout_secs;
        }
    }

    /// Log file under the platform data directory.
    #[must_use]
    pub fn default_log_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "linuxmobile", crate::NAME)
            .map(|dirs| dirs.data_dir().join(format!("{}.log", crate::NAME)))
    }

    /// Log file to write, if any.
    #[must_use]
    pub fn effective_log_path(&self) -> Option<PathBuf> {
        self.log_path.clone().or_else(Self::default_log_path)
    }

    /// Returns the disk cache directory.
    #[must_use]
    pub fn effective_cache_dir(&self) -> PathBuf {
        self.cache.cache_dir.clone().unwrap_or_else(default_cache_dir)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            log_path: None,
            log_level: LogLevel::Info,
            clear_memory_on_background: true,
            cache: CacheConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}
