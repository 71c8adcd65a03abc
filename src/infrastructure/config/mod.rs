//! Pipeline configuration.

pub mod app_config;
pub mod args;
pub mod global;
pub mod storage;

pub use app_config::{CacheConfig, LogLevel, NetworkConfig, PipelineConfig};
pub use args::{CliArgs, Command};
pub use global::{CacheBudget, GlobalConfiguration};
pub use storage::{ConfigError, ConfigStorage};
