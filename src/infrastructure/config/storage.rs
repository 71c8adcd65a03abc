//! Locating, reading and atomically writing the pipeline's `config.toml`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::app_config::PipelineConfig;

const QUALIFIER: &str = "com";
const ORGANIZATION: &str = "linuxmobile";
const FILE_NAME: &str = "config.toml";

/// Errors raised while reading or writing the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform reported no home or config directory.
    #[error("no configuration directory available on this platform")]
    NoConfigDir,
    /// The target path has no parent directory to stage the write in.
    #[error("configuration path {0} has no parent directory")]
    NoParent(PathBuf),
    /// Filesystem failure.
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
    /// The configuration could not be rendered as TOML.
    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),
}

/// Owns the directory holding `config.toml`.
#[derive(Debug, Clone)]
pub struct ConfigStorage {
    config_dir: PathBuf,
}

impl ConfigStorage {
    /// Uses the platform configuration directory for this crate.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::NoConfigDir` if the platform has none.
    pub fn new() -> Result<Self, ConfigError> {
        let dirs = ProjectDirs::from(QUALIFIER, ORGANIZATION, crate::NAME)
            .ok_or(ConfigError::NoConfigDir)?;
        Ok(Self::with_dir(dirs.config_dir().to_path_buf()))
    }

    /// Uses `config_dir` instead of the platform directory.
    #[must_use]
    pub const fn with_dir(config_dir: PathBuf) -> Self {
        Self { config_dir }
    }

    /// Directory holding the configuration file.
    #[must_use]
    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Path of the configuration file, honouring an explicit override.
    #[must_use]
    pub fn config_path(&self, explicit: Option<&Path>) -> PathBuf {
        explicit.map_or_else(|| self.config_dir.join(FILE_NAME), Path::to_path_buf)
    }

    /// Reads the configuration from `explicit` or the default location.
    ///
    /// A missing file is created with the defaults. A file that fails to parse
    /// is kept as-is and the defaults are returned, so one typo never stops
    /// the pipeline from starting.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read or the default file
    /// cannot be written.
    pub fn load_config(&self, explicit: Option<&Path>) -> Result<PipelineConfig, ConfigError> {
        let path = self.config_path(explicit);
        if !path.exists() {
            info!(path = %path.display(), "No config file, writing defaults");
            let config = PipelineConfig::default();
            write_atomically(&path, &config)?;
            return Ok(config);
        }

        let text = fs::read_to_string(&path)?;
        match toml::from_str::<PipelineConfig>(&text) {
            Ok(config) => {
                debug!(path = %path.display(), "Loaded config");
                Ok(config)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unparsable config file");
                Ok(PipelineConfig::default())
            }
        }
    }

    /// Writes `config` to the default location.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be written.
    pub fn save_config(&self, config: &PipelineConfig) -> Result<(), ConfigError> {
        write_atomically(&self.config_path(None), config)
    }
}

/// Renders `config` next to `path` and renames it into place.
fn write_atomically(path: &Path, config: &PipelineConfig) -> Result<(), ConfigError> {
    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .ok_or_else(|| ConfigError::NoParent(path.to_path_buf()))?;
    fs::create_dir_all(dir)?;

    let rendered = toml::to_string_pretty(config)?;
    let mut staged = tempfile::NamedTempFile::new_in(dir)?;
    staged.write_all(rendered.as_bytes())?;
    staged.persist(path).map_err(|e| e.error)?;
    Ok(())
}
