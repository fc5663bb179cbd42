//! Module for application configuration settings.
//!
//! User configurations may be specified in a configuration file. Every field has a default, so a
//! missing file is not an error.

use std::path::{Path, PathBuf};
use std::time::Duration;

use deep_fs::ViewCacheConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

fn default_capacity() -> usize {
    ViewCacheConfig::default().capacity
}

fn default_ttl_secs() -> u64 {
    ViewCacheConfig::default().ttl.as_secs()
}

fn default_sweep_interval_secs() -> u64 {
    ViewCacheConfig::default().sweep_interval.as_secs()
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_nesting_depth() -> usize {
    2
}

/// The view cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CacheConfig {
    /// Maximum number of archives kept open.
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Seconds an archive stays open after it was first accessed.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Seconds between sweeps for expired archives. Zero disables the sweep.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            ttl_secs: default_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl CacheConfig {
    pub fn to_view_cache_config(&self) -> ViewCacheConfig {
        ViewCacheConfig {
            capacity: self.capacity,
            ttl: Duration::from_secs(self.ttl_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            ..ViewCacheConfig::default()
        }
    }
}

/// Application configuration structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// The host directory served as the base filesystem.
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// How many levels of archives inside archives are opened. Zero opens only archives in the
    /// root directory tree.
    #[serde(default = "default_nesting_depth")]
    pub nesting_depth: usize,

    #[serde(default)]
    pub cache: CacheConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: default_root(),
            nesting_depth: default_nesting_depth(),
            cache: CacheConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration validation errors: {0:?}")]
    ValidationErrors(Vec<String>),

    #[error("Deserialization error: {0}")]
    DeserializationError(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Config {
    /// Validate the correctness of the configuration.
    ///
    /// Returns:
    /// - `Ok(())` if the configuration is valid.
    /// - `Err(Vec<String>)` containing a list of validation error messages otherwise.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !self.root.is_dir() {
            errors.push(format!(
                "Root '{}' is not a directory.",
                self.root.display()
            ));
        }

        if self.cache.capacity == 0 {
            errors.push("cache.capacity must be at least 1.".to_owned());
        }

        if self.cache.ttl_secs == 0 {
            errors.push("cache.ttl-secs must be at least 1.".to_owned());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Consumes the configuration, returning it only if [`validate`](Self::validate) passes.
    pub fn validated(self) -> Result<Self, ConfigError> {
        self.validate().map_err(ConfigError::ValidationErrors)?;
        Ok(self)
    }

    /// Returns config file paths in descending priority order.
    /// On macOS, skips `dirs::config_dir()` (resolves to ~/Library/Application Support/).
    fn config_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        #[cfg(not(target_os = "macos"))]
        if let Some(xdg) = dirs::config_dir() {
            paths.push(xdg.join("deep-fs").join("config.toml"));
        }

        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".config").join("deep-fs").join("config.toml"));
        }

        paths.push(PathBuf::from("/etc/deep-fs/config.toml"));

        paths
    }

    /// Finds the first existing config file from search paths.
    fn find_config_file() -> Option<PathBuf> {
        Self::config_search_paths().into_iter().find(|p| p.exists())
    }

    /// Loads config from a single TOML file.
    fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = ?path, "Loading configuration file.");
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Loads configuration from the first found config file, or the external path if given.
    pub fn load(external_config_path: Option<&Path>) -> Option<Result<Self, ConfigError>> {
        if let Some(path) = external_config_path {
            return Some(Self::load_from_file(path));
        }

        Self::find_config_file().map(|path| Self::load_from_file(&path))
    }

    /// Loads config, falling back to the defaults if no file exists.
    /// Errors if a config file exists but is malformed.
    pub fn load_or_default(external_config_path: Option<&Path>) -> Result<Self, ConfigError> {
        match Self::load(external_config_path) {
            Some(res) => {
                let config = res?;
                debug!("Loaded configuration successfully.");
                Ok(config)
            }
            None => {
                debug!("No configuration file found, using defaults.");
                Ok(Self::default())
            }
        }
    }
}
