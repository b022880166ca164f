//! # Configuration Management Module
//!
//! Persistent application settings stored in platform-appropriate locations.
//! Handles loading, saving, and providing defaults for configuration options.
//!
//! ## Settings
//! - `storage_root`: Where recordings are kept (default: platform data dir)
//! - `temp_dir`: Staging area for copies and converted tables
//! - `log_level`: Default `env_logger` filter when `RUST_LOG` is unset
//! - `worker_threads`: Size of the background pool
//!
//! ## Storage Location
//! - macOS: ~/Library/Application Support/sensor-logbook/config.toml
//! - Linux: ~/.config/sensor-logbook/config.toml
//! - Windows: %APPDATA%\sensor-logbook\config.toml

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "sensor-logbook";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage_root: Option<PathBuf>,
    pub temp_dir: Option<PathBuf>,
    pub log_level: String,
    pub worker_threads: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_root: None,
            temp_dir: None,
            log_level: "info".to_string(),
            worker_threads: 2,
        }
    }
}

impl Config {
    /// Get the path to the config file
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("config.toml")
    }

    /// Storage root, falling back to the platform data directory
    pub fn storage_root(&self) -> PathBuf {
        self.storage_root.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(APP_DIR)
        })
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join(APP_DIR))
    }

    /// Pool size, never zero
    pub fn worker_threads(&self) -> usize {
        self.worker_threads.max(1)
    }

    /// Load config from the default location, creating it if missing
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load config from `path`, or write and return the defaults if it doesn't exist
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).map_err(ConfigError::ParseFailed),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.save_to(path)?;
                Ok(config)
            }
            Err(e) => Err(ConfigError::ReadFailed(e)),
        }
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ConfigError::WriteFailed)?;
        }

        let toml_string = toml::to_string_pretty(self).map_err(ConfigError::SerializeFailed)?;
        fs::write(path, toml_string).map_err(ConfigError::WriteFailed)
    }
}
