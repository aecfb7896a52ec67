//! Configuration management for lanshare
//!
//! Handles loading and saving configuration from ~/.config/lanshare/config.toml

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::discovery::DEFAULT_DISCOVERY_PORT;
use crate::notifier::DEFAULT_VIEWER_BUFFER;
use crate::store::DEFAULT_MAX_FILE_BYTES;

/// Configuration file name
const CONFIG_FILE: &str = "config.toml";

/// Application name for config directory
const APP_NAME: &str = "lanshare";

/// Default port for the web server
pub const DEFAULT_PORT: u16 = 3000;

/// Default directory holding shared files, relative to the working directory
pub const DEFAULT_UPLOAD_DIR: &str = "uploads";

/// Default limit on files per upload request
pub const DEFAULT_MAX_FILES_PER_UPLOAD: usize = 10;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Could not determine config directory")]
    NoConfigDir,
}

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Application configuration
///
/// Every field is optional; unset fields fall back to built-in defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    /// Directory whose contents are shared
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_dir: Option<PathBuf>,

    /// Port for the web server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// UDP port answering discovery queries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery_port: Option<u16>,

    /// Whether to answer discovery queries at all
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery: Option<bool>,

    /// Name announced to discovering clients
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,

    /// Largest accepted upload, per file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_file_bytes: Option<u64>,

    /// Largest number of files in one upload request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_files_per_upload: Option<usize>,

    /// Change events buffered per connected viewer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewer_buffer: Option<usize>,
}

impl Config {
    /// Create a new empty configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the config file path
    ///
    /// Returns ~/.config/lanshare/config.toml on Linux
    pub fn config_path() -> ConfigResult<PathBuf> {
        Ok(Self::config_dir()?.join(CONFIG_FILE))
    }

    /// Get the config directory path
    pub fn config_dir() -> ConfigResult<PathBuf> {
        let config_dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(config_dir.join(APP_NAME))
    }

    /// Load configuration from the default location
    ///
    /// Returns default config if file doesn't exist
    pub fn load() -> ConfigResult<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from a specific file
    pub fn load_from(path: &std::path::Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to the default location
    ///
    /// Creates the config directory if it doesn't exist
    pub fn save(&self) -> ConfigResult<PathBuf> {
        let path = Self::config_path()?;
        self.save_to(&path)?;
        Ok(path)
    }

    /// Save configuration to a specific file
    pub fn save_to(&self, path: &std::path::Path) -> ConfigResult<()> {
        if let Some(dir) = path.parent() {
            if !dir.exists() {
                fs::create_dir_all(dir)?;
            }
        }

        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Check if any configuration is set
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// A configuration with every default written out, for `config --init`
    pub fn with_defaults() -> Self {
        Self {
            upload_dir: Some(PathBuf::from(DEFAULT_UPLOAD_DIR)),
            port: Some(DEFAULT_PORT),
            discovery_port: Some(DEFAULT_DISCOVERY_PORT),
            discovery: Some(true),
            service_name: Some(default_service_name()),
            max_file_bytes: Some(DEFAULT_MAX_FILE_BYTES),
            max_files_per_upload: Some(DEFAULT_MAX_FILES_PER_UPLOAD),
            viewer_buffer: Some(DEFAULT_VIEWER_BUFFER),
        }
    }

    pub fn effective_upload_dir(&self) -> PathBuf {
        self.upload_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_UPLOAD_DIR))
    }

    /// Get effective port (CLI argument, then config, then default)
    pub fn effective_port(&self, cli_port: Option<u16>) -> u16 {
        cli_port.or(self.port).unwrap_or(DEFAULT_PORT)
    }

    pub fn effective_discovery_port(&self) -> u16 {
        self.discovery_port.unwrap_or(DEFAULT_DISCOVERY_PORT)
    }

    pub fn discovery_enabled(&self) -> bool {
        self.discovery.unwrap_or(true)
    }

    pub fn effective_service_name(&self) -> String {
        self.service_name.clone().unwrap_or_else(default_service_name)
    }

    pub fn effective_max_file_bytes(&self) -> u64 {
        self.max_file_bytes.unwrap_or(DEFAULT_MAX_FILE_BYTES)
    }

    pub fn effective_max_files_per_upload(&self) -> usize {
        self.max_files_per_upload
            .unwrap_or(DEFAULT_MAX_FILES_PER_UPLOAD)
            .max(1)
    }

    pub fn effective_viewer_buffer(&self) -> usize {
        self.viewer_buffer.unwrap_or(DEFAULT_VIEWER_BUFFER).max(1)
    }
}

/// `<hostname> File Share`, or just `File Share` when the hostname is unknown
pub fn default_service_name() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .map(|name| format!("{} File Share", name))
        .unwrap_or_else(|| "File Share".to_string())
}

/// Format the effective configuration for display
pub fn format_config(config: &Config) -> String {
    fn source<T>(value: &Option<T>) -> &'static str {
        if value.is_some() {
            ""
        } else {
            " (default)"
        }
    }

    let lines = [
        "Current configuration:".to_string(),
        String::new(),
        format!(
            "  upload_dir = \"{}\"{}",
            config.effective_upload_dir().display(),
            source(&config.upload_dir)
        ),
        format!("  port = {}{}", config.effective_port(None), source(&config.port)),
        format!(
            "  discovery = {}{}",
            config.discovery_enabled(),
            source(&config.discovery)
        ),
        format!(
            "  discovery_port = {}{}",
            config.effective_discovery_port(),
            source(&config.discovery_port)
        ),
        format!(
            "  service_name = \"{}\"{}",
            config.effective_service_name(),
            source(&config.service_name)
        ),
        format!(
            "  max_file_bytes = {}{}",
            config.effective_max_file_bytes(),
            source(&config.max_file_bytes)
        ),
        format!(
            "  max_files_per_upload = {}{}",
            config.effective_max_files_per_upload(),
            source(&config.max_files_per_upload)
        ),
        format!(
            "  viewer_buffer = {}{}",
            config.effective_viewer_buffer(),
            source(&config.viewer_buffer)
        ),
    ];

    lines.join("\n")
}
