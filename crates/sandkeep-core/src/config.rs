//! Process-wide configuration
//!
//! Loaded once at startup from TOML (`~/.config/sandkeep/config.toml` by
//! default), then adjusted by environment variables. Every section falls back
//! to defaults, so an empty file is a valid configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::archive::ArchiveLimits;
use crate::error::ConfigError;

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub sandbox: SandboxConfig,
    pub archive: ArchiveConfig,
    pub locking: LockingConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

/// Sandbox root and content ceilings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SandboxConfig {
    /// Directory every operation is confined to. Created if absent.
    pub root: PathBuf,

    /// Largest file `read_file` will return, in bytes.
    pub max_file_size: u64,

    /// Largest content accepted by create/write, in bytes.
    pub max_upload_size: u64,

    /// Longest accepted file or directory name, in characters.
    pub max_filename_length: usize,
}

/// Archive bomb ceilings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ArchiveConfig {
    pub max_files: usize,
    pub max_ratio: f64,
    pub max_total_size: u64,
    pub max_recursion_depth: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LockingConfig {
    /// How long a single lock acquisition may wait, in milliseconds.
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database holding file records and the operation log.
    pub database_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./sandbox"),
            max_file_size: 100 * 1024 * 1024,  // 100 MB
            max_upload_size: 20 * 1024 * 1024, // 20 MB
            max_filename_length: 255,
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            max_files: 1000,
            max_ratio: 100.0,
            max_total_size: 2 * 1024 * 1024 * 1024, // 2 GB
            max_recursion_depth: 5,
        }
    }
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self { timeout_ms: 5_000 }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_data_dir().join("sandkeep.db"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LockingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl ArchiveConfig {
    pub fn limits(&self) -> ArchiveLimits {
        ArchiveLimits {
            max_files: self.max_files,
            max_ratio: self.max_ratio,
            max_total_size: self.max_total_size,
            max_recursion_depth: self.max_recursion_depth,
        }
    }
}

/// Returns the default configuration file path
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sandkeep")
        .join("config.toml")
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sandkeep")
}

impl Config {
    /// Apply overrides from the process environment.
    ///
    /// Supported variables: `SANDBOX_ROOT`, `MAX_FILE_SIZE`, `MAX_UPLOAD_SIZE`,
    /// `ZIP_MAX_TOTAL_SIZE`, `ZIP_MAX_RATIO`, `ZIP_MAX_FILES`,
    /// `SANDKEEP_DATABASE_PATH`, `SANDKEEP_LOG_LEVEL`.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary variable source
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.is_empty());

        if let Some(root) = get("SANDBOX_ROOT") {
            info!("Overriding sandbox root from environment: {}", root);
            self.sandbox.root = PathBuf::from(root);
        }
        if let Some(v) = parse_override(&get, "MAX_FILE_SIZE") {
            self.sandbox.max_file_size = v;
        }
        if let Some(v) = parse_override(&get, "MAX_UPLOAD_SIZE") {
            self.sandbox.max_upload_size = v;
        }
        if let Some(v) = parse_override(&get, "ZIP_MAX_TOTAL_SIZE") {
            self.archive.max_total_size = v;
        }
        if let Some(v) = parse_override(&get, "ZIP_MAX_RATIO") {
            self.archive.max_ratio = v;
        }
        if let Some(v) = parse_override(&get, "ZIP_MAX_FILES") {
            self.archive.max_files = v;
        }
        if let Some(path) = get("SANDKEEP_DATABASE_PATH") {
            self.storage.database_path = PathBuf::from(path);
        }
        if let Some(level) = get("SANDKEEP_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    /// Validate the configuration values
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let limits = [
            ("sandbox.max_file_size", self.sandbox.max_file_size),
            ("sandbox.max_upload_size", self.sandbox.max_upload_size),
            ("sandbox.max_filename_length", self.sandbox.max_filename_length as u64),
            ("archive.max_files", self.archive.max_files as u64),
            ("archive.max_total_size", self.archive.max_total_size),
            ("locking.timeout_ms", self.locking.timeout_ms),
        ];
        for (field, value) in limits {
            if value == 0 {
                return Err(ConfigError::ZeroLimit { field });
            }
        }

        if !(self.archive.max_ratio.is_finite() && self.archive.max_ratio > 0.0) {
            return Err(ConfigError::InvalidRatio(self.archive.max_ratio));
        }

        let level = self.logging.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file, or defaults if it does not exist
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).map_err(|e| {
            let mut msg = e.message().to_string();
            if let Some(span) = e.span() {
                msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
            }
            anyhow::anyhow!("Invalid TOML configuration: {}", msg)
        })
    }

    /// Save configuration to a file, creating parent directories
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize configuration to TOML")?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        debug!("Configuration saved to {:?}", path);
        Ok(())
    }
}

fn parse_override<T, G>(get: &G, name: &str) -> Option<T>
where
    T: std::str::FromStr,
    G: Fn(&str) -> Option<String>,
{
    let raw = get(name)?;
    match raw.parse() {
        Ok(value) => {
            info!("Overriding {} from environment: {}", name, raw);
            Some(value)
        }
        Err(_) => {
            warn!("Ignoring unparsable {}={:?}", name, raw);
            None
        }
    }
}
