//! Daemon configuration: file mappings plus default settings.
//!
//! Configuration is read from a JSON or TOML file (picked by extension),
//! then environment overrides are applied and the result is validated.
//! Anything invalid is a [`SyncError::Configuration`], which is only ever
//! raised here, before the watcher starts.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, SyncError};
use crate::sync::retry::RetryPolicy;

/// Environment variable naming the configuration file.
pub const CONFIG_FILE_ENV: &str = "KBC_SYNC_CONFIG";

/// Upper bound for every duration setting, in seconds (one week).
const MAX_SECONDS: f64 = 7.0 * 24.0 * 3600.0;

/// Upper bound for `retry_backoff`.
const MAX_BACKOFF: f64 = 100.0;

const VALID_LOG_LEVELS: &[&str] = &["TRACE", "DEBUG", "INFO", "WARN", "WARNING", "ERROR"];

/// Default location of the configuration file (~/.config/kbc-sync/config.json).
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("kbc-sync").join("config.json"))
}

/// Synchronization strategy for a mapped file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Replace the whole table on every change.
    FullLoad,
    /// Append only rows added since the last sync.
    Incremental,
    /// Post the file in line batches to an HTTP endpoint.
    Streaming,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FullLoad => "full_load",
            Self::Incremental => "incremental",
            Self::Streaming => "streaming",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncMode {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "full_load" => Ok(Self::FullLoad),
            "incremental" => Ok(Self::Incremental),
            "streaming" => Ok(Self::Streaming),
            other => Err(SyncError::Configuration(format!(
                "invalid sync mode '{other}', expected full_load, incremental or streaming"
            ))),
        }
    }
}

fn default_batch_size() -> usize {
    1000
}

fn default_enabled() -> bool {
    true
}

/// Mode-specific mapping options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingOptions {
    #[serde(default)]
    pub primary_key: Vec<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streaming_endpoint: Option<String>,
}

impl Default for MappingOptions {
    fn default() -> Self {
        Self {
            primary_key: Vec::new(),
            batch_size: default_batch_size(),
            streaming_endpoint: None,
        }
    }
}

/// Binding of one local file to a remote table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMapping {
    pub file_path: PathBuf,
    pub bucket_id: String,
    pub table_id: String,
    pub sync_mode: SyncMode,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub options: MappingOptions,
}

impl FileMapping {
    pub fn new(
        file_path: impl Into<PathBuf>,
        bucket_id: impl Into<String>,
        table_id: impl Into<String>,
        sync_mode: SyncMode,
    ) -> Self {
        Self {
            file_path: file_path.into(),
            bucket_id: bucket_id.into(),
            table_id: table_id.into(),
            sync_mode,
            enabled: true,
            options: MappingOptions::default(),
        }
    }

    pub fn with_options(mut self, options: MappingOptions) -> Self {
        self.options = options;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    fn validate(&self) -> Result<()> {
        let path = self.file_path.display();
        if self.file_path.as_os_str().is_empty() {
            return Err(SyncError::Configuration("mapping has an empty file_path".into()));
        }
        if self.bucket_id.trim().is_empty() {
            return Err(SyncError::Configuration(format!("mapping {path}: bucket_id is required")));
        }
        if self.table_id.trim().is_empty() {
            return Err(SyncError::Configuration(format!("mapping {path}: table_id is required")));
        }
        if self.sync_mode == SyncMode::Streaming {
            match self.options.streaming_endpoint.as_deref() {
                Some(endpoint) if !endpoint.trim().is_empty() => {}
                _ => {
                    return Err(SyncError::Configuration(format!(
                        "mapping {path}: streaming_endpoint is required for streaming mode"
                    )))
                }
            }
            if self.options.batch_size == 0 {
                return Err(SyncError::Configuration(format!(
                    "mapping {path}: batch_size must be greater than zero"
                )));
            }
        }
        Ok(())
    }
}

/// Daemon-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub watched_directory: PathBuf,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub compression_threshold_mb: f64,
    pub max_retries: u32,
    /// Seconds.
    pub initial_retry_delay: f64,
    /// Seconds.
    pub max_retry_delay: f64,
    pub retry_backoff: f64,
    /// Seconds; events for a path arriving sooner after its last sync are dropped.
    pub debounce_seconds: f64,
    /// Seconds to wait for in-flight pipelines on shutdown.
    pub shutdown_grace_seconds: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            watched_directory: PathBuf::from("data"),
            log_level: "INFO".to_string(),
            log_file: None,
            compression_threshold_mb: 50.0,
            max_retries: 3,
            initial_retry_delay: 1.0,
            max_retry_delay: 30.0,
            retry_backoff: 2.0,
            debounce_seconds: 1.0,
            shutdown_grace_seconds: 10.0,
        }
    }
}

impl Settings {
    pub fn compression_threshold_bytes(&self) -> u64 {
        (self.compression_threshold_mb * 1024.0 * 1024.0) as u64
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries,
            initial_delay: Duration::from_secs_f64(self.initial_retry_delay),
            max_delay: Duration::from_secs_f64(self.max_retry_delay),
            backoff_factor: self.retry_backoff,
        }
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_secs_f64(self.debounce_seconds)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs_f64(self.shutdown_grace_seconds)
    }

    fn validate(&mut self) -> Result<()> {
        let level = self.log_level.to_uppercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(SyncError::Configuration(format!(
                "invalid log level '{}', must be one of: {}",
                self.log_level,
                VALID_LOG_LEVELS.join(", ")
            )));
        }
        self.log_level = level;

        if !self.compression_threshold_mb.is_finite() || self.compression_threshold_mb < 0.0 {
            return Err(SyncError::Configuration(format!(
                "compression_threshold_mb must be a non-negative number, got {}",
                self.compression_threshold_mb
            )));
        }
        let durations = [
            ("initial_retry_delay", self.initial_retry_delay),
            ("max_retry_delay", self.max_retry_delay),
            ("debounce_seconds", self.debounce_seconds),
            ("shutdown_grace_seconds", self.shutdown_grace_seconds),
        ];
        for (name, value) in durations {
            if !(0.0..=MAX_SECONDS).contains(&value) {
                return Err(SyncError::Configuration(format!(
                    "{name} must be between 0 and {MAX_SECONDS} seconds, got {value}"
                )));
            }
        }
        if self.max_retries == 0 {
            return Err(SyncError::Configuration("max_retries must be at least 1".into()));
        }
        if !(1.0..=MAX_BACKOFF).contains(&self.retry_backoff) {
            return Err(SyncError::Configuration(format!(
                "retry_backoff must be between 1 and {MAX_BACKOFF}, got {}",
                self.retry_backoff
            )));
        }
        if self.initial_retry_delay > self.max_retry_delay {
            return Err(SyncError::Configuration(
                "initial_retry_delay must not exceed max_retry_delay".into(),
            ));
        }
        Ok(())
    }
}

/// Full daemon configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub mappings: Vec<FileMapping>,
    #[serde(default)]
    pub default_settings: Settings,
}

impl Config {
    /// Load, override from the environment, validate and prepare the watched directory.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Configuration(format!("cannot read config file {}: {e}", path.display()))
        })?;
        let mut config = Self::parse(&content, path)?;
        config.apply_env_overrides();
        config.validate()?;
        config.prepare_watched_directory()?;
        Ok(config)
    }

    /// Parse configuration text; the format follows the file extension.
    pub fn parse(content: &str, path: &Path) -> Result<Self> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();
        let parsed = match extension.as_str() {
            "json" => serde_json::from_str(content).map_err(|e| e.to_string()),
            "toml" => toml::from_str(content).map_err(|e| e.to_string()),
            other => {
                return Err(SyncError::Configuration(format!(
                    "unsupported config file format '.{other}' (use .json or .toml)"
                )))
            }
        };
        parsed.map_err(|e| {
            SyncError::Configuration(format!("error parsing config file {}: {e}", path.display()))
        })
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("WATCHED_DIRECTORY") {
            if !dir.is_empty() {
                self.default_settings.watched_directory = PathBuf::from(dir);
            }
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            if !level.is_empty() {
                self.default_settings.log_level = level;
            }
        }
        if let Ok(file) = std::env::var("LOG_FILE") {
            if !file.is_empty() {
                self.default_settings.log_file = Some(PathBuf::from(file));
            }
        }
    }

    /// Validate settings and mappings, resolving relative mapping paths
    /// against the watched directory.
    pub fn validate(&mut self) -> Result<()> {
        self.default_settings.validate()?;

        let watched = self.default_settings.watched_directory.clone();
        let mut seen = HashSet::new();
        for mapping in &mut self.mappings {
            mapping.validate()?;
            if mapping.file_path.is_relative() {
                mapping.file_path = watched.join(&mapping.file_path);
            }
            if !seen.insert(mapping.file_path.clone()) {
                return Err(SyncError::Configuration(format!(
                    "duplicate mapping for {}",
                    mapping.file_path.display()
                )));
            }
        }
        Ok(())
    }

    /// Create the watched directory if missing and make every path absolute,
    /// so that mapping paths compare equal to watcher notifications.
    fn prepare_watched_directory(&mut self) -> Result<()> {
        let watched = &self.default_settings.watched_directory;
        std::fs::create_dir_all(watched).map_err(|e| {
            SyncError::Configuration(format!(
                "cannot create watched directory {}: {e}",
                watched.display()
            ))
        })?;
        let canonical = watched.canonicalize().map_err(|e| {
            SyncError::Configuration(format!(
                "cannot resolve watched directory {}: {e}",
                watched.display()
            ))
        })?;

        for mapping in &mut self.mappings {
            if let Ok(rest) = mapping.file_path.strip_prefix(watched) {
                mapping.file_path = canonical.join(rest);
            } else if let Some(parent) = mapping.file_path.parent() {
                if let (Ok(dir), Some(name)) = (parent.canonicalize(), mapping.file_path.file_name()) {
                    mapping.file_path = dir.join(name);
                }
            }
        }
        self.default_settings.watched_directory = canonical;
        Ok(())
    }

    pub fn enabled_mappings(&self) -> impl Iterator<Item = &FileMapping> {
        self.mappings.iter().filter(|m| m.enabled)
    }
}
