//! Configuration module for frans.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use tracing::warn;

use crate::expiry::ExpiryDefaults;
use crate::{FransError, Result};

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "data/frans.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Blob storage and upload limits.
#[derive(Debug, Clone, Deserialize)]
pub struct FilesConfig {
    /// Root directory of the content store.
    #[serde(default = "default_files_dir")]
    pub dir: String,
    /// Maximum size of a single upload in bytes.
    #[serde(default = "default_max_size")]
    pub max_size: u64,
    /// Maximum number of files in one ticket or grant.
    #[serde(default = "default_max_files")]
    pub max_files: usize,
}

fn default_files_dir() -> String {
    "files".to_string()
}

fn default_max_size() -> u64 {
    2_000_000_000
}

fn default_max_files() -> usize {
    20
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            dir: default_files_dir(),
            max_size: default_max_size(),
            max_files: default_max_files(),
        }
    }
}

/// Default expiry of shared files and tickets.
#[derive(Debug, Clone, Deserialize)]
pub struct ExpiryConfig {
    #[serde(default = "default_total_days")]
    pub total_days: u32,
    #[serde(default = "default_days_since_last_event")]
    pub days_since_last_download: u32,
    #[serde(default = "default_total_events")]
    pub total_downloads: u32,
}

fn default_total_days() -> u32 {
    30
}

fn default_days_since_last_event() -> u32 {
    7
}

fn default_total_events() -> u32 {
    10
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            total_days: default_total_days(),
            days_since_last_download: default_days_since_last_event(),
            total_downloads: default_total_events(),
        }
    }
}

/// Default expiry of grants (upload destinations).
#[derive(Debug, Clone, Deserialize)]
pub struct GrantConfig {
    #[serde(default = "default_total_days")]
    pub expiry_total_days: u32,
    #[serde(default = "default_days_since_last_event")]
    pub expiry_days_since_last_upload: u32,
    #[serde(default = "default_total_events")]
    pub expiry_total_uploads: u32,
}

impl Default for GrantConfig {
    fn default() -> Self {
        Self {
            expiry_total_days: default_total_days(),
            expiry_days_since_last_upload: default_days_since_last_event(),
            expiry_total_uploads: default_total_events(),
        }
    }
}

/// Lifecycle sweep scheduling.
#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleConfig {
    /// Seconds between two runs of each sweep.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Lifetime of a share access token in seconds.
    #[serde(default = "default_share_token_expiry")]
    pub share_token_expiry_secs: i64,
}

fn default_interval_secs() -> u64 {
    60
}

fn default_share_token_expiry() -> i64 {
    10
}

impl LifecycleConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            share_token_expiry_secs: default_share_token_expiry(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Path to the log file.
    #[serde(default = "default_log_file")]
    pub file: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "logs/frans.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub files: FilesConfig,
    #[serde(default)]
    pub expiry: ExpiryConfig,
    #[serde(default)]
    pub grant: GrantConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(FransError::Io)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML file and apply environment variable overrides.
    pub fn load_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| FransError::Validation(format!("config parse error: {e}")))
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported environment variables:
    /// - `FRANS_DB_PATH`
    /// - `FRANS_FILES_DIR`
    /// - `FRANS_MAX_SIZE`
    /// - `FRANS_MAX_FILES`
    /// - `FRANS_LOG_LEVEL`
    pub fn apply_env_overrides(&mut self) {
        if let Some(path) = env_value("FRANS_DB_PATH") {
            self.database.path = path;
        }
        if let Some(dir) = env_value("FRANS_FILES_DIR") {
            self.files.dir = dir;
        }
        if let Some(max_size) = env_number("FRANS_MAX_SIZE") {
            self.files.max_size = max_size;
        }
        if let Some(max_files) = env_number("FRANS_MAX_FILES") {
            self.files.max_files = max_files;
        }
        if let Some(level) = env_value("FRANS_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.files.max_size == 0 {
            return Err(FransError::Config("files.max_size must be positive".into()));
        }
        if self.files.max_files == 0 {
            return Err(FransError::Config("files.max_files must be positive".into()));
        }
        if self.lifecycle.interval_secs == 0 {
            return Err(FransError::Config(
                "lifecycle.interval_secs must be positive".into(),
            ));
        }
        if self.expiry.total_days == 0 || self.grant.expiry_total_days == 0 {
            return Err(FransError::Config(
                "default expiry total days must be positive".into(),
            ));
        }
        if self.expiry.days_since_last_download == 0 {
            return Err(FransError::Config(
                "expiry.days_since_last_download must be positive".into(),
            ));
        }
        if self.grant.expiry_days_since_last_upload == 0 {
            return Err(FransError::Config(
                "grant.expiry_days_since_last_upload must be positive".into(),
            ));
        }
        if self.expiry.total_downloads == 0 || self.grant.expiry_total_uploads == 0 {
            return Err(FransError::Config(
                "default expiry counts must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Defaults applied to files and tickets with the `auto` policy.
    pub fn file_expiry(&self) -> ExpiryDefaults {
        ExpiryDefaults {
            total_days: i64::from(self.expiry.total_days),
            days_since_last_event: i64::from(self.expiry.days_since_last_download),
            total_events: i64::from(self.expiry.total_downloads),
        }
    }

    /// Defaults applied to grants with the `auto` policy.
    pub fn grant_expiry(&self) -> ExpiryDefaults {
        ExpiryDefaults {
            total_days: i64::from(self.grant.expiry_total_days),
            days_since_last_event: i64::from(self.grant.expiry_days_since_last_upload),
            total_events: i64::from(self.grant.expiry_total_uploads),
        }
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_number<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env_value(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring non-numeric environment override");
            None
        }
    }
}
