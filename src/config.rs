//! Configuration module for the monitor and extraction pipeline.
//!
//! This module provides a layered configuration system that supports:
//! - Default values
//! - TOML configuration file
//! - Environment variable overrides
//! - CLI argument overrides
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `IW_` and use double underscores
//! to separate nested levels:
//! - `IW_MONITOR__ENABLED=false` sets `monitor.enabled`
//! - `IW_MONITOR__LIMIT_RESERVE=1000` sets `monitor.limit_reserve`
//! - `IW_EXTRACTION__DEADLINE_SECS=60` sets `extraction.deadline_secs`

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the per-workspace configuration directory.
pub const CONFIG_DIR: &str = ".indexwatch";

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Version of the configuration schema
    #[serde(default = "default_version")]
    pub version: u32,

    /// Directory monitoring settings
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Metadata extraction settings
    #[serde(default)]
    pub extraction: ExtractionConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MonitorConfig {
    /// Whether native watches are installed at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Watches left for other processes when the backend shares a
    /// per-user table (inotify)
    #[serde(default = "default_limit_reserve")]
    pub limit_reserve: usize,

    /// Replaces the discovered watch ceiling when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_limit: Option<usize>,

    /// Fallback flush for cached created/changed events whose
    /// changes-done hint never arrives
    #[serde(default = "default_hint_timeout_ms")]
    pub hint_timeout_ms: u64,

    /// How long the first half of a rename waits for its partner
    #[serde(default = "default_move_pairing_ms")]
    pub move_pairing_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ExtractionConfig {
    /// Extractions allowed in flight at once
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Hard per-item deadline; exceeding it terminates the process
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,

    /// Crash-recovery marker directory (defaults to a per-user temp dir)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistence_dir: Option<PathBuf>,

    /// Where failure reports are kept (defaults to the user cache dir)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_report_dir: Option<PathBuf>,

    /// Append-only log of store update statements
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Default filter level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub default: String,

    /// Per-target overrides, e.g. `"indexwatch::watcher" = "debug"`
    #[serde(default)]
    pub modules: HashMap<String, String>,
}

// Default value functions
fn default_version() -> u32 {
    1
}
fn default_true() -> bool {
    true
}
fn default_limit_reserve() -> usize {
    500
}
fn default_hint_timeout_ms() -> u64 {
    2_000
}
fn default_move_pairing_ms() -> u64 {
    100
}
fn default_max_in_flight() -> usize {
    1
}
fn default_deadline_secs() -> u64 {
    30
}
fn default_store_path() -> PathBuf {
    PathBuf::from(CONFIG_DIR).join("store.jsonl")
}
fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            monitor: MonitorConfig::default(),
            extraction: ExtractionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            limit_reserve: default_limit_reserve(),
            fixed_limit: None,
            hint_timeout_ms: default_hint_timeout_ms(),
            move_pairing_ms: default_move_pairing_ms(),
        }
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            deadline_secs: default_deadline_secs(),
            persistence_dir: None,
            error_report_dir: None,
            store_path: default_store_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default: default_log_level(),
            modules: HashMap::new(),
        }
    }
}

impl MonitorConfig {
    pub fn hint_timeout(&self) -> Duration {
        Duration::from_millis(self.hint_timeout_ms)
    }

    pub fn move_pairing_window(&self) -> Duration {
        Duration::from_millis(self.move_pairing_ms)
    }
}

impl ExtractionConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs.max(1))
    }

    /// Error report directory, falling back to `<cache>/indexwatch/errors`.
    pub fn error_report_dir(&self) -> PathBuf {
        self.error_report_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("indexwatch")
                .join("errors")
        })
    }
}

impl Settings {
    /// Load configuration from all sources
    pub fn load() -> Result<Self, Box<figment::Error>> {
        let config_path = Self::find_workspace_config()
            .unwrap_or_else(|| PathBuf::from(CONFIG_DIR).join("settings.toml"));

        Self::figment(&config_path).extract().map_err(Box::new)
    }

    /// Load configuration from a specific file (environment still applies)
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, Box<figment::Error>> {
        Self::figment(path.as_ref()).extract().map_err(Box::new)
    }

    fn figment(config_path: &Path) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Toml::file(config_path))
            // Double underscore separates nested levels; single underscores
            // stay inside field names
            .merge(Env::prefixed("IW_").map(|key| {
                key.as_str().to_lowercase().replace("__", ".").into()
            }))
    }

    /// Find the workspace config by looking for the `.indexwatch` directory
    /// from the current directory up to root
    fn find_workspace_config() -> Option<PathBuf> {
        let current = std::env::current_dir().ok()?;

        for ancestor in current.ancestors() {
            let config_dir = ancestor.join(CONFIG_DIR);
            if config_dir.is_dir() {
                return Some(config_dir.join("settings.toml"));
            }
        }

        None
    }

    /// Save current configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Box<dyn std::error::Error>> {
        let parent = path.as_ref().parent().ok_or("Invalid path")?;
        std::fs::create_dir_all(parent)?;

        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;

        Ok(())
    }

    /// Create a default settings file in the current directory
    pub fn init_config_file(force: bool) -> Result<PathBuf, Box<dyn std::error::Error>> {
        let config_path = PathBuf::from(CONFIG_DIR).join("settings.toml");

        if !force && config_path.exists() {
            return Err("Configuration file already exists. Use --force to overwrite".into());
        }

        Settings::default().save(&config_path)?;
        Ok(config_path)
    }
}
