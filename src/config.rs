//! Configuration loading for Stacker.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Error;
pub type Result<T> = std::result::Result<T, Error>;

/// Default expiry horizon for live stacks: 8 hours.
pub const DEFAULT_TIMEOUT_SECS: u64 = 8 * 60 * 60;

/// Default spacing between migrated scores, in seconds.
pub const DEFAULT_MIGRATION_OFFSET: f64 = 0.1;

/// Get the Stacker home directory (~/.stacker).
pub fn get_home_dir() -> Result<PathBuf> {
    let home = directories::UserDirs::new()
        .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

    Ok(home.home_dir().join(".stacker"))
}

/// Get the settings file path.
pub fn get_settings_path() -> Result<PathBuf> {
    Ok(get_home_dir()?.join("settings.json"))
}

/// Load settings from ~/.stacker/settings.json
pub fn load_settings() -> Result<Settings> {
    load_settings_from(&get_settings_path()?)
}

/// Load settings from an explicit path. A missing file yields defaults.
pub fn load_settings_from(path: &Path) -> Result<Settings> {
    if !path.exists() {
        tracing::info!(
            "Settings file not found at {}, using defaults",
            path.display()
        );
        let settings = Settings::default();
        validate_settings(&settings)?;
        return Ok(settings);
    }

    let content = std::fs::read_to_string(path)?;
    let settings: Settings = serde_json::from_str(&content)?;

    validate_settings(&settings)?;

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.stack.timeout_secs == 0 {
        return Err(Error::Config("stack.timeout_secs must be positive".to_string()));
    }
    if settings.migration_timeout() >= settings.timeout() {
        return Err(Error::Config(format!(
            "migration.timeout_secs ({}) must be shorter than stack.timeout_secs ({})",
            settings.migration_timeout().as_secs(),
            settings.stack.timeout_secs
        )));
    }
    if !(settings.migration.offset > 0.0 && settings.migration.offset.is_finite()) {
        return Err(Error::Config("migration.offset must be a positive number".to_string()));
    }
    Ok(())
}

/// Telegram channel configuration.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct TelegramConfig {
    pub bot_token: Option<String>,
}

/// Which engine backs the membership store.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    Memory,
}

/// Store configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    pub path: Option<PathBuf>,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: None,
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

/// Live stack configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct StackConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Legacy migration configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MigrationConfig {
    /// Window for migrated entries. Defaults to a quarter of the live timeout.
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_migration_offset")]
    pub offset: f64,
}

fn default_migration_offset() -> f64 {
    DEFAULT_MIGRATION_OFFSET
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            timeout_secs: None,
            offset: default_migration_offset(),
        }
    }
}

/// Stacker settings.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Settings {
    #[serde(default)]
    pub telegram: TelegramConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub stack: StackConfig,

    #[serde(default)]
    pub migration: MigrationConfig,

    /// Known names (without `@`) mapped to stable identities.
    #[serde(default)]
    pub directory: HashMap<String, String>,
}

impl Settings {
    /// Expiry horizon for live stacks.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.stack.timeout_secs)
    }

    /// Window applied to migrated entries.
    pub fn migration_timeout(&self) -> Duration {
        match self.migration.timeout_secs {
            Some(secs) => Duration::from_secs(secs),
            None => self.timeout() / 4,
        }
    }

    /// SQLite database path, defaulting to ~/.stacker/stacks.db.
    pub fn store_path(&self) -> Result<PathBuf> {
        match &self.store.path {
            Some(path) => Ok(path.clone()),
            None => Ok(get_home_dir()?.join("stacks.db")),
        }
    }
}
