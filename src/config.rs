use crate::core::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Top-level configuration structure parsed from a TOML file.
///
/// Every section and field is optional in the file; missing values fall
/// back to the defaults below.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub history: HistorySettings,
    pub cache: CacheSettings,
    pub query: QuerySettings,
}

/// Query history configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct HistorySettings {
    /// Entries kept before the oldest are evicted
    pub max_entries: usize,
}

impl Default for HistorySettings {
    fn default() -> Self {
        HistorySettings { max_entries: 1000 }
    }
}

/// Result cache configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub max_memory_mb: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            enabled: true,
            max_memory_mb: 64,
        }
    }
}

impl CacheSettings {
    pub fn max_memory_bytes(&self) -> usize {
        usize::try_from(self.max_memory_mb.saturating_mul(1024 * 1024)).unwrap_or(usize::MAX)
    }
}

/// Query execution configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct QuerySettings {
    /// Rows kept per result set before it is marked truncated
    pub max_rows: usize,
    /// Async queries nobody touched for this long are reclaimed
    pub idle_timeout_secs: u64,
    /// Minimum time between two reclaim sweeps
    pub sweep_interval_secs: u64,
}

impl Default for QuerySettings {
    fn default() -> Self {
        QuerySettings {
            max_rows: 100_000,
            idle_timeout_secs: 300,
            sweep_interval_secs: 10,
        }
    }
}

impl QuerySettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Settings {
    /// Loads settings from a TOML file at the given path.
    ///
    /// # Example
    ///
    /// ```no_run
    /// let settings = querydeck::config::Settings::load("config.toml").expect("Failed to load config");
    /// println!("{:?}", settings);
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Settings> {
        let content = fs::read_to_string(path.as_ref())?;
        debug!("Loaded settings from {:?}", path.as_ref());
        Ok(toml::from_str(&content)?)
    }

    /// `<config dir>/querydeck/config.toml`, when the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("querydeck").join("config.toml"))
    }

    /// Loads the default settings file if it exists, otherwise the defaults.
    pub fn load_or_default() -> Result<Settings> {
        match Settings::default_path() {
            Some(path) if path.exists() => Settings::load(path),
            _ => Ok(Settings::default()),
        }
    }
}
