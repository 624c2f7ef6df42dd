//! Tracker configuration

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Tracker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Time a record stays in the store after its hash is known (milliseconds)
    pub default_ttl_ms: u64,

    /// Key the store snapshot is persisted under
    pub storage_key: String,

    /// Directory for file persistence; in-memory storage when unset
    pub storage_dir: Option<PathBuf>,

    /// Quiet period before a burst of store changes is flushed (milliseconds)
    pub persist_debounce_ms: u64,

    /// Capacity of the store change broadcast channel
    pub change_buffer: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: 30_000,
            storage_key: "transactions".to_string(),
            storage_dir: None,
            persist_debounce_ms: 250,
            change_buffer: 256,
        }
    }
}

impl TrackerConfig {
    /// Parse a TOML document; missing fields keep their defaults
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(contents).map_err(|e| Error::Config(format!("Invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_ttl_ms == 0 {
            return Err(Error::Config("default_ttl_ms must be positive".to_string()));
        }
        if self.storage_key.trim().is_empty() {
            return Err(Error::Config("storage_key must not be empty".to_string()));
        }
        if self.change_buffer == 0 {
            return Err(Error::Config("change_buffer must be positive".to_string()));
        }
        Ok(())
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }
}
