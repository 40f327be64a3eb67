//! `[persistence]` section

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use super::ConfigError;

/// Where persistent sessions are written
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// On-disk LSM keyspace under `path`
    #[default]
    Fjall,
    /// Process memory; gone on restart
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Persist non-clean sessions and their messages
    pub enabled: bool,
    pub backend: BackendType,
    /// Keyspace directory for the fjall backend
    pub path: PathBuf,
    /// Write-behind period, humantime syntax ("100ms", "2s")
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
    /// Pending operations that force a flush before the period elapses
    pub max_batch_size: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backend: BackendType::Fjall,
            path: PathBuf::from("./data"),
            flush_interval: Duration::from_millis(100),
            max_batch_size: 100,
        }
    }
}

impl PersistenceConfig {
    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        let needs_path = self.enabled && self.backend == BackendType::Fjall;
        if needs_path && self.path.as_os_str().is_empty() {
            return Err(ConfigError::invalid(
                "persistence.path is required for the fjall backend",
            ));
        }
        Ok(())
    }
}
