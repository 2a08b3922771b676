//! Offline core configuration.
//!
//! Stored at `~/.config/ccr-offline/config.json`. Every field has a default,
//! so a missing file or a partial one is fine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Application name used for config/data directory paths
pub const APP_NAME: &str = "ccr-offline";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// What a drain pass does with the items after one that failed transiently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderingPolicy {
    /// Keep going; the failed item waits for the next pass.
    #[default]
    Continue,
    /// Stop the pass so nothing overtakes the blocked item.
    Strict,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    /// Failed replays allowed before an item is quarantined. An item is
    /// attempted at most `max_retries + 1` times.
    pub max_retries: u32,
    /// First automatic retry delay; doubles per recorded retry.
    pub base_delay_ms: u64,
    /// Ceiling for the automatic retry delay.
    pub max_delay_ms: u64,
    /// TTL applied when a read does not name one.
    pub default_ttl_secs: u64,
    /// Window in which connectivity flaps are coalesced.
    pub debounce_ms: u64,
    pub ordering: OrderingPolicy,
    /// Overrides the platform data directory for the file store.
    pub data_dir: Option<PathBuf>,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 5 * 60 * 1000,
            default_ttl_secs: 300,
            debounce_ms: 500,
            ordering: OrderingPolicy::Continue,
            data_dir: None,
        }
    }
}

impl OfflineConfig {
    /// Load from the default location, falling back to defaults when the file
    /// does not exist.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory backing the file store.
    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.data_dir {
            return Ok(dir.clone());
        }
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn default_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.default_ttl_secs.min(i64::MAX as u64) as i64)
    }

    /// Delay before the automatic retry of an item that has failed `retries`
    /// times: `base_delay * 2^retries`, capped at `max_delay`.
    pub fn backoff_delay(&self, retries: u32) -> Duration {
        let factor = 1u64.checked_shl(retries).unwrap_or(u64::MAX);
        let millis = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OfflineConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.ordering, OrderingPolicy::Continue);
        assert_eq!(config.default_ttl(), chrono::Duration::minutes(5));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: OfflineConfig =
            serde_json::from_str(r#"{"max_retries": 5, "ordering": "strict"}"#).unwrap();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.ordering, OrderingPolicy::Strict);
        assert_eq!(config.base_delay_ms, 1000);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = OfflineConfig {
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
            ..Default::default()
        };
        assert_eq!(config.backoff_delay(0), Duration::from_secs(1));
        assert_eq!(config.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(config.backoff_delay(3), Duration::from_secs(8));
        assert_eq!(config.backoff_delay(4), Duration::from_secs(10));
        assert_eq!(config.backoff_delay(200), Duration::from_secs(10));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = OfflineConfig {
            max_retries: 7,
            data_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        config.save_to(&path).unwrap();
        assert_eq!(OfflineConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = OfflineConfig::load_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, OfflineConfig::default());
    }
}
