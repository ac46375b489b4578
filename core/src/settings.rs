//! Application settings consumed by the orchestration core.
//!
//! Stored in JSON at `~/.portbridge/settings.json`. The core only reads the
//! three values the monitor loop cares about; persistence of anything else
//! belongs to the outer application.

use std::path::PathBuf;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{Error, Result};

/// Settings data stored in JSON format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Start enabled connections when the application launches.
    #[serde(default = "default_true")]
    pub auto_start: bool,

    /// Emit notifications for connection status changes.
    #[serde(default = "default_true")]
    pub show_notifications: bool,

    /// Monitor tick interval in seconds.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_refresh_interval() -> u64 {
    5
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_start: true,
            show_notifications: true,
            refresh_interval_secs: default_refresh_interval(),
        }
    }
}

/// File-backed settings store with an in-memory cache for lock-free-ish reads
/// from the monitor tick.
pub struct SettingsStore {
    settings_path: PathBuf,
    cached: RwLock<Settings>,
}

impl SettingsStore {
    /// Creates a store at the default path (~/.portbridge/settings.json).
    pub fn new() -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| Error::Config("could not determine home directory".to_string()))?;

        Ok(Self::with_path(
            home.join(".portbridge").join("settings.json"),
        ))
    }

    /// Creates a store at a custom path.
    pub fn with_path(path: PathBuf) -> Self {
        Self {
            settings_path: path,
            cached: RwLock::new(Settings::default()),
        }
    }

    /// The last loaded (or default) settings.
    pub fn cached(&self) -> Settings {
        self.cached.read().clone()
    }

    /// Loads settings from disk, refreshing the cache.
    pub async fn load(&self) -> Result<Settings> {
        let settings = if self.settings_path.exists() {
            let content = fs::read_to_string(&self.settings_path)
                .await
                .map_err(|e| Error::Config(format!("failed to read settings: {}", e)))?;
            serde_json::from_str(&content)
                .map_err(|e| Error::Config(format!("failed to parse settings: {}", e)))?
        } else {
            Settings::default()
        };

        *self.cached.write() = settings.clone();
        Ok(settings)
    }

    /// Saves settings to disk and updates the cache.
    pub async fn save(&self, settings: &Settings) -> Result<()> {
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Config(format!("failed to create settings dir: {}", e)))?;
        }

        let content = serde_json::to_string_pretty(settings)
            .map_err(|e| Error::Config(format!("failed to serialize settings: {}", e)))?;
        fs::write(&self.settings_path, content)
            .await
            .map_err(|e| Error::Config(format!("failed to write settings: {}", e)))?;

        *self.cached.write() = settings.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_defaults_when_missing() {
        let dir = tempdir().unwrap();
        let store = SettingsStore::with_path(dir.path().join("settings.json"));

        let settings = store.load().await.unwrap();
        assert!(settings.auto_start);
        assert!(settings.show_notifications);
        assert_eq!(settings.refresh_interval_secs, 5);
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let store = SettingsStore::with_path(dir.path().join("settings.json"));

        let settings = Settings {
            auto_start: false,
            show_notifications: false,
            refresh_interval_secs: 2,
        };
        store.save(&settings).await.unwrap();
        assert!(!store.cached().auto_start);

        let reloaded = store.load().await.unwrap();
        assert!(!reloaded.show_notifications);
        assert_eq!(reloaded.refresh_interval_secs, 2);
    }
}
