// Configuration management for the Veil CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/veil/config.json
// - Linux: ~/.config/veil/config.json
// - Windows: %APPDATA%\veil\config.json
//
// Keys are dotted paths into the JSON document, e.g.
// `engine.orchestrator.fee_bps` or `engine.currencies.BTC.max_pool`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use veil_core::MixerConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Store directory; defaults to `<data dir>/store`
    #[serde(default)]
    pub storage_path: Option<String>,

    /// Also write a daily rolling log file under `<data dir>/logs`
    #[serde(default)]
    pub log_to_file: bool,

    /// Emit JSON log lines instead of human-readable ones
    #[serde(default)]
    pub json_logs: bool,

    #[serde(default)]
    pub engine: MixerConfig,
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("veil");
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
        Ok(config_dir)
    }

    /// Get the data directory path (cross-platform)
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to determine data directory")?
            .join("veil");
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;
        Ok(data_dir)
    }

    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    pub fn storage_dir(&self) -> Result<PathBuf> {
        match &self.storage_path {
            Some(path) => Ok(PathBuf::from(path)),
            None => Ok(Self::data_dir()?.join("store")),
        }
    }

    /// Load config from file, or the defaults if none was written yet
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
        let config: Config =
            serde_json::from_str(&contents).context("Failed to parse config file")?;
        config.engine.validate().context("Invalid engine configuration")?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Get a config value by dotted key
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        let document = serde_json::to_value(self).context("Failed to serialize config")?;
        let mut current = &document;
        for part in key.split('.') {
            match current.get(part) {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }
        Ok(Some(current.clone()))
    }

    /// Set a config value by dotted key. The value is parsed as JSON and
    /// falls back to a plain string.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut document = serde_json::to_value(&*self).context("Failed to serialize config")?;
        let parsed = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));

        let parts: Vec<&str> = key.split('.').collect();
        let (last, parents) = parts
            .split_last()
            .context("Config key must not be empty")?;
        let mut current = &mut document;
        for part in parents {
            current = current
                .get_mut(*part)
                .with_context(|| format!("Unknown config key: {}", key))?;
        }
        let slot = current
            .get_mut(*last)
            .with_context(|| format!("Unknown config key: {}", key))?;
        *slot = parsed;

        let updated: Config = serde_json::from_value(document)
            .with_context(|| format!("Invalid value for {}: {}", key, value))?;
        updated
            .engine
            .validate()
            .with_context(|| format!("Rejected value for {}", key))?;
        *self = updated;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.engine.validate().is_ok());
        assert!(!config.log_to_file);
    }

    #[test]
    fn test_dotted_get_and_set() {
        let mut config = Config::default();
        assert_eq!(
            config.get("engine.orchestrator.fee_bps").unwrap(),
            Some(Value::from(50))
        );
        config.set("engine.orchestrator.fee_bps", "75").unwrap();
        assert_eq!(config.engine.orchestrator.fee_bps, 75);

        config.set("storage_path", "/tmp/veil").unwrap();
        assert_eq!(config.storage_path.as_deref(), Some("/tmp/veil"));
        assert_eq!(config.get("engine.nope").unwrap(), None);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut config = Config::default();
        assert!(config.set("engine.missing.key", "1").is_err());
        assert!(config.set("engine.orchestrator.fee_bps", "\"lots\"").is_err());
        assert!(config
            .set("engine.orchestrator.max_concurrent_mixes", "0")
            .is_err());
        assert_eq!(config.engine.orchestrator.fee_bps, 50);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = Config::default();
        config.json_logs = true;
        config.save_to(&path).unwrap();
        let loaded = Config::load_from(&path).unwrap();
        assert!(loaded.json_logs);
        assert_eq!(loaded.engine, config.engine);
    }
}
