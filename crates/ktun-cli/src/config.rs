//! Global CLI configuration management
//!
//! Stores connection and signal file defaults in ~/.ktun/config.json

use anyhow::{Context, Result};
use ktun_connection::ConnectionConfig;
use ktun_session::SignalFileConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound for the idle check interval read from disk
const MAX_IDLE_CHECK_INTERVAL_SECS: u64 = 24 * 60 * 60;
/// Upper bound for the signal poll interval read from disk
const MAX_SIGNAL_POLL_INTERVAL_MS: u64 = 60 * 60 * 1000;

/// Global CLI configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KtunConfig {
    /// File name prefix of session signal files
    pub signal_prefix: String,
    /// Idle timeout for relayed connections, 0 disables it
    pub idle_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub idle_check_interval_secs: u64,
    pub signal_poll_interval_ms: u64,
}

impl Default for KtunConfig {
    fn default() -> Self {
        Self {
            signal_prefix: "ktun".to_string(),
            idle_timeout_secs: 600,
            connect_timeout_secs: 30,
            idle_check_interval_secs: 30,
            signal_poll_interval_ms: 1000,
        }
    }
}

impl KtunConfig {
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig::with_idle_timeout(Duration::from_secs(self.idle_timeout_secs))
            .with_check_interval(Duration::from_secs(
                self.idle_check_interval_secs.clamp(1, MAX_IDLE_CHECK_INTERVAL_SECS),
            ))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn signal_config(&self) -> SignalFileConfig {
        SignalFileConfig {
            prefix: self.signal_prefix.clone(),
            poll_interval: Duration::from_millis(
                self.signal_poll_interval_ms.clamp(1, MAX_SIGNAL_POLL_INTERVAL_MS),
            ),
            ..SignalFileConfig::default()
        }
    }
}

/// Configuration manager
pub struct ConfigManager;

impl ConfigManager {
    /// Get the config file path
    pub fn config_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Failed to get home directory")?;
        Ok(home.join(".ktun").join("config.json"))
    }

    /// Load the configuration from disk
    pub fn load() -> Result<KtunConfig> {
        Self::load_from(&Self::config_path()?)
    }

    /// Save the configuration to disk
    pub fn save(config: &KtunConfig) -> Result<()> {
        Self::save_to(&Self::config_path()?, config)
    }

    pub fn load_from(path: &Path) -> Result<KtunConfig> {
        // Return default config if file doesn't exist
        if !path.exists() {
            return Ok(KtunConfig::default());
        }

        let json =
            fs::read_to_string(path).context(format!("Failed to read config file: {:?}", path))?;

        let config: KtunConfig = serde_json::from_str(&json)
            .context(format!("Failed to parse config file: {:?}", path))?;

        Ok(config)
    }

    pub fn save_to(path: &Path, config: &KtunConfig) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create config directory: {:?}", parent))?;
        }

        let json = serde_json::to_string_pretty(config).context("Failed to serialize config")?;

        fs::write(path, json).context(format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Apply `change` to the stored configuration and persist it
    pub fn update(change: impl FnOnce(&mut KtunConfig)) -> Result<KtunConfig> {
        let path = Self::config_path()?;
        let mut config = Self::load_from(&path)?;
        change(&mut config);
        Self::save_to(&path, &config)?;
        Ok(config)
    }

    /// Restore defaults
    pub fn reset() -> Result<KtunConfig> {
        let config = KtunConfig::default();
        Self::save(&config)?;
        Ok(config)
    }
}
