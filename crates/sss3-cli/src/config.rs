//! Configuration file handling for the sss3 client

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sss3_session::ClientConfig;
use std::path::{Path, PathBuf};

/// Configuration file contents
///
/// ```toml
/// no_color = true
///
/// [client]
/// broker = "broker.local:80"
/// setup_timeout_ms = 60000
///
/// [client.data_plane]
/// receive_timeout_ms = 400
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Disable colored output
    pub no_color: Option<bool>,
    /// Session settings
    #[serde(default)]
    pub client: ClientConfig,
}

impl Config {
    /// Load configuration from the default config file
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Get the default config file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("sss3");

        Ok(config_dir.join("config.toml"))
    }

    /// Merge CLI arguments over config file values
    pub fn merge_with_args(
        &self,
        broker: Option<&str>,
        mac: Option<&str>,
        no_color: bool,
    ) -> MergedConfig {
        let mut client = self.client.clone();
        if let Some(broker) = broker {
            client.broker = broker.to_string();
        }
        if let Some(mac) = mac {
            client.mac = mac.to_string();
        }

        MergedConfig {
            client,
            no_color: no_color || self.no_color.unwrap_or(false),
        }
    }
}

/// Fully resolved configuration after merging CLI args
#[derive(Debug, Clone)]
pub struct MergedConfig {
    pub client: ClientConfig,
    pub no_color: bool,
}
