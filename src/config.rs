//! Bridge configuration.
//!
//! Loaded from a TOML file, by default `~/.config/switch-bridge/bridge.toml`.
//! Missing or broken files never stop the bridge from starting: a missing
//! file is created with defaults, an unreadable one is replaced by defaults in
//! memory with a warning.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::bridge::activity_log::DEFAULT_LOG_CAPACITY;
use crate::bridge::hub::DEFAULT_SUBSCRIBER_BUFFER;
use crate::mqtt::config::MqttConfig;

const CONFIG_DIR: &str = ".config/switch-bridge";
const CONFIG_FILE: &str = "bridge.toml";

/// Overrides `mqtt.password` so the secret can stay out of the file.
pub const PASSWORD_ENV: &str = "SWITCH_BRIDGE_MQTT_PASSWORD";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write config file {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    pub mqtt: MqttConfig,
    pub bridge: BridgeSettings,
}

/// Tuning of the bridge core, the `[bridge]` section.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BridgeSettings {
    /// Number of activity entries kept in memory
    pub log_capacity: usize,
    /// Per-subscriber queue length before events are dropped
    pub subscriber_buffer: usize,
    /// How often `connect` checks for an established session
    pub connect_attempts: u32,
    pub connect_interval_ms: u64,
    /// Upper bound for handing a single command to the transport
    pub command_timeout_ms: u64,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            log_capacity: DEFAULT_LOG_CAPACITY,
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            connect_attempts: 10,
            connect_interval_ms: 1000,
            command_timeout_ms: 5000,
        }
    }
}

impl BridgeConfig {
    pub fn default_path() -> PathBuf {
        let mut path = get_home_dir();
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        Ok(config.normalized())
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env_overrides();
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Like [`BridgeConfig::load`], falling back to defaults on any error.
    pub async fn load_or_default(path: &Path) -> Self {
        match Self::load(path).await {
            Ok(config) => config,
            Err(e) => {
                warn!("{}, using default configuration", e);
                let mut config = Self::default();
                config.apply_env_overrides();
                config
            }
        }
    }

    /// Writes a default config file to `path` unless one already exists.
    pub async fn ensure_default_config(path: &Path) -> Result<(), ConfigError> {
        let exists = tokio::fs::try_exists(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        if exists {
            return Ok(());
        }

        info!("Creating default configuration at {}", path.display());
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| ConfigError::Write {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        let content = Self::default().to_toml_string()?;
        tokio::fs::write(path, content)
            .await
            .map_err(|source| ConfigError::Write {
                path: path.to_path_buf(),
                source,
            })
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(password) = std::env::var(PASSWORD_ENV) {
            debug!("Using MQTT password from {}", PASSWORD_ENV);
            self.mqtt.password = Some(password);
        }
    }

    fn normalized(mut self) -> Self {
        let settings = &mut self.bridge;
        settings.log_capacity = settings.log_capacity.max(1);
        settings.subscriber_buffer = settings.subscriber_buffer.max(1);
        settings.connect_attempts = settings.connect_attempts.max(1);
        self
    }
}

fn get_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    })
}
