//! Bridge configuration
//!
//! Settings come from an optional TOML file and are then overridden by command-line
//! flags. Without `--config`, the file is looked up at
//! `<config dir>/mqtt-log-bridge/config.toml`; when it does not exist the defaults
//! below apply.
//!
//! ```toml
//! [mqtt]
//! server = "tcp://localhost:1883"
//! client_id = "mqtt-log-bridge"
//! topics = ["general"]
//! qos = 1
//!
//! [store]
//! backend = "file"
//! root = "/var/lib/mqtt-log-bridge"
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::bridge::{ChannelSettings, RECORD_SIZE};
use crate::cli::Cli;
use crate::mqtt::config::{
    qos_from_level, BrokerAddress, MqttConfig, ReconnectPolicy, TopicSubscription,
};
use crate::mqtt::MqttError;

pub const APP_DIR: &str = "mqtt-log-bridge";
const CONFIG_FILE: &str = "config.toml";
const DEFAULT_TOPIC: &str = "general";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error(transparent)]
    Mqtt(#[from] MqttError),

    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("no data directory available; set store.root or --store-dir")]
    NoDataDir,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub mqtt: MqttSection,
    pub store: StoreSection,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct MqttSection {
    pub server: String,
    pub client_id: String,
    pub topics: Vec<String>,
    pub qos: u8,
    pub clean_session: bool,
    pub keep_alive_secs: u64,
    pub reconnect_min_secs: u64,
    pub reconnect_max_secs: u64,
    pub max_reconnect_attempts: Option<u32>,
    pub queue_capacity: usize,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            server: "tcp://localhost:1883".to_string(),
            client_id: APP_DIR.to_string(),
            topics: Vec::new(),
            qos: 1,
            clean_session: true,
            keep_alive_secs: 20,
            reconnect_min_secs: 2,
            reconnect_max_secs: 30,
            max_reconnect_attempts: None,
            queue_capacity: 100,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    File,
    Memory,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct StoreSection {
    pub backend: StoreBackend,
    pub root: Option<PathBuf>,
    pub record_size: usize,
    pub capacity_hint: usize,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: StoreBackend::File,
            root: None,
            record_size: RECORD_SIZE,
            capacity_hint: 10_000,
        }
    }
}

/// Resolved store settings
#[derive(Debug, Clone, PartialEq)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    pub root: PathBuf,
    pub channels: ChannelSettings,
}

impl Config {
    /// Loads `explicit` if given, otherwise the default file if present
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::read(path);
        }

        match default_config_path() {
            Some(path) if path.is_file() => Self::read(&path),
            Some(path) => {
                debug!("No config file at {}, using defaults", path.display());
                Ok(Self::default())
            }
            None => Ok(Self::default()),
        }
    }

    fn read(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Command-line flags win over file values
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(host) = &cli.host {
            self.mqtt.server = host.clone();
        }
        if let Some(client_id) = &cli.client_id {
            self.mqtt.client_id = client_id.clone();
        }
        if !cli.topics.is_empty() {
            self.mqtt.topics = cli.topics.clone();
        }
        if let Some(qos) = cli.qos {
            self.mqtt.qos = qos;
        }
        if let Some(dir) = &cli.store_dir {
            self.store.root = Some(dir.clone());
        }
    }

    pub fn mqtt_config(&self) -> Result<MqttConfig, ConfigError> {
        let section = &self.mqtt;
        let server = section.server.parse::<BrokerAddress>()?;
        let qos = qos_from_level(section.qos)?;

        if section.client_id.is_empty() {
            return Err(invalid("mqtt.client_id", "must not be empty"));
        }
        if section.keep_alive_secs != 0 && section.keep_alive_secs < 5 {
            return Err(invalid("mqtt.keep_alive_secs", "must be 0 or at least 5"));
        }
        if section.reconnect_min_secs == 0 || section.reconnect_min_secs > section.reconnect_max_secs {
            return Err(invalid(
                "mqtt.reconnect_min_secs",
                "must be positive and not exceed reconnect_max_secs",
            ));
        }
        if section.queue_capacity == 0 {
            return Err(invalid("mqtt.queue_capacity", "must be positive"));
        }

        let topics = if section.topics.is_empty() {
            vec![DEFAULT_TOPIC.to_string()]
        } else {
            section.topics.clone()
        };
        if topics.iter().any(|t| t.is_empty()) {
            return Err(invalid("mqtt.topics", "topic names must not be empty"));
        }

        Ok(MqttConfig {
            server,
            client_id: section.client_id.clone(),
            subscriptions: topics
                .into_iter()
                .map(|topic| TopicSubscription { topic, qos })
                .collect(),
            clean_session: section.clean_session,
            keep_alive: Duration::from_secs(section.keep_alive_secs),
            reconnect: ReconnectPolicy {
                initial: Duration::from_secs(section.reconnect_min_secs),
                max: Duration::from_secs(section.reconnect_max_secs),
                max_attempts: section.max_reconnect_attempts,
            },
            queue_capacity: section.queue_capacity,
        })
    }

    pub fn store_settings(&self) -> Result<StoreSettings, ConfigError> {
        if self.store.record_size < RECORD_SIZE {
            return Err(invalid(
                "store.record_size",
                format!("must be at least {} bytes", RECORD_SIZE),
            ));
        }

        let root = match &self.store.root {
            Some(root) => root.clone(),
            None => dirs::data_dir().ok_or(ConfigError::NoDataDir)?.join(APP_DIR),
        };

        Ok(StoreSettings {
            backend: self.store.backend,
            root,
            channels: ChannelSettings {
                record_size: self.store.record_size,
                capacity_hint: self.store.capacity_hint,
            },
        })
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.into(),
    }
}
