//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const CONFIG_FILE: &str = "config.ron";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// EventAPI connection settings.
    pub eventapi: EventApiSettings,
    /// What to subscribe to on startup.
    pub watch: WatchConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// EventAPI connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EventApiSettings {
    /// WebSocket endpoint.
    pub host: String,
    /// Silence tolerated before a socket is failed, until the server
    /// announces its own heartbeat interval.
    pub heartbeat_timeout_ms: u64,
    /// Subscriptions per socket.
    pub max_listens: usize,
    /// First reconnect delay.
    pub backoff_initial_ms: u64,
    /// Reconnect delay cap.
    pub backoff_max_ms: u64,
    /// Jitter factor (0.0 - 1.0).
    pub backoff_jitter: f64,
    /// Failed dials before giving up (0 = never).
    pub backoff_max_attempts: u32,
}

/// Topics subscribed on startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WatchConfig {
    /// 7TV user id to follow (`user.update`).
    pub user_id: String,
    /// 7TV emote set id to follow (`emote_set.update`).
    pub emote_set_id: String,
    /// Twitch user ids whose channel cosmetics and entitlements to follow.
    pub twitch_channels: Vec<String>,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log filter (e.g. "debug", "info,liveupdates_eventapi=trace").
    pub log_level: String,
}

impl Default for EventApiSettings {
    fn default() -> Self {
        Self {
            host: "wss://events.7tv.io/v3".to_string(),
            heartbeat_timeout_ms: 60_000,
            max_listens: 100,
            backoff_initial_ms: 1_000,
            backoff_max_ms: 16_000,
            backoff_jitter: 0.25,
            backoff_max_attempts: 0,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl WatchConfig {
    /// Whether anything is configured to be watched.
    pub fn is_empty(&self) -> bool {
        self.user_id.is_empty() && self.emote_set_id.is_empty() && self.twitch_channels.is_empty()
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Platform config directory (`~/.config/liveupdates` on Linux).
    pub fn default_dir() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|dir| dir.join("liveupdates"))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let config = Self::read(&config_path)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);
        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(config_dir.join(CONFIG_FILE), serialized).map_err(ConfigError::WriteError)
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let new_config = Self::read(&config_dir.join(CONFIG_FILE))?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }

    fn read(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        ron::from_str(&contents).map_err(ConfigError::ParseError)
    }
}
