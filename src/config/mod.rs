//! # Runtime Configuration
//!
//! Holds every tunable the vibration controller reads on each tick, plus the
//! connection settings of the device session.
//!
//! ## Storage
//! The configuration lives in a single TOML file, by default
//! `~/.config/hapticlink/config.toml`. A missing file is created with defaults on
//! first start, and missing keys fall back to their defaults so older files keep
//! loading after new settings are added.
//!
//! ## Runtime Updates
//! [`ConfigStore`] wraps a `tokio::sync::watch` channel. The tick loop takes one
//! snapshot per tick, so a tick never sees a half-applied change, while the
//! configuration source (file reload, stdin commands, a host menu) can write at
//! any time.

use color_eyre::eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const CONFIG_DIR: &str = ".config/hapticlink";
const CONFIG_FILE: &str = "config.toml";
const CONFIG_ENV: &str = "HAPTICLINK_CONFIG";

/// How incoming game events are turned into device intensity.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InputMode {
    /// All output suppressed; every tick forces the speed to zero.
    None,
    /// Requests hold their intensity until the next request.
    Fixed,
    /// Requests decay back to `base_speed` after `max_vibe_duration`.
    #[default]
    Varied,
}

impl fmt::Display for InputMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            InputMode::None => "none",
            InputMode::Fixed => "fixed",
            InputMode::Varied => "varied",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for InputMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(InputMode::None),
            "fixed" => Ok(InputMode::Fixed),
            "varied" => Ok(InputMode::Varied),
            other => Err(ConfigError::UnknownInputMode(other.to_string())),
        }
    }
}

/// Validation errors for [`VibeConfig`]
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("strength_multiplier must be a finite value >= 0, got {0}")]
    InvalidStrength(f32),

    #[error("{field} must be within [0, 1], got {value}")]
    SpeedOutOfRange { field: &'static str, value: f32 },

    #[error("max_vibe_duration must be a finite value >= 0, got {0}")]
    InvalidDuration(f32),

    #[error("tick_rate_hz must be at least 1")]
    InvalidTickRate,

    #[error("server_address must start with ws:// or wss://, got {0:?}")]
    InvalidServerAddress(String),

    #[error("unknown input mode: {0:?} (expected none, fixed or varied)")]
    UnknownInputMode(String),
}

/// Tunables read by the vibration controller and the device session.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct VibeConfig {
    /// Scales the controller's speed before dispatch; the product is capped at 1.0.
    pub strength_multiplier: f32,
    /// Intensity used by `tap()` and as the floor of relative requests.
    pub tap_speed: f32,
    /// Idle intensity that varied mode decays back to.
    pub base_speed: f32,
    /// Seconds a request may hold before varied mode decays it.
    pub max_vibe_duration: f32,
    pub input_mode: InputMode,
    /// Forces zero output on every tick while set.
    pub emergency_stop: bool,
    /// Websocket address of the device control server.
    pub server_address: String,
    pub connect_on_start: bool,
    /// Tick frequency of the stand-in host loop.
    pub tick_rate_hz: u32,
}

impl Default for VibeConfig {
    fn default() -> Self {
        Self {
            strength_multiplier: 1.0,
            tap_speed: 0.3,
            base_speed: 0.0,
            max_vibe_duration: 5.0,
            input_mode: InputMode::Varied,
            emergency_stop: false,
            server_address: "ws://127.0.0.1:12345".to_string(),
            connect_on_start: true,
            tick_rate_hz: 60,
        }
    }
}

impl VibeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.strength_multiplier.is_finite() || self.strength_multiplier < 0.0 {
            return Err(ConfigError::InvalidStrength(self.strength_multiplier));
        }
        for (field, value) in [("tap_speed", self.tap_speed), ("base_speed", self.base_speed)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::SpeedOutOfRange { field, value });
            }
        }
        if !self.max_vibe_duration.is_finite() || self.max_vibe_duration < 0.0 {
            return Err(ConfigError::InvalidDuration(self.max_vibe_duration));
        }
        if self.tick_rate_hz == 0 {
            return Err(ConfigError::InvalidTickRate);
        }
        if !(self.server_address.starts_with("ws://") || self.server_address.starts_with("wss://"))
        {
            return Err(ConfigError::InvalidServerAddress(
                self.server_address.clone(),
            ));
        }
        Ok(())
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: VibeConfig =
            toml::from_str(content).map_err(|e| eyre!("Failed to parse config: {}", e))?;
        config
            .validate()
            .map_err(|e| eyre!("Invalid config: {}", e))?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| eyre!("Failed to serialize config: {}", e))
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
        let config = Self::from_toml(&content)?;
        debug!("Loaded config from {}: {:?}", path.display(), config);
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }
        tokio::fs::write(path, self.to_toml()?)
            .await
            .map_err(|e| eyre!("Failed to write config file {}: {}", path.display(), e))?;
        info!("Config saved to {}", path.display());
        Ok(())
    }
}

/// Location of the config file, honouring the `HAPTICLINK_CONFIG` override.
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        return PathBuf::from(path);
    }
    let mut path = get_home_dir();
    path.push(CONFIG_DIR);
    path.push(CONFIG_FILE);
    path
}

fn get_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    })
}

/// Writes a default config file if none exists yet.
pub async fn ensure_default_config(path: &Path) -> Result<()> {
    let exists = tokio::fs::try_exists(path)
        .await
        .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?;
    if !exists {
        info!("Creating default configuration at {}", path.display());
        VibeConfig::default().save(path).await?;
    }
    Ok(())
}

/// Shared, observable configuration.
///
/// Cloning the store is cheap; all clones write to the same channel.
#[derive(Clone, Debug)]
pub struct ConfigStore {
    sender: Arc<watch::Sender<VibeConfig>>,
    path: Option<PathBuf>,
}

impl ConfigStore {
    pub fn new(config: VibeConfig) -> Self {
        let (sender, _) = watch::channel(config);
        Self {
            sender: Arc::new(sender),
            path: None,
        }
    }

    /// Store backed by a file that [`ConfigStore::reload`] re-reads.
    pub fn with_path(config: VibeConfig, path: PathBuf) -> Self {
        let mut store = Self::new(config);
        store.path = Some(path);
        store
    }

    pub fn snapshot(&self) -> VibeConfig {
        self.sender.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<VibeConfig> {
        self.sender.subscribe()
    }

    /// Applies `change` in place. Changes that fail validation are discarded.
    pub fn update<F>(&self, change: F) -> Result<(), ConfigError>
    where
        F: FnOnce(&mut VibeConfig),
    {
        let mut next = self.snapshot();
        change(&mut next);
        next.validate()?;
        self.sender.send_replace(next);
        Ok(())
    }

    pub fn replace(&self, config: VibeConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.sender.send_replace(config);
        Ok(())
    }

    pub fn set_emergency_stop(&self, engaged: bool) {
        self.sender.send_modify(|config| config.emergency_stop = engaged);
        if engaged {
            warn!("Emergency stop engaged");
        } else {
            info!("Emergency stop released");
        }
    }

    /// Re-reads the backing file and publishes it.
    ///
    /// An emergency stop engaged at runtime stays engaged; only `resume`
    /// releases it.
    pub async fn reload(&self) -> Result<VibeConfig> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| eyre!("Config store has no backing file"))?;
        let mut config = VibeConfig::load(path).await?;
        if self.sender.borrow().emergency_stop && !config.emergency_stop {
            warn!("Emergency stop is engaged, keeping it despite the reloaded file");
            config.emergency_stop = true;
        }
        self.sender.send_replace(config.clone());
        info!("Config reloaded from {}", path.display());
        Ok(config)
    }
}
