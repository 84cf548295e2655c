//! Configuration system for blechat.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $BLECHAT_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/blechat/config.toml
//!   3. ~/.config/blechat/config.toml

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::{IdentityError, IdentityRegistry, IdentitySlot};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlechatConfig {
    pub radio: RadioConfig,
    /// Identity slots, in slot order. Slot index = position in this list.
    pub slots: Vec<SlotConfig>,
    pub messaging: MessagingConfig,
    pub api: ApiConfig,
    pub sim: SimConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    /// Address this device presents to peers.
    pub address: String,
    /// Upper bound for opening or closing one listener.
    pub open_timeout_ms: u64,
    /// Upper bound for one outbound connect.
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotConfig {
    pub service_id: Uuid,
    pub message_attr_id: Uuid,
    pub confirm_attr_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Messages kept per peer in memory. Oldest are evicted first.
    pub history_limit: usize,
    /// Capacity of the message broadcast channel.
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Port for the local HTTP API (127.0.0.1 only).
    pub port: u16,
    /// Interval for logging the session table. 0 = never.
    pub snapshot_log_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Addresses of simulated peers joined to the loopback air at startup.
    pub peers: Vec<String>,
    /// Simulated peers write every received message back.
    pub echo: bool,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for BlechatConfig {
    fn default() -> Self {
        Self {
            radio: RadioConfig::default(),
            slots: IdentityRegistry::default_slots()
                .into_iter()
                .map(SlotConfig::from)
                .collect(),
            messaging: MessagingConfig::default(),
            api: ApiConfig::default(),
            sim: SimConfig::default(),
        }
    }
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            address: "02:00:00:00:00:00".to_string(),
            open_timeout_ms: 2_000,
            connect_timeout_ms: 10_000,
        }
    }
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            history_limit: 500,
            channel_capacity: 256,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: 9101,
            snapshot_log_secs: 5,
        }
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            peers: vec!["02:00:00:00:00:A1".to_string(), "02:00:00:00:00:B2".to_string()],
            echo: true,
        }
    }
}

impl From<IdentitySlot> for SlotConfig {
    fn from(slot: IdentitySlot) -> Self {
        Self {
            service_id: slot.service_id,
            message_attr_id: slot.message_attr_id,
            confirm_attr_id: slot.confirm_attr_id,
        }
    }
}

impl RadioConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl ApiConfig {
    /// How often to log the session table, or `None` when disabled.
    pub fn snapshot_interval(&self) -> Option<Duration> {
        (self.snapshot_log_secs > 0).then(|| Duration::from_secs(self.snapshot_log_secs))
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("blechat")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid identity slots: {0}")]
    Identity(#[from] IdentityError),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl BlechatConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from(&Self::file_path())?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load a specific file without env overrides. Missing file = defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("BLECHAT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        Self::write_default_to(&path)?;
        Ok(path)
    }

    fn write_default_to(path: &Path) -> Result<(), ConfigError> {
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let text =
            toml::to_string_pretty(&Self::default()).map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, text).map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))
    }

    /// Build the validated identity registry from `[[slots]]`.
    pub fn identity_registry(&self) -> Result<IdentityRegistry, ConfigError> {
        let slots = self
            .slots
            .iter()
            .enumerate()
            .map(|(slot_index, s)| IdentitySlot {
                slot_index,
                service_id: s.service_id,
                message_attr_id: s.message_attr_id,
                confirm_attr_id: s.confirm_attr_id,
            })
            .collect();
        Ok(IdentityRegistry::new(slots)?)
    }

    /// Apply BLECHAT_* overrides. `lookup` is `std::env::var` in production.
    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("BLECHAT_RADIO__ADDRESS") {
            self.radio.address = v;
        }
        if let Some(v) = lookup("BLECHAT_RADIO__OPEN_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                self.radio.open_timeout_ms = ms;
            }
        }
        if let Some(v) = lookup("BLECHAT_RADIO__CONNECT_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                self.radio.connect_timeout_ms = ms;
            }
        }
        if let Some(v) = lookup("BLECHAT_API__PORT") {
            if let Ok(p) = v.parse() {
                self.api.port = p;
            }
        }
        if let Some(v) = lookup("BLECHAT_SIM__ECHO") {
            self.sim.echo = v == "true" || v == "1";
        }
    }
}
