//! Configuration system for Playnet.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $PLAYNET_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/playnet/config.toml
//!   3. ~/.config/playnet/config.toml

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::guid::Guid;
use crate::wire::DEFAULT_PORT;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaynetConfig {
    /// Service providers offered to applications.
    pub providers: Vec<ProviderConfig>,
    pub network: NetworkConfig,
    pub discovery: DiscoveryConfig,
    pub session: SessionConfig,
    pub lobby: LobbyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind the UDP socket to.
    pub bind: IpAddr,
    /// UDP port for discovery and session traffic.
    pub port: u16,
    /// Where discovery requests are sent.
    pub broadcast: SocketAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// How long one enumeration waits for replies.
    pub timeout_ms: u64,
    /// Cached sessions not refreshed within this many seconds are pruned.
    pub session_max_age_secs: u32,
    /// How long a request waits for its reply before giving up.
    pub reply_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Application this node hosts or looks for. Nil = any application.
    pub application_id: Guid,
    /// Session name announced when hosting.
    pub name: String,
    /// 0 = unlimited.
    pub max_players: u32,
    /// Empty = no password.
    pub password: String,
    /// Host a session instead of browsing.
    pub host: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LobbyConfig {
    /// Directory holding the shared segment file.
    pub segment_dir: PathBuf,
    /// Segment and semaphore name.
    pub segment_name: String,
    pub slots: u32,
    /// Bytes per arena block, header included.
    pub block_size: u32,
    pub block_count: u32,
}

/// One entry of the service-provider catalogue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub guid: Guid,
    pub name: String,
    #[serde(default)]
    pub major_version: u16,
    #[serde(default)]
    pub minor_version: u16,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            broadcast: SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), DEFAULT_PORT),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 1_000,
            session_max_age_secs: 60,
            reply_timeout_ms: 5_000,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            application_id: Guid::NIL,
            name: "Playnet Session".to_string(),
            max_players: 0,
            password: String::new(),
            host: false,
        }
    }
}

impl Default for LobbyConfig {
    fn default() -> Self {
        Self {
            segment_dir: PathBuf::from("/dev/shm"),
            segment_name: "playnet-lobby".to_string(),
            slots: 32,
            block_size: 512,
            block_count: 256,
        }
    }
}

impl DiscoveryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

impl LobbyConfig {
    pub fn segment_path(&self) -> PathBuf {
        self.segment_dir.join(&self.segment_name)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("playnet")
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
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl PlaynetConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            PlaynetConfig::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("PLAYNET_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&PlaynetConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply PLAYNET_* overrides. `lookup` stands in for the environment so
    /// tests do not have to mutate process state.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let flag = |v: String| v == "true" || v == "1";

        if let Some(v) = lookup("PLAYNET_NETWORK__BIND").and_then(|v| v.parse().ok()) {
            self.network.bind = v;
        }
        if let Some(v) = lookup("PLAYNET_NETWORK__PORT").and_then(|v| v.parse().ok()) {
            self.network.port = v;
        }
        if let Some(v) = lookup("PLAYNET_NETWORK__BROADCAST").and_then(|v| v.parse().ok()) {
            self.network.broadcast = v;
        }
        if let Some(v) = lookup("PLAYNET_DISCOVERY__TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.discovery.timeout_ms = v;
        }
        if let Some(v) = lookup("PLAYNET_SESSION__APPLICATION_ID").and_then(|v| v.parse().ok()) {
            self.session.application_id = v;
        }
        if let Some(v) = lookup("PLAYNET_SESSION__NAME") {
            self.session.name = v;
        }
        if let Some(v) = lookup("PLAYNET_SESSION__HOST") {
            self.session.host = flag(v);
        }
        if let Some(v) = lookup("PLAYNET_LOBBY__SEGMENT_DIR") {
            self.lobby.segment_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("PLAYNET_LOBBY__SEGMENT_NAME") {
            self.lobby.segment_name = v;
        }
    }
}
