//! Configuration for the link-local service.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $SALUT_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/salut/config.toml
//!   3. ~/.config/salut/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub network: NetworkConfig,
    pub stream: StreamConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// First port tried for the local XMPP listener.
    pub port_min: u16,
    /// Last port tried (inclusive).
    pub port_max: u16,
    /// How long to watch the link after browsing starts before claiming
    /// a service name, so an already-taken label can be detected and
    /// renamed. Mirrors the RFC 6762 probe window (3 × 250 ms).
    pub probe_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// A stream idle longer than this is torn down.
    pub idle_timeout_ms: u64,
    /// How often the idle watchdog checks.
    pub watchdog_tick_ms: u64,
    /// How long `get_iq_response` waits for the reply.
    pub reply_timeout_ms: u64,
    /// How long a dial waits for the remote stream header.
    pub open_timeout_ms: u64,
    /// Outbound stanza queue capacity per stream. Enqueue blocks when full.
    pub writer_queue: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            stream: StreamConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port_min: 2300,
            port_max: 2400,
            probe_delay_ms: 750,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 15_000,
            watchdog_tick_ms: 14_000,
            reply_timeout_ms: 5_000,
            open_timeout_ms: 10_000,
            writer_queue: 500,
        }
    }
}

impl ServiceConfig {
    pub fn probe_delay(&self) -> Duration {
        Duration::from_millis(self.network.probe_delay_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.stream.idle_timeout_ms)
    }

    pub fn watchdog_tick(&self) -> Duration {
        Duration::from_millis(self.stream.watchdog_tick_ms)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.stream.reply_timeout_ms)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.stream.open_timeout_ms)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl ServiceConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            ServiceConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("SALUT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Apply SALUT_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SALUT_NETWORK__PORT_MIN") {
            if let Ok(p) = v.parse() {
                self.network.port_min = p;
            }
        }
        if let Ok(v) = std::env::var("SALUT_NETWORK__PORT_MAX") {
            if let Ok(p) = v.parse() {
                self.network.port_max = p;
            }
        }
        if let Ok(v) = std::env::var("SALUT_STREAM__IDLE_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                self.stream.idle_timeout_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("SALUT_STREAM__REPLY_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                self.stream.reply_timeout_ms = ms;
            }
        }
    }
}

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_or_tmp().join(".config"))
        .join("salut")
}

fn home_or_tmp() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
