//! Session tunables: defaults, optional TOML file, environment overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::chunk::DEFAULT_CHUNK_SIZE;

/// Protocol tunables. File: ~/.config/peerlink/config.toml.
/// Env overrides: PEERLINK_CHUNK_SIZE, PEERLINK_HEARTBEAT_INTERVAL_MS,
/// PEERLINK_LIVENESS_TIMEOUT_MS, PEERLINK_TYPING_TIMEOUT_MS, PEERLINK_MAX_ACTIVE_TRANSFERS.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Bytes per file chunk (default 64 KiB).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Delays before resending an unacknowledged chunk; the last one repeats.
    #[serde(default = "default_retry_delays_ms")]
    pub retry_delays_ms: Vec<u64>,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Silence on the data connection longer than this tears the session down.
    #[serde(default = "default_liveness_timeout_ms")]
    pub liveness_timeout_ms: u64,
    #[serde(default = "default_typing_timeout_ms")]
    pub typing_timeout_ms: u64,
    /// Minimum spacing of progress updates (the final update is never held back).
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    #[serde(default = "default_max_active_transfers")]
    pub max_active_transfers: usize,
    /// How long finished transfers stay downloadable.
    #[serde(default = "default_transfer_grace_ms")]
    pub transfer_grace_ms: u64,
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}
fn default_retry_delays_ms() -> Vec<u64> {
    vec![1000, 4000]
}
fn default_heartbeat_interval_ms() -> u64 {
    500
}
fn default_liveness_timeout_ms() -> u64 {
    2000
}
fn default_typing_timeout_ms() -> u64 {
    5000
}
fn default_progress_interval_ms() -> u64 {
    250
}
fn default_max_active_transfers() -> usize {
    8
}
fn default_transfer_grace_ms() -> u64 {
    30_000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            retry_delays_ms: default_retry_delays_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            liveness_timeout_ms: default_liveness_timeout_ms(),
            typing_timeout_ms: default_typing_timeout_ms(),
            progress_interval_ms: default_progress_interval_ms(),
            max_active_transfers: default_max_active_transfers(),
            transfer_grace_ms: default_transfer_grace_ms(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

impl SessionConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let c: SessionConfig = toml::from_str(s)?;
        c.validate()?;
        Ok(c)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&s)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be positive"));
        }
        if self.retry_delays_ms.is_empty() {
            return Err(ConfigError::Invalid("retry_delays_ms must not be empty"));
        }
        if self.liveness_timeout_ms <= self.heartbeat_interval_ms {
            return Err(ConfigError::Invalid(
                "liveness_timeout_ms must exceed heartbeat_interval_ms",
            ));
        }
        if self.max_active_transfers == 0 {
            return Err(ConfigError::Invalid("max_active_transfers must be positive"));
        }
        Ok(())
    }

    /// Apply env overrides on top of `self`. Unparseable values are ignored.
    pub fn with_env(mut self) -> Self {
        self.apply_env(|k| std::env::var(k).ok());
        self
    }

    fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(v) = get("PEERLINK_CHUNK_SIZE").and_then(|s| s.parse().ok()) {
            self.chunk_size = v;
        }
        if let Some(v) = get("PEERLINK_HEARTBEAT_INTERVAL_MS").and_then(|s| s.parse().ok()) {
            self.heartbeat_interval_ms = v;
        }
        if let Some(v) = get("PEERLINK_LIVENESS_TIMEOUT_MS").and_then(|s| s.parse().ok()) {
            self.liveness_timeout_ms = v;
        }
        if let Some(v) = get("PEERLINK_TYPING_TIMEOUT_MS").and_then(|s| s.parse().ok()) {
            self.typing_timeout_ms = v;
        }
        if let Some(v) = get("PEERLINK_MAX_ACTIVE_TRANSFERS").and_then(|s| s.parse().ok()) {
            self.max_active_transfers = v;
        }
    }
}

/// Load config: default, then the user config file (if present and valid), then env vars.
pub fn load() -> SessionConfig {
    let base = config_path()
        .filter(|p| p.exists())
        .and_then(|p| match SessionConfig::from_file(&p) {
            Ok(c) => Some(c),
            Err(e) => {
                tracing::warn!(path = %p.display(), error = %e, "ignoring config file");
                None
            }
        })
        .unwrap_or_default();
    let c = base.with_env();
    if let Err(e) = c.validate() {
        tracing::warn!(error = %e, "env overrides rejected, using defaults");
        return SessionConfig::default();
    }
    c
}

fn config_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config/peerlink/config.toml"))
}
