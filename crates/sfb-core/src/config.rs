// ── Core configuration ───────────────────────────────────────────────────────

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// Largest accepted `chunkSize`; each transfer holds one chunk in memory.
pub const MAX_CHUNK_SIZE: usize = 64 * 1024 * 1024;

// ── Serde default helpers ────────────────────────────────────────────────────

fn default_chunk_size() -> usize {
    1_048_576 // 1 MiB
}
fn default_max_concurrent_transfers() -> usize {
    4
}
fn default_connect_timeout_secs() -> u64 {
    30
}
fn default_keepalive_secs() -> u64 {
    60
}
fn default_progress_buffer() -> usize {
    64
}
fn default_terminal_retention() -> usize {
    256
}

/// Whether downloads may open their own sub-channel when the remote supports it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum MultiplexingPolicy {
    /// Use independent sub-channels for transfers if the channel offers them.
    #[default]
    Auto,
    /// Always serialise every operation through the single FIFO queue.
    Off,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CoreConfig {
    /// Upper bound for a single remote read / write.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Simultaneously active transfer tasks; the rest wait in `Pending`.
    #[serde(default = "default_max_concurrent_transfers")]
    pub max_concurrent_transfers: usize,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// 0 disables SSH keepalives.
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_interval_secs: u64,
    /// Per-subscriber progress buffer; the oldest progress update is dropped when full.
    #[serde(default = "default_progress_buffer")]
    pub progress_buffer: usize,
    /// Terminal outcomes replayed to subscribers that join late.
    #[serde(default = "default_terminal_retention")]
    pub terminal_retention: usize,
    #[serde(default)]
    pub multiplexing: MultiplexingPolicy,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_concurrent_transfers: default_max_concurrent_transfers(),
            connect_timeout_secs: default_connect_timeout_secs(),
            keepalive_interval_secs: default_keepalive_secs(),
            progress_buffer: default_progress_buffer(),
            terminal_retention: default_terminal_retention(),
            multiplexing: MultiplexingPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config value: {0}")]
    Invalid(String),
}

impl CoreConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let cfg: CoreConfig = serde_json::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg = Self::from_json_str(&raw)?;
        info!(path = %path.display(), "loaded core config");
        Ok(cfg)
    }

    /// Missing file means defaults; a present but broken file is logged and
    /// also falls back to defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            return Self::default();
        }
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!("ignoring config at {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// `<config dir>/sfb/config.json`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("sfb").join("config.json"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunkSize must be > 0".into()));
        }
        if self.chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::Invalid(format!(
                "chunkSize must be <= {}",
                MAX_CHUNK_SIZE
            )));
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::Invalid("connectTimeoutSecs must be > 0".into()));
        }
        if self.max_concurrent_transfers == 0 {
            return Err(ConfigError::Invalid(
                "maxConcurrentTransfers must be > 0".into(),
            ));
        }
        if self.progress_buffer == 0 {
            return Err(ConfigError::Invalid("progressBuffer must be > 0".into()));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.connect_timeout_secs)
    }
}
