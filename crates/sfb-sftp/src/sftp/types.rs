// ── Types ─────────────────────────────────────────────────────────────────────

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sfb_core::error::{ConnectionError, TransferError};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

// ── Serde default helpers ────────────────────────────────────────────────────

fn default_ssh_port() -> u16 {
    22
}

// ── Connection & Authentication ──────────────────────────────────────────────

/// Connection parameters as handed over by the view layer.
///
/// Secrets are wrapped in [`SecretString`] so they never show up in `Debug`
/// output and are zeroised when the config is dropped after authentication.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<SecretString>,
    #[serde(default)]
    pub private_key_path: Option<String>,
    #[serde(default)]
    pub private_key_passphrase: Option<SecretString>,
}

impl ConnectionConfig {
    pub fn with_password(host: &str, username: &str, password: &str) -> Self {
        Self {
            host: host.to_string(),
            port: default_ssh_port(),
            username: username.to_string(),
            password: Some(SecretString::new(password.to_string())),
            private_key_path: None,
            private_key_passphrase: None,
        }
    }

    pub fn with_private_key(host: &str, username: &str, key_path: &str) -> Self {
        Self {
            host: host.to_string(),
            port: default_ssh_port(),
            username: username.to_string(),
            password: None,
            private_key_path: Some(key_path.to_string()),
            private_key_passphrase: None,
        }
    }

    /// Password, unless the view layer sent an empty string.
    pub fn usable_password(&self) -> Option<&str> {
        self.password
            .as_ref()
            .map(|p| p.expose_secret().as_str())
            .filter(|p| !p.is_empty())
    }

    /// Key path, unless the view layer sent an empty string.
    pub fn usable_key_path(&self) -> Option<&str> {
        self.private_key_path
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
    }

    pub fn usable_passphrase(&self) -> Option<&str> {
        self.private_key_passphrase
            .as_ref()
            .map(|p| p.expose_secret().as_str())
            .filter(|p| !p.is_empty())
    }

    pub fn validate(&self) -> Result<(), ConnectionError> {
        if self.host.trim().is_empty() {
            return Err(ConnectionError::InvalidConfig("host must not be empty".into()));
        }
        if self.username.trim().is_empty() {
            return Err(ConnectionError::InvalidConfig(
                "username must not be empty".into(),
            ));
        }
        if self.usable_password().is_none() && self.usable_key_path().is_none() {
            return Err(ConnectionError::InvalidConfig(
                "a password or a private key path is required".into(),
            ));
        }
        Ok(())
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum AuthMethod {
    Password,
    KeyboardInteractive,
    PrivateKey,
}

// ── Session ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// What survives of a connection once authentication is done.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth_method: AuthMethod,
    pub state: SessionState,
    pub connected_at: DateTime<Utc>,
    pub remote_home: Option<String>,
}

// ── Directory Listing ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryEntry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    /// Only meaningful for files.
    pub size_bytes: u64,
    pub modified_epoch_seconds: u64,
}

// ── Transfer ─────────────────────────────────────────────────────────────────

/// Opaque identifier correlating a started transfer with its events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct TransferToken(Uuid);

impl TransferToken {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TransferToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for TransferToken {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TransferDirection {
    Download,
    Upload,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TransferState {
    Pending,
    InProgress,
    Completed,
    Cancelled,
    Failed,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Cancelled | TransferState::Failed
        )
    }
}

/// Point-in-time view of a tracked transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferSnapshot {
    pub token: TransferToken,
    pub direction: TransferDirection,
    pub remote_path: String,
    pub local_path: PathBuf,
    pub state: TransferState,
    pub bytes_transferred: u64,
    pub total_bytes: Option<u64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<TransferError>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum TransferOutcome {
    #[serde(rename_all = "camelCase")]
    Completed { bytes_transferred: u64 },
    Cancelled,
    Failed { error: TransferError },
}

impl TransferOutcome {
    pub fn state(&self) -> TransferState {
        match self {
            TransferOutcome::Completed { .. } => TransferState::Completed,
            TransferOutcome::Cancelled => TransferState::Cancelled,
            TransferOutcome::Failed { .. } => TransferState::Failed,
        }
    }
}

impl From<Result<u64, TransferError>> for TransferOutcome {
    fn from(r: Result<u64, TransferError>) -> Self {
        match r {
            Ok(bytes_transferred) => TransferOutcome::Completed { bytes_transferred },
            Err(TransferError::Cancelled) => TransferOutcome::Cancelled,
            Err(error) => TransferOutcome::Failed { error },
        }
    }
}

// ── Events ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ProgressEvent {
    #[serde(rename_all = "camelCase")]
    Progress {
        token: TransferToken,
        bytes_transferred: u64,
        total_bytes: Option<u64>,
    },
    Terminal {
        token: TransferToken,
        outcome: TransferOutcome,
    },
}

impl ProgressEvent {
    pub fn token(&self) -> TransferToken {
        match self {
            ProgressEvent::Progress { token, .. } | ProgressEvent::Terminal { token, .. } => *token,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressEvent::Terminal { .. })
    }
}
