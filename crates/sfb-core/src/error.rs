//! Error taxonomy shared by every layer.
//!
//! Each enum serialises as `{ "kind": ..., "message": ... }` so the view
//! layer can branch on the kind without parsing display strings.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Connection ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "message", rename_all = "camelCase")]
pub enum ConnectionError {
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),
    #[error("connection timed out: {0}")]
    Timeout(String),
    #[error("invalid connection config: {0}")]
    InvalidConfig(String),
}

// ── Session ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SessionError {
    #[error("not connected")]
    NotConnected,
    #[error("session closed")]
    SessionClosed,
}

// ── Remote filesystem ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "message", rename_all = "camelCase")]
pub enum FsError {
    #[error("path not found: {0}")]
    PathNotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("is a directory: {0}")]
    IsADirectory(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("remote error: {0}")]
    Remote(String),
}

impl FsError {
    /// True when the failure came from the session going away rather than
    /// from the path itself.
    pub fn is_session_loss(&self) -> bool {
        matches!(self, FsError::Session(SessionError::SessionClosed))
    }
}

// ── Transfers ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "message", rename_all = "camelCase")]
pub enum TransferError {
    #[error("remote read failed: {0}")]
    RemoteReadFailed(String),
    #[error("local write failed: {0}")]
    LocalWriteFailed(String),
    #[error("local read failed: {0}")]
    LocalReadFailed(String),
    #[error("remote write failed: {0}")]
    RemoteWriteFailed(String),
    #[error("transfer cancelled")]
    Cancelled,
    /// The transfer task ended without producing an outcome.
    #[error("transfer aborted: {0}")]
    Aborted(String),
    #[error(transparent)]
    Fs(FsError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl From<FsError> for TransferError {
    fn from(e: FsError) -> Self {
        match e {
            FsError::Session(s) => TransferError::Session(s),
            other => TransferError::Fs(other),
        }
    }
}

// ── Cancellation ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "token", rename_all = "camelCase")]
pub enum CancelError {
    #[error("transfer {0} already reached a terminal state")]
    AlreadyTerminal(String),
    #[error("transfer {0} is not tracked")]
    UnknownToken(String),
}

// ── String conversions for string-only callers ──────────────────────────────

macro_rules! impl_into_string {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for String {
                fn from(e: $ty) -> String {
                    e.to_string()
                }
            }
        )*
    };
}

impl_into_string!(ConnectionError, SessionError, FsError, TransferError, CancelError);
