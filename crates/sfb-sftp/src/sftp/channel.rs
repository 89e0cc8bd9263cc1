// ── Remote channel abstraction ───────────────────────────────────────────────
//
// The rest of the crate only talks to an authenticated remote through these
// two traits. `ssh` implements them over libssh2, `memory` over an in-process
// tree. Both are blocking: a channel is owned by exactly one gate worker thread.

use crate::sftp::types::{AuthMethod, ConnectionConfig};
use sfb_core::error::{ConnectionError, FsError, SessionError};
use std::time::Duration;
use thiserror::Error;

pub type RemoteResult<T> = Result<T, RemoteError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("no such file or directory: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("is a directory: {0}")]
    IsADirectory(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("channel closed")]
    Closed,
    #[error("{0}")]
    Other(String),
}

impl From<RemoteError> for FsError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::NotFound(p) => FsError::PathNotFound(p),
            RemoteError::PermissionDenied(p) => FsError::PermissionDenied(p),
            RemoteError::IsADirectory(p) => FsError::IsADirectory(p),
            RemoteError::NotADirectory(p) => FsError::NotADirectory(p),
            RemoteError::Closed => FsError::Session(SessionError::SessionClosed),
            RemoteError::Other(msg) => FsError::Remote(msg),
        }
    }
}

/// Raw directory child as reported by the remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: Option<u64>,
    pub modified: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteStat {
    pub is_dir: bool,
    pub size: Option<u64>,
    pub modified: Option<u64>,
}

/// Handle of a remote file opened on a specific channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteHandle(pub u64);

pub trait RemoteChannel: Send {
    fn read_dir(&mut self, path: &str) -> RemoteResult<Vec<RemoteEntry>>;

    fn stat(&mut self, path: &str) -> RemoteResult<RemoteStat>;

    fn realpath(&mut self, path: &str) -> RemoteResult<String>;

    fn open_read(&mut self, path: &str) -> RemoteResult<RemoteHandle>;

    /// Create or truncate.
    fn open_write(&mut self, path: &str) -> RemoteResult<RemoteHandle>;

    /// Up to `max_len` bytes; an empty vec means end of file.
    fn read(&mut self, handle: RemoteHandle, max_len: usize) -> RemoteResult<Vec<u8>>;

    fn write(&mut self, handle: RemoteHandle, data: &[u8]) -> RemoteResult<()>;

    fn close(&mut self, handle: RemoteHandle);

    fn remove_file(&mut self, path: &str) -> RemoteResult<()>;

    /// False once the underlying connection is known to be gone.
    fn is_alive(&self) -> bool {
        true
    }

    /// Whether [`RemoteChannel::open_subchannel`] yields a channel that can be
    /// driven in parallel with this one.
    fn supports_multiplexing(&self) -> bool {
        false
    }

    fn open_subchannel(&mut self) -> RemoteResult<Box<dyn RemoteChannel>> {
        Err(RemoteError::Other("multiplexing not supported".into()))
    }

    /// Send a protocol-level keepalive; an error marks the channel dead.
    fn keepalive(&mut self) -> RemoteResult<()> {
        Ok(())
    }

    fn shutdown(&mut self) {}
}

/// Result of a successful handshake + authentication.
pub struct Connected {
    pub channel: Box<dyn RemoteChannel>,
    pub auth_method: AuthMethod,
}

pub trait Connector: Send + Sync {
    /// Blocking. Takes the config by value: the credentials it carries are
    /// dropped as soon as this returns.
    fn connect(
        &self,
        config: ConnectionConfig,
        timeout: Duration,
    ) -> Result<Connected, ConnectionError>;
}
