// ── sfb-sftp / sftp module ────────────────────────────────────────────────────
//
// Remote-session and file-transfer core:
//   • Session lifecycle with key / password / keyboard-interactive auth
//   • FIFO session gate, with per-transfer sub-channels when available
//   • Directory listing with directories-first ordering
//   • Concurrent, cancellable, chunked downloads & uploads
//   • Token-keyed progress / terminal event stream
//   • libssh2 and in-memory remotes

pub mod channel;
pub mod dir_ops;
pub mod gate;
pub mod memory;
pub mod progress;
pub mod service;
pub mod session;
pub mod ssh;
pub mod transfer;
pub mod types;

pub use channel::{Connected, Connector, RemoteChannel};
pub use dir_ops::DirectoryLister;
pub use memory::MemoryRemote;
pub use progress::{ProgressChannel, Subscription};
pub use service::{SftpService, SftpServiceState};
pub use session::SessionManager;
pub use ssh::Ssh2Connector;
pub use transfer::TransferCoordinator;
pub use types::*;
