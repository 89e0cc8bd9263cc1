//! # sfb-core
//!
//! Shared building blocks for the remote file browser:
//!   • `error`: typed error taxonomy returned to the view layer
//!   • `config`: transfer / connection policy loaded from JSON
//!   • `path`: remote path normalisation
//!   • `diagnostics`: DNS + TCP reachability probes used before the SSH handshake

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod path;

pub use config::{CoreConfig, MultiplexingPolicy};
pub use error::{CancelError, ConnectionError, FsError, SessionError, TransferError};
