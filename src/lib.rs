//! # sfb-app
//!
//! Entry point for a view layer: builds the managed [`AppState`] from the
//! on-disk configuration, installs logging, and exposes the command wrappers
//! in [`commands`].

pub mod commands;
pub mod logging;

pub use sfb_core::config::CoreConfig;
pub use sfb_core::error::{CancelError, ConnectionError, FsError, SessionError, TransferError};
pub use sfb_sftp::sftp::{
    ConnectionConfig, Connector, DirectoryEntry, MemoryRemote, ProgressEvent, SessionInfo,
    SessionState, SftpService, SftpServiceState, Subscription, TransferOutcome, TransferSnapshot,
    TransferState, TransferToken,
};

use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Managed state shared by every command.
pub type AppState = SftpServiceState;

/// Config from `path`, or from the platform default location, or defaults.
pub fn load_config(path: Option<&Path>) -> CoreConfig {
    match path.map(Path::to_path_buf).or_else(CoreConfig::default_path) {
        Some(p) => CoreConfig::load_or_default(p),
        None => CoreConfig::default(),
    }
}

/// State backed by real SSH connections.
pub fn build_state(config: CoreConfig) -> AppState {
    SftpService::with_ssh(config)
}

/// State backed by any connector, e.g. [`MemoryRemote`] for demos and tests.
pub fn build_state_with(config: CoreConfig, connector: Arc<dyn Connector>) -> AppState {
    Arc::new(SftpService::new(config, connector))
}

/// Logging + config + state in one call.
pub fn bootstrap(config_path: Option<&Path>, log_format: logging::LogFormat) -> AppState {
    logging::init(log_format, "info");
    let config = load_config(config_path);
    info!(
        chunk_size = config.chunk_size,
        max_concurrent = config.max_concurrent_transfers,
        multiplexing = ?config.multiplexing,
        "core configured"
    );
    build_state(config)
}
