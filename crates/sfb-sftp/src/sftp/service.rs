// ── SftpService – the core behind the view layer ─────────────────────────────

use crate::sftp::channel::Connector;
use crate::sftp::dir_ops::DirectoryLister;
use crate::sftp::progress::{ProgressChannel, Subscription};
use crate::sftp::session::SessionManager;
use crate::sftp::ssh::Ssh2Connector;
use crate::sftp::transfer::TransferCoordinator;
use crate::sftp::types::*;
use sfb_core::config::CoreConfig;
use sfb_core::error::{CancelError, ConnectionError, FsError};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Managed state handed to command wrappers.
pub type SftpServiceState = Arc<SftpService>;

/// Wires the session manager, lister, transfer coordinator and progress
/// channel together around one connector.
pub struct SftpService {
    config: CoreConfig,
    sessions: Arc<SessionManager>,
    lister: DirectoryLister,
    transfers: TransferCoordinator,
    progress: ProgressChannel,
}

impl SftpService {
    pub fn new(config: CoreConfig, connector: Arc<dyn Connector>) -> Self {
        let sessions = Arc::new(SessionManager::new(connector, &config));
        let progress = ProgressChannel::new(config.progress_buffer, config.terminal_retention);
        let transfers = TransferCoordinator::new(sessions.clone(), progress.clone(), &config);
        let lister = DirectoryLister::new(sessions.clone());
        Self {
            config,
            sessions,
            lister,
            transfers,
            progress,
        }
    }

    /// Service talking to real SSH servers.
    pub fn with_ssh(config: CoreConfig) -> SftpServiceState {
        let connector = Arc::new(Ssh2Connector::new(&config));
        Arc::new(Self::new(config, connector))
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    // ── Session ──────────────────────────────────────────────────────────────

    pub async fn connect(&self, config: ConnectionConfig) -> Result<SessionInfo, ConnectionError> {
        self.sessions.connect(config).await
    }

    /// Always succeeds. In-flight work fails with `SessionClosed`.
    pub async fn disconnect(&self) {
        self.sessions.disconnect().await;
    }

    /// Disconnect, wait for every unfinished transfer to publish its terminal
    /// event, then close the progress channel so subscriptions run dry and end.
    pub async fn shutdown(&self) {
        let mut waiting = Vec::new();
        for snapshot in self.transfers.list() {
            if snapshot.state.is_terminal() {
                continue;
            }
            let sub = self.progress.subscribe_token(snapshot.token);
            // Re-check after subscribing: a terminal published before that is
            // already reflected in the record.
            let unfinished = self
                .transfers
                .status(snapshot.token)
                .map_or(false, |s| !s.state.is_terminal());
            if unfinished {
                waiting.push((snapshot.token, sub));
            }
        }
        info!(
            active = self.transfers.active_count(),
            unfinished = waiting.len(),
            "shutting down"
        );

        self.sessions.disconnect().await;
        for (token, mut sub) in waiting {
            sub.wait_terminal(token).await;
        }

        info!(
            subscribers = self.progress.subscriber_count(),
            "closing progress channel"
        );
        self.progress.close();
    }

    pub fn session_info(&self) -> Option<SessionInfo> {
        self.sessions.info()
    }

    pub fn session_state(&self) -> SessionState {
        self.sessions.state()
    }

    // ── Listing ──────────────────────────────────────────────────────────────

    pub async fn list_directory(&self, path: &str) -> Result<Vec<DirectoryEntry>, FsError> {
        self.lister.list(path).await
    }

    // ── Transfers ────────────────────────────────────────────────────────────

    pub fn download(&self, remote_path: &str, local_path: impl Into<PathBuf>) -> TransferToken {
        self.transfers.start_download(remote_path, local_path)
    }

    pub fn upload(&self, local_path: impl Into<PathBuf>, remote_path: &str) -> TransferToken {
        self.transfers.start_upload(local_path, remote_path)
    }

    pub fn cancel(&self, token: TransferToken) -> Result<(), CancelError> {
        self.transfers.cancel(token)
    }

    pub fn transfer_status(&self, token: TransferToken) -> Option<TransferSnapshot> {
        self.transfers.status(token)
    }

    pub fn list_transfers(&self) -> Vec<TransferSnapshot> {
        self.transfers.list()
    }

    pub fn clear_finished_transfers(&self) -> usize {
        let removed = self.transfers.clear_finished();
        if removed > 0 {
            info!("cleared {} finished transfers", removed);
        }
        removed
    }

    // ── Events ───────────────────────────────────────────────────────────────

    pub fn subscribe(&self) -> Subscription {
        self.progress.subscribe()
    }

    pub fn subscribe_token(&self, token: TransferToken) -> Subscription {
        self.progress.subscribe_token(token)
    }
}
