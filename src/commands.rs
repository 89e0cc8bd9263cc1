// ── Command bindings for the view layer ──────────────────────────────────────
//
// Thin wrappers over `AppState` that delegate to the service. Errors are the
// typed core errors, which serialise as `{ kind, message }`.

use crate::AppState;
use futures::stream::{self, Stream};
use sfb_core::error::{CancelError, ConnectionError, FsError};
use sfb_sftp::sftp::*;

// ── Connection / session ─────────────────────────────────────────────────────

pub async fn connect(
    state: &AppState,
    config: ConnectionConfig,
) -> Result<SessionInfo, ConnectionError> {
    state.connect(config).await
}

pub async fn disconnect(state: &AppState) {
    state.disconnect().await
}

/// Disconnects, settles in-flight transfers and ends every event stream.
pub async fn shutdown(state: &AppState) {
    state.shutdown().await
}

pub async fn session_info(state: &AppState) -> Option<SessionInfo> {
    state.session_info()
}

// ── Browsing ─────────────────────────────────────────────────────────────────

pub async fn list_files(state: &AppState, path: String) -> Result<Vec<DirectoryEntry>, FsError> {
    state.list_directory(&path).await
}

// ── Transfers ────────────────────────────────────────────────────────────────

pub async fn download_file(state: &AppState, remote_path: String, local_path: String) -> TransferToken {
    state.download(&remote_path, local_path)
}

pub async fn upload_file(state: &AppState, local_path: String, remote_path: String) -> TransferToken {
    state.upload(local_path, &remote_path)
}

pub async fn cancel_download(state: &AppState, token: TransferToken) -> Result<(), CancelError> {
    state.cancel(token)
}

pub async fn transfer_status(state: &AppState, token: TransferToken) -> Option<TransferSnapshot> {
    state.transfer_status(token)
}

pub async fn list_transfers(state: &AppState) -> Vec<TransferSnapshot> {
    state.list_transfers()
}

pub async fn clear_finished_transfers(state: &AppState) -> usize {
    state.clear_finished_transfers()
}

// ── Events ───────────────────────────────────────────────────────────────────

pub fn subscribe(state: &AppState) -> Subscription {
    state.subscribe()
}

pub fn subscribe_token(state: &AppState, token: TransferToken) -> Subscription {
    state.subscribe_token(token)
}

/// Every event as a stream; the subscription ends when the stream is dropped.
pub fn progress_events(state: &AppState) -> impl Stream<Item = ProgressEvent> {
    into_stream(state.subscribe())
}

/// Events for one transfer, ending after its terminal event.
pub fn transfer_events(state: &AppState, token: TransferToken) -> impl Stream<Item = ProgressEvent> {
    stream::unfold(Some(state.subscribe_token(token)), |sub| async move {
        let mut sub = sub?;
        let event = sub.recv().await?;
        let next = if event.is_terminal() { None } else { Some(sub) };
        Some((event, next))
    })
}

fn into_stream(sub: Subscription) -> impl Stream<Item = ProgressEvent> {
    stream::unfold(sub, |mut sub| async move {
        let event = sub.recv().await?;
        Some((event, sub))
    })
}
