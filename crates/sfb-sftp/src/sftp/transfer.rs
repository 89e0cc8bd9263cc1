// ── Transfer engine – concurrent, cancellable, chunked transfers ─────────────
//
// Every transfer runs as its own tokio task. A semaphore bounds how many are
// active; the rest stay `Pending`. Cancellation is a cooperative flag polled
// between chunks. Each task publishes exactly one terminal event, and only
// after the record has reached its terminal state, so `cancel` can never race
// a second outcome in.

use crate::sftp::channel::{RemoteError, RemoteHandle};
use crate::sftp::gate::SessionGate;
use crate::sftp::progress::ProgressChannel;
use crate::sftp::session::SessionManager;
use crate::sftp::types::*;
use chrono::Utc;
use sfb_core::config::{CoreConfig, MultiplexingPolicy};
use sfb_core::error::{CancelError, FsError, SessionError, TransferError};
use sfb_core::path::normalize_remote_path;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct TransferRecord {
    snapshot: TransferSnapshot,
    cancel: CancellationToken,
}

struct TransferRequest {
    token: TransferToken,
    direction: TransferDirection,
    remote_path: String,
    local_path: PathBuf,
    cancel: CancellationToken,
}

struct Inner {
    sessions: Arc<SessionManager>,
    progress: ProgressChannel,
    records: Mutex<HashMap<TransferToken, TransferRecord>>,
    limiter: Arc<Semaphore>,
    chunk_size: usize,
    multiplexing: MultiplexingPolicy,
}

/// Starts, tracks and cancels downloads and uploads.
#[derive(Clone)]
pub struct TransferCoordinator {
    inner: Arc<Inner>,
}

impl TransferCoordinator {
    pub fn new(sessions: Arc<SessionManager>, progress: ProgressChannel, config: &CoreConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions,
                progress,
                records: Mutex::new(HashMap::new()),
                limiter: Arc::new(Semaphore::new(config.max_concurrent_transfers.max(1))),
                chunk_size: config.chunk_size.max(1),
                multiplexing: config.multiplexing,
            }),
        }
    }

    // ── Start ────────────────────────────────────────────────────────────────

    /// Returns immediately; the outcome arrives as a terminal event.
    pub fn start_download(&self, remote_path: &str, local_path: impl Into<PathBuf>) -> TransferToken {
        self.start(TransferDirection::Download, remote_path, local_path.into())
    }

    /// Returns immediately; the outcome arrives as a terminal event.
    pub fn start_upload(&self, local_path: impl Into<PathBuf>, remote_path: &str) -> TransferToken {
        self.start(TransferDirection::Upload, remote_path, local_path.into())
    }

    fn start(&self, direction: TransferDirection, remote_path: &str, local_path: PathBuf) -> TransferToken {
        let token = TransferToken::new();
        let cancel = CancellationToken::new();
        let remote_path = normalize_remote_path(remote_path);

        self.inner.records().insert(
            token,
            TransferRecord {
                snapshot: TransferSnapshot {
                    token,
                    direction,
                    remote_path: remote_path.clone(),
                    local_path: local_path.clone(),
                    state: TransferState::Pending,
                    bytes_transferred: 0,
                    total_bytes: None,
                    started_at: Utc::now(),
                    finished_at: None,
                    error: None,
                },
                cancel: cancel.clone(),
            },
        );
        info!(
            "transfer {} queued: {:?} {} <-> {}",
            token,
            direction,
            remote_path,
            local_path.display()
        );

        match self.inner.sessions.gate() {
            Ok(gate) => {
                let request = TransferRequest {
                    token,
                    direction,
                    remote_path,
                    local_path,
                    cancel,
                };
                let inner = self.inner.clone();
                tokio::spawn(async move {
                    // A panic in the body still has to yield a terminal event.
                    let body = tokio::spawn(inner.clone().drive(request, gate));
                    if let Err(join) = body.await {
                        let reason = if join.is_panic() {
                            "transfer task panicked"
                        } else {
                            "transfer task was cancelled by the runtime"
                        };
                        warn!("transfer {}: {}", token, reason);
                        inner.finish(token, Err(TransferError::Aborted(reason.into())));
                    }
                });
            }
            Err(e) => self.inner.finish(token, Err(TransferError::Session(e))),
        }
        token
    }

    // ── Cancel ───────────────────────────────────────────────────────────────

    /// Request cancellation. Takes effect at the next chunk boundary.
    pub fn cancel(&self, token: TransferToken) -> Result<(), CancelError> {
        let records = self.inner.records();
        match records.get(&token) {
            None => Err(CancelError::UnknownToken(token.to_string())),
            Some(r) if r.snapshot.state.is_terminal() => {
                Err(CancelError::AlreadyTerminal(token.to_string()))
            }
            Some(r) => {
                r.cancel.cancel();
                info!("transfer {} cancel requested", token);
                Ok(())
            }
        }
    }

    // ── Bookkeeping ──────────────────────────────────────────────────────────

    pub fn status(&self, token: TransferToken) -> Option<TransferSnapshot> {
        self.inner.records().get(&token).map(|r| r.snapshot.clone())
    }

    /// Every tracked transfer, oldest first.
    pub fn list(&self) -> Vec<TransferSnapshot> {
        let mut all: Vec<TransferSnapshot> = self
            .inner
            .records()
            .values()
            .map(|r| r.snapshot.clone())
            .collect();
        all.sort_by_key(|s| s.started_at);
        all
    }

    pub fn active_count(&self) -> usize {
        self.inner
            .records()
            .values()
            .filter(|r| r.snapshot.state == TransferState::InProgress)
            .count()
    }

    /// Forget terminal transfers. Returns how many were removed.
    pub fn clear_finished(&self) -> usize {
        let mut records = self.inner.records();
        let before = records.len();
        records.retain(|_, r| !r.snapshot.state.is_terminal());
        before - records.len()
    }
}

// ── Task body ────────────────────────────────────────────────────────────────

impl Inner {
    fn records(&self) -> MutexGuard<'_, HashMap<TransferToken, TransferRecord>> {
        self.records.lock().unwrap_or_else(|p| p.into_inner())
    }

    async fn drive(self: Arc<Self>, request: TransferRequest, gate: Arc<SessionGate>) {
        let token = request.token;
        let session_closed = gate.closed_token();

        let permit = tokio::select! {
            biased;
            _ = request.cancel.cancelled() => {
                self.finish(token, Err(TransferError::Cancelled));
                return;
            }
            _ = session_closed.cancelled() => {
                self.finish(token, Err(SessionError::SessionClosed.into()));
                return;
            }
            permit = self.limiter.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => {
                    self.finish(token, Err(SessionError::SessionClosed.into()));
                    return;
                }
            },
        };

        self.update(token, |s| s.state = TransferState::InProgress);

        let label: String = token.to_string().chars().take(8).collect();
        let lane = match self.multiplexing {
            MultiplexingPolicy::Auto => gate.open_subgate(&label).await,
            MultiplexingPolicy::Off => None,
        };
        let via: &SessionGate = lane.as_ref().unwrap_or(gate.as_ref());
        if lane.is_some() {
            debug!("transfer {} using its own sub-channel", token);
        }

        let result = match request.direction {
            TransferDirection::Download => {
                self.download(token, via, &request.remote_path, &request.local_path, &request.cancel)
                    .await
            }
            TransferDirection::Upload => {
                self.upload(token, via, &request.local_path, &request.remote_path, &request.cancel)
                    .await
            }
        };

        // Dropping the lane lets its worker drain queued cleanup, then stop.
        drop(lane);
        drop(permit);
        self.finish(token, result);
    }

    async fn download(
        &self,
        token: TransferToken,
        gate: &SessionGate,
        remote_path: &str,
        local_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64, TransferError> {
        let path = remote_path.to_string();
        let stat = gate.call(move |ch| ch.stat(&path)).await.map_err(fs_error)?;
        if stat.is_dir {
            return Err(TransferError::Fs(FsError::IsADirectory(remote_path.to_string())));
        }
        let total = stat.size;
        self.update(token, |s| s.total_bytes = total);

        let path = remote_path.to_string();
        let handle = gate.call(move |ch| ch.open_read(&path)).await.map_err(fs_error)?;
        let _remote = HandleGuard { gate, handle };

        let mut local = PartialFile::create(local_path).map_err(|e| {
            TransferError::LocalWriteFailed(format!("{}: {}", local_path.display(), e))
        })?;

        let chunk_size = self.chunk_size;
        let mut transferred: u64 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            let chunk = gate
                .call(move |ch| ch.read(handle, chunk_size))
                .await
                .map_err(|e| match e {
                    RemoteError::Closed => TransferError::Session(SessionError::SessionClosed),
                    other => TransferError::RemoteReadFailed(format!("{}: {}", remote_path, other)),
                })?;
            if chunk.is_empty() {
                break;
            }
            local.write_all(&chunk).map_err(|e| {
                TransferError::LocalWriteFailed(format!("{}: {}", local_path.display(), e))
            })?;
            transferred += chunk.len() as u64;
            self.report(token, transferred, total);
        }

        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        local.commit().map_err(|e| {
            TransferError::LocalWriteFailed(format!("{}: {}", local_path.display(), e))
        })?;
        Ok(transferred)
    }

    async fn upload(
        &self,
        token: TransferToken,
        gate: &SessionGate,
        local_path: &Path,
        remote_path: &str,
        cancel: &CancellationToken,
    ) -> Result<u64, TransferError> {
        let local_err = |e: std::io::Error| {
            TransferError::LocalReadFailed(format!("{}: {}", local_path.display(), e))
        };
        let mut local = File::open(local_path).map_err(local_err)?;
        let meta = local.metadata().map_err(local_err)?;
        if meta.is_dir() {
            return Err(TransferError::LocalReadFailed(format!(
                "{}: is a directory",
                local_path.display()
            )));
        }
        let total = Some(meta.len());
        self.update(token, |s| s.total_bytes = total);

        let path = remote_path.to_string();
        let handle = gate.call(move |ch| ch.open_write(&path)).await.map_err(fs_error)?;
        // Declared before the handle guard so the handle is closed first.
        let mut partial = PartialRemote {
            gate,
            path: remote_path.to_string(),
            committed: false,
        };
        let _remote = HandleGuard { gate, handle };

        let mut buf = vec![0u8; self.chunk_size];
        let mut transferred: u64 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            let n = local.read(&mut buf).map_err(local_err)?;
            if n == 0 {
                break;
            }
            let data = buf[..n].to_vec();
            gate.call(move |ch| ch.write(handle, &data))
                .await
                .map_err(|e| match e {
                    RemoteError::Closed => TransferError::Session(SessionError::SessionClosed),
                    other => TransferError::RemoteWriteFailed(format!("{}: {}", remote_path, other)),
                })?;
            transferred += n as u64;
            self.report(token, transferred, total);
        }

        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        partial.committed = true;
        Ok(transferred)
    }

    // ── Record updates & events ──────────────────────────────────────────────

    fn update(&self, token: TransferToken, f: impl FnOnce(&mut TransferSnapshot)) {
        if let Some(record) = self.records().get_mut(&token) {
            f(&mut record.snapshot);
        }
    }

    fn report(&self, token: TransferToken, bytes_transferred: u64, total_bytes: Option<u64>) {
        self.update(token, |s| s.bytes_transferred = bytes_transferred);
        self.progress.publish(ProgressEvent::Progress {
            token,
            bytes_transferred,
            total_bytes,
        });
    }

    /// Move the record to its terminal state, then publish the terminal event.
    fn finish(&self, token: TransferToken, result: Result<u64, TransferError>) {
        let outcome = TransferOutcome::from(result);
        {
            let mut records = self.records();
            if let Some(record) = records.get_mut(&token) {
                if record.snapshot.state.is_terminal() {
                    warn!("transfer {} already finished, dropping second outcome", token);
                    return;
                }
                let s = &mut record.snapshot;
                s.state = outcome.state();
                s.finished_at = Some(Utc::now());
                match &outcome {
                    TransferOutcome::Completed { bytes_transferred } => {
                        s.bytes_transferred = *bytes_transferred;
                    }
                    TransferOutcome::Failed { error } => s.error = Some(error.clone()),
                    TransferOutcome::Cancelled => {}
                }
            }
        }

        match &outcome {
            TransferOutcome::Completed { bytes_transferred } => {
                info!("transfer {} completed ({} bytes)", token, bytes_transferred)
            }
            TransferOutcome::Cancelled => info!("transfer {} cancelled", token),
            TransferOutcome::Failed { error } => warn!("transfer {} failed: {}", token, error),
        }
        self.progress.publish(ProgressEvent::Terminal { token, outcome });
    }
}

fn fs_error(e: RemoteError) -> TransferError {
    TransferError::from(FsError::from(e))
}

// ── Scoped resources ─────────────────────────────────────────────────────────

/// Closes the remote handle when the transfer leaves scope, however it ends.
struct HandleGuard<'a> {
    gate: &'a SessionGate,
    handle: RemoteHandle,
}

impl Drop for HandleGuard<'_> {
    fn drop(&mut self) {
        let handle = self.handle;
        self.gate.run_detached(move |ch| ch.close(handle));
    }
}

/// Removes a partially written remote file unless committed.
struct PartialRemote<'a> {
    gate: &'a SessionGate,
    path: String,
    committed: bool,
}

impl Drop for PartialRemote<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let path = std::mem::take(&mut self.path);
        self.gate.run_detached(move |ch| {
            if let Err(e) = ch.remove_file(&path) {
                debug!("could not remove partial upload {}: {}", path, e);
            }
        });
    }
}

/// Local download staged in a sibling `<name>.part` file. `commit` renames it
/// over the target; dropping it uncommitted removes only the staging file, so
/// an existing file at the target survives a failed or cancelled download.
struct PartialFile {
    target: PathBuf,
    staging: PathBuf,
    file: Option<File>,
    committed: bool,
}

impl PartialFile {
    fn create(target: &Path) -> std::io::Result<Self> {
        let staging = staging_path(target);
        let file = File::create(&staging)?;
        Ok(Self {
            target: target.to_path_buf(),
            staging,
            file: Some(file),
            committed: false,
        })
    }

    fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self.file.as_mut() {
            Some(f) => f.write_all(data),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "file already closed",
            )),
        }
    }

    fn commit(mut self) -> std::io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
            file.sync_all()?;
        }
        std::fs::rename(&self.staging, &self.target)?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        // Close before removing; required on Windows.
        drop(self.file.take());
        if !self.committed {
            if let Err(e) = std::fs::remove_file(&self.staging) {
                debug!("could not remove partial file {}: {}", self.staging.display(), e);
            }
        }
    }
}

fn staging_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    target.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sftp::dir_ops::DirectoryLister;
    use crate::sftp::memory::MemoryRemote;
    use std::time::Duration;

    const PAYLOAD_LEN: usize = 10 * 1024;

    fn payload() -> Vec<u8> {
        (0..PAYLOAD_LEN).map(|i| (i % 251) as u8).collect()
    }

    fn remote() -> MemoryRemote {
        MemoryRemote::new()
            .with_user("u", "p")
            .with_home("/home/u")
            .with_dir("/home/u/docs")
            .with_file("/home/u/big.bin", payload())
    }

    fn small_chunks() -> CoreConfig {
        CoreConfig {
            chunk_size: 1024,
            ..CoreConfig::default()
        }
    }

    async fn coordinator(remote: &MemoryRemote, config: &CoreConfig) -> (TransferCoordinator, ProgressChannel) {
        let sessions = Arc::new(SessionManager::new(Arc::new(remote.clone()), config));
        sessions
            .connect(ConnectionConfig::with_password("h", "u", "p"))
            .await
            .unwrap();
        let progress = ProgressChannel::new(config.progress_buffer, config.terminal_retention);
        (
            TransferCoordinator::new(sessions, progress.clone(), config),
            progress,
        )
    }

    async fn wait(progress: &ProgressChannel, token: TransferToken) -> TransferOutcome {
        let mut sub = progress.subscribe_token(token);
        tokio::time::timeout(Duration::from_secs(5), sub.wait_terminal(token))
            .await
            .unwrap()
            .unwrap()
    }

    #[test]
    fn partial_file_removed_unless_committed() {
        let dir = tempfile::tempdir().unwrap();
        let dropped = dir.path().join("dropped.bin");
        let kept = dir.path().join("kept.bin");

        let mut f = PartialFile::create(&dropped).unwrap();
        f.write_all(b"half").unwrap();
        assert!(staging_path(&dropped).exists());
        assert!(!dropped.exists());
        drop(f);
        assert!(!dropped.exists());
        assert!(!staging_path(&dropped).exists());

        let mut f = PartialFile::create(&kept).unwrap();
        f.write_all(b"whole").unwrap();
        f.commit().unwrap();
        assert_eq!(std::fs::read(&kept).unwrap(), b"whole");
        assert!(!staging_path(&kept).exists());
    }

    #[test]
    fn staging_path_is_a_sibling() {
        let target = Path::new("/tmp/dl/report.csv");
        assert_eq!(staging_path(target), PathBuf::from("/tmp/dl/report.csv.part"));
    }

    #[tokio::test]
    async fn failed_download_keeps_existing_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("keep.txt");
        std::fs::write(&local, b"earlier contents").unwrap();
        let remote = remote().fail_reads_at("/home/u/big.bin", 2048);
        let (transfers, progress) = coordinator(&remote, &small_chunks()).await;

        let token = transfers.start_download("/home/u/big.bin", &local);
        assert!(matches!(
            wait(&progress, token).await,
            TransferOutcome::Failed {
                error: TransferError::RemoteReadFailed(_)
            }
        ));
        assert_eq!(std::fs::read(&local).unwrap(), b"earlier contents");
        assert!(!staging_path(&local).exists());
    }

    #[tokio::test]
    async fn completed_download_replaces_existing_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("big.bin");
        std::fs::write(&local, b"stale").unwrap();
        let (transfers, progress) = coordinator(&remote(), &small_chunks()).await;

        let token = transfers.start_download("/home/u/big.bin", &local);
        assert!(matches!(
            wait(&progress, token).await,
            TransferOutcome::Completed { .. }
        ));
        assert_eq!(std::fs::read(&local).unwrap(), payload());
    }

    #[tokio::test]
    async fn panicking_transfer_still_reports_one_terminal_event() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("up.bin");
        std::fs::write(&local, payload()).unwrap();
        // Bypasses `validate`: the buffer allocation panics inside the task.
        let config = CoreConfig {
            chunk_size: usize::MAX,
            ..CoreConfig::default()
        };
        let (transfers, progress) = coordinator(&remote(), &config).await;
        let mut sub = progress.subscribe();

        let token = transfers.start_upload(&local, "/home/u/up.bin");
        assert!(matches!(
            wait(&progress, token).await,
            TransferOutcome::Failed {
                error: TransferError::Aborted(_)
            }
        ));
        let snapshot = transfers.status(token).unwrap();
        assert_eq!(snapshot.state, TransferState::Failed);
        assert!(snapshot.finished_at.is_some());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut terminals = 0;
        while let Some(ev) = sub.try_recv() {
            if ev.is_terminal() {
                terminals += 1;
            }
        }
        assert_eq!(terminals, 1);
    }

    #[tokio::test]
    async fn download_completes_in_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("big.bin");
        let (transfers, progress) = coordinator(&remote(), &small_chunks()).await;
        let mut sub = progress.subscribe();

        let token = transfers.start_download("/home/u/big.bin", &local);
        let outcome = wait(&progress, token).await;
        assert_eq!(
            outcome,
            TransferOutcome::Completed {
                bytes_transferred: PAYLOAD_LEN as u64
            }
        );
        assert_eq!(std::fs::read(&local).unwrap(), payload());

        let mut last = 0;
        let mut progress_events = 0;
        while let Some(ev) = sub.try_recv() {
            if let ProgressEvent::Progress { bytes_transferred, total_bytes, .. } = ev {
                assert!(bytes_transferred >= last);
                assert_eq!(total_bytes, Some(PAYLOAD_LEN as u64));
                last = bytes_transferred;
                progress_events += 1;
            }
        }
        assert_eq!(progress_events, 10);

        let snapshot = transfers.status(token).unwrap();
        assert_eq!(snapshot.state, TransferState::Completed);
        assert!(snapshot.finished_at.is_some());
    }

    #[tokio::test]
    async fn immediate_cancel_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("big.bin");
        let remote = remote().with_chunk_delay(Duration::from_millis(20));
        let (transfers, progress) = coordinator(&remote, &small_chunks()).await;

        let token = transfers.start_download("/home/u/big.bin", &local);
        transfers.cancel(token).unwrap();
        assert_eq!(wait(&progress, token).await, TransferOutcome::Cancelled);
        assert!(!local.exists());
        assert_eq!(transfers.status(token).unwrap().state, TransferState::Cancelled);
    }

    #[tokio::test]
    async fn mid_stream_cancel_stops_at_chunk_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("big.bin");
        let remote = remote().with_chunk_delay(Duration::from_millis(30));
        let (transfers, progress) = coordinator(&remote, &small_chunks()).await;
        let mut sub = progress.subscribe();

        let token = transfers.start_download("/home/u/big.bin", &local);
        // Wait for the first chunk to land.
        loop {
            match sub.recv().await.unwrap() {
                ProgressEvent::Progress { .. } => break,
                ev => panic!("unexpected {:?}", ev),
            }
        }
        transfers.cancel(token).unwrap();
        assert_eq!(wait(&progress, token).await, TransferOutcome::Cancelled);
        assert!(!local.exists());
    }

    #[tokio::test]
    async fn cancel_after_terminal_is_rejected_without_change() {
        let dir = tempfile::tempdir().unwrap();
        let (transfers, progress) = coordinator(&remote(), &small_chunks()).await;
        let token = transfers.start_download("/home/u/big.bin", dir.path().join("x"));
        wait(&progress, token).await;

        let before = transfers.status(token).unwrap();
        assert_eq!(
            transfers.cancel(token),
            Err(CancelError::AlreadyTerminal(token.to_string()))
        );
        let after = transfers.status(token).unwrap();
        assert_eq!(before.state, after.state);
        assert_eq!(before.finished_at, after.finished_at);
    }

    #[tokio::test]
    async fn unknown_token_cannot_be_cancelled() {
        let (transfers, _progress) = coordinator(&remote(), &small_chunks()).await;
        let token = TransferToken::new();
        assert_eq!(
            transfers.cancel(token),
            Err(CancelError::UnknownToken(token.to_string()))
        );
    }

    #[tokio::test]
    async fn missing_remote_file_fails_without_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("nope");
        let (transfers, progress) = coordinator(&remote(), &small_chunks()).await;
        let token = transfers.start_download("/home/u/nope", &local);
        match wait(&progress, token).await {
            TransferOutcome::Failed {
                error: TransferError::Fs(FsError::PathNotFound(_)),
            } => {}
            other => panic!("unexpected {:?}", other),
        }
        assert!(!local.exists());
    }

    #[tokio::test]
    async fn directory_cannot_be_downloaded() {
        let dir = tempfile::tempdir().unwrap();
        let (transfers, progress) = coordinator(&remote(), &small_chunks()).await;
        let token = transfers.start_download("/home/u/docs", dir.path().join("docs"));
        assert!(matches!(
            wait(&progress, token).await,
            TransferOutcome::Failed {
                error: TransferError::Fs(FsError::IsADirectory(_))
            }
        ));
    }

    #[tokio::test]
    async fn read_failure_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("big.bin");
        let remote = remote().fail_reads_at("/home/u/big.bin", 4096);
        let (transfers, progress) = coordinator(&remote, &small_chunks()).await;
        let token = transfers.start_download("/home/u/big.bin", &local);
        assert!(matches!(
            wait(&progress, token).await,
            TransferOutcome::Failed {
                error: TransferError::RemoteReadFailed(_)
            }
        ));
        assert!(!local.exists());
        assert_eq!(transfers.status(token).unwrap().bytes_transferred, 4096);
    }

    #[tokio::test]
    async fn unwritable_local_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("missing-dir").join("big.bin");
        let (transfers, progress) = coordinator(&remote(), &small_chunks()).await;
        let token = transfers.start_download("/home/u/big.bin", &local);
        assert!(matches!(
            wait(&progress, token).await,
            TransferOutcome::Failed {
                error: TransferError::LocalWriteFailed(_)
            }
        ));
    }

    #[tokio::test]
    async fn start_without_session_fails_with_not_connected() {
        let config = CoreConfig::default();
        let sessions = Arc::new(SessionManager::new(Arc::new(remote()), &config));
        let progress = ProgressChannel::new(8, 8);
        let transfers = TransferCoordinator::new(sessions, progress.clone(), &config);
        let token = transfers.start_download("/home/u/big.bin", "/tmp/never");
        assert_eq!(
            wait(&progress, token).await,
            TransferOutcome::Failed {
                error: TransferError::Session(SessionError::NotConnected)
            }
        );
    }

    #[tokio::test]
    async fn upload_writes_remote_file() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("up.bin");
        std::fs::write(&local, payload()).unwrap();
        let remote = remote();
        let (transfers, progress) = coordinator(&remote, &small_chunks()).await;

        let token = transfers.start_upload(&local, "/home/u/docs/up.bin");
        assert_eq!(
            wait(&progress, token).await,
            TransferOutcome::Completed {
                bytes_transferred: PAYLOAD_LEN as u64
            }
        );
        assert_eq!(remote.file("/home/u/docs/up.bin").unwrap(), payload());
    }

    #[tokio::test]
    async fn missing_local_file_fails_upload() {
        let dir = tempfile::tempdir().unwrap();
        let (transfers, progress) = coordinator(&remote(), &small_chunks()).await;
        let token = transfers.start_upload(dir.path().join("absent"), "/home/u/x");
        assert!(matches!(
            wait(&progress, token).await,
            TransferOutcome::Failed {
                error: TransferError::LocalReadFailed(_)
            }
        ));
    }

    #[tokio::test]
    async fn cancelled_upload_removes_remote_partial() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("up.bin");
        std::fs::write(&local, payload()).unwrap();
        let remote = remote().with_chunk_delay(Duration::from_millis(30));
        let (transfers, progress) = coordinator(&remote, &small_chunks()).await;
        let mut sub = progress.subscribe();

        let token = transfers.start_upload(&local, "/home/u/up.bin");
        while !matches!(sub.recv().await, Some(ProgressEvent::Progress { .. })) {}
        transfers.cancel(token).unwrap();
        assert_eq!(wait(&progress, token).await, TransferOutcome::Cancelled);

        // Cleanup is queued behind the transfer on the same session.
        let mut gone = false;
        for _ in 0..50 {
            if !remote.exists("/home/u/up.bin") {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(gone);
    }

    #[tokio::test]
    async fn concurrency_limit_keeps_extra_transfers_pending() {
        let dir = tempfile::tempdir().unwrap();
        let config = CoreConfig {
            chunk_size: 1024,
            max_concurrent_transfers: 1,
            ..CoreConfig::default()
        };
        let remote = remote().with_chunk_delay(Duration::from_millis(20));
        let (transfers, progress) = coordinator(&remote, &config).await;

        let first = transfers.start_download("/home/u/big.bin", dir.path().join("1"));
        let second = transfers.start_download("/home/u/big.bin", dir.path().join("2"));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(transfers.status(second).unwrap().state, TransferState::Pending);
        assert!(transfers.active_count() <= 1);

        wait(&progress, first).await;
        assert!(matches!(
            wait(&progress, second).await,
            TransferOutcome::Completed { .. }
        ));
    }

    #[tokio::test]
    async fn clear_finished_forgets_terminal_records() {
        let dir = tempfile::tempdir().unwrap();
        let (transfers, progress) = coordinator(&remote(), &small_chunks()).await;
        let token = transfers.start_download("/home/u/big.bin", dir.path().join("a"));
        wait(&progress, token).await;
        assert_eq!(transfers.list().len(), 1);
        assert_eq!(transfers.clear_finished(), 1);
        assert!(transfers.status(token).is_none());
        assert!(matches!(
            transfers.cancel(token),
            Err(CancelError::UnknownToken(_))
        ));
    }

    #[tokio::test]
    async fn multiplexed_downloads_use_sub_channels() {
        let dir = tempfile::tempdir().unwrap();
        let remote = remote().with_multiplexing(true);
        let (transfers, progress) = coordinator(&remote, &small_chunks()).await;
        let a = transfers.start_download("/home/u/big.bin", dir.path().join("a"));
        let b = transfers.start_download("/home/u/big.bin", dir.path().join("b"));
        assert!(matches!(wait(&progress, a).await, TransferOutcome::Completed { .. }));
        assert!(matches!(wait(&progress, b).await, TransferOutcome::Completed { .. }));
        assert_eq!(
            remote.ops().iter().filter(|op| op.starts_with("open_subchannel")).count(),
            2
        );
        assert_eq!(std::fs::read(dir.path().join("a")).unwrap(), payload());
    }

    #[tokio::test]
    async fn listing_is_not_queued_behind_multiplexed_download() {
        let dir = tempfile::tempdir().unwrap();
        let remote = remote()
            .with_multiplexing(true)
            .with_chunk_delay(Duration::from_millis(30));
        let config = small_chunks();
        let sessions = Arc::new(SessionManager::new(Arc::new(remote.clone()), &config));
        sessions
            .connect(ConnectionConfig::with_password("h", "u", "p"))
            .await
            .unwrap();
        let progress = ProgressChannel::new(config.progress_buffer, config.terminal_retention);
        let transfers = TransferCoordinator::new(sessions.clone(), progress.clone(), &config);
        let lister = DirectoryLister::new(sessions);
        let mut sub = progress.subscribe();

        let token = transfers.start_download("/home/u/big.bin", dir.path().join("big.bin"));
        while !matches!(sub.recv().await, Some(ProgressEvent::Progress { .. })) {}

        let entries = tokio::time::timeout(Duration::from_millis(200), lister.list("/home/u"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entries.len(), 2);

        // Most of the ten chunk reads are still outstanding.
        let snapshot = transfers.status(token).unwrap();
        assert_eq!(snapshot.state, TransferState::InProgress);
        assert!(snapshot.bytes_transferred < PAYLOAD_LEN as u64);

        assert!(matches!(wait(&progress, token).await, TransferOutcome::Completed { .. }));
        let ops = remote.ops();
        let listed_at = ops.iter().position(|op| op == "read_dir /home/u").unwrap();
        let final_read = ops
            .iter()
            .rposition(|op| op == "read /home/u/big.bin")
            .unwrap();
        assert!(listed_at < final_read);
    }
}
