// ── Directory operations ─────────────────────────────────────────────────────

use crate::sftp::channel::RemoteEntry;
use crate::sftp::session::SessionManager;
use crate::sftp::types::DirectoryEntry;
use sfb_core::error::FsError;
use sfb_core::path::{file_name, join_remote, normalize_remote_path};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Path → ordered listing through the active session.
pub struct DirectoryLister {
    sessions: Arc<SessionManager>,
}

impl DirectoryLister {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }

    // ── List directory ───────────────────────────────────────────────────────

    /// Direct children of `path`, directories first, then by name
    /// (case-insensitive). `""` and `"."` list the remote home.
    pub async fn list(&self, path: &str) -> Result<Vec<DirectoryEntry>, FsError> {
        let gate = self.sessions.gate()?;
        let dir = self.resolve_dir(path);
        debug!("listing {}", dir);

        let query = dir.clone();
        let raw = gate
            .call(move |ch| ch.read_dir(&query))
            .await
            .map_err(FsError::from)
            .map_err(|e| {
                if e.is_session_loss() {
                    warn!("session lost while listing {}", dir);
                }
                e
            })?;

        let mut entries: Vec<DirectoryEntry> = raw
            .into_iter()
            .filter_map(|entry| to_directory_entry(&dir, entry))
            .collect();
        sort_entries(&mut entries);

        info!("listed {} ({} entries)", dir, entries.len());
        Ok(entries)
    }

    /// Normalise and, for the working directory, substitute the remote home
    /// so returned paths are absolute whenever the home is known.
    fn resolve_dir(&self, path: &str) -> String {
        let normalized = normalize_remote_path(path);
        if normalized == "." {
            if let Some(home) = self.sessions.remote_home() {
                return normalize_remote_path(&home);
            }
        }
        normalized
    }
}

fn to_directory_entry(dir: &str, entry: RemoteEntry) -> Option<DirectoryEntry> {
    // Some servers report paths instead of bare names.
    let name = file_name(&entry.name).to_string();
    if matches!(name.as_str(), "" | "." | ".." | "/") {
        return None;
    }
    Some(DirectoryEntry {
        path: join_remote(dir, &name),
        name,
        is_dir: entry.is_dir,
        size_bytes: if entry.is_dir {
            0
        } else {
            entry.size.unwrap_or(0)
        },
        modified_epoch_seconds: entry.modified.unwrap_or(0),
    })
}

// ── Sorting helper ───────────────────────────────────────────────────────────

fn sort_entries(entries: &mut [DirectoryEntry]) {
    // Stable: ties keep the server's order.
    entries.sort_by(|a, b| {
        // Directories first, always
        b.is_dir
            .cmp(&a.is_dir)
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });
}
