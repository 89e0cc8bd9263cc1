// ── MemoryRemote – in-process remote filesystem ──────────────────────────────
//
// A `Connector` + `RemoteChannel` pair over an in-memory tree. Behaves like a
// small SFTP server: it checks credentials, resolves `.` to the user's home,
// reports `.`/`..` in listings, and can be told to slow down, fail reads at a
// given offset, offer sub-channels or drop the connection.

use crate::sftp::channel::{
    Connected, Connector, RemoteChannel, RemoteEntry, RemoteError, RemoteHandle, RemoteResult,
    RemoteStat,
};
use crate::sftp::types::{AuthMethod, ConnectionConfig};
use sfb_core::error::ConnectionError;
use sfb_core::path::normalize_remote_path;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

#[derive(Debug, Clone)]
enum Node {
    Dir { modified: u64 },
    File { data: Vec<u8>, modified: u64 },
}

#[derive(Default)]
struct Shared {
    host: Option<String>,
    home: String,
    passwords: HashMap<String, String>,
    authorized_keys: HashMap<String, Vec<String>>,
    tree: BTreeMap<String, Node>,
    denied: Vec<String>,
    read_failures: HashMap<String, u64>,
    chunk_delay: Duration,
    connect_delay: Duration,
    multiplexing: bool,
    generation: u64,
    ops: Vec<String>,
    connections: usize,
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn parent_of(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

impl Shared {
    fn resolve(&self, path: &str) -> String {
        let normalized = normalize_remote_path(path);
        if normalized == "." {
            return self.home.clone();
        }
        if normalized.starts_with('/') {
            normalized
        } else {
            normalize_remote_path(&format!("{}/{}", self.home, normalized))
        }
    }

    fn is_denied(&self, path: &str) -> bool {
        self.denied
            .iter()
            .any(|d| path == d || path.starts_with(&format!("{}/", d.trim_end_matches('/'))))
    }

    fn insert_dir_all(&mut self, path: &str) {
        let mut current = Some(path.to_string());
        while let Some(p) = current {
            let parent = parent_of(&p).map(str::to_string);
            self.tree
                .entry(p)
                .or_insert(Node::Dir { modified: now_epoch() });
            current = parent;
        }
    }
}

/// In-memory remote. Cloning yields another handle to the same tree.
#[derive(Clone)]
pub struct MemoryRemote {
    shared: Arc<Mutex<Shared>>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        let mut shared = Shared {
            home: "/".to_string(),
            ..Default::default()
        };
        shared.insert_dir_all("/");
        Self {
            shared: Arc::new(Mutex::new(shared)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|p| p.into_inner())
    }

    // ── Builder ──────────────────────────────────────────────────────────────

    /// Only accept connections addressed to `host`.
    pub fn with_host(self, host: &str) -> Self {
        self.lock().host = Some(host.to_string());
        self
    }

    pub fn with_user(self, username: &str, password: &str) -> Self {
        self.lock()
            .passwords
            .insert(username.to_string(), password.to_string());
        self
    }

    /// Accept key authentication for `username` with the key at `key_path`.
    pub fn with_authorized_key(self, username: &str, key_path: &str) -> Self {
        self.lock()
            .authorized_keys
            .entry(username.to_string())
            .or_default()
            .push(key_path.to_string());
        self
    }

    pub fn with_home(self, home: &str) -> Self {
        let home = normalize_remote_path(home);
        {
            let mut s = self.lock();
            s.insert_dir_all(&home);
            s.home = home;
        }
        self
    }

    pub fn with_dir(self, path: &str) -> Self {
        let path = normalize_remote_path(path);
        self.lock().insert_dir_all(&path);
        self
    }

    pub fn with_file(self, path: &str, data: impl Into<Vec<u8>>) -> Self {
        let path = normalize_remote_path(path);
        {
            let mut s = self.lock();
            if let Some(parent) = parent_of(&path) {
                let parent = parent.to_string();
                s.insert_dir_all(&parent);
            }
            s.tree.insert(
                path,
                Node::File {
                    data: data.into(),
                    modified: now_epoch(),
                },
            );
        }
        self
    }

    /// Every operation on `path` or below it fails with `PermissionDenied`.
    pub fn deny(self, path: &str) -> Self {
        self.lock().denied.push(normalize_remote_path(path));
        self
    }

    /// Reads of `path` fail once the read position reaches `offset`.
    pub fn fail_reads_at(self, path: &str, offset: u64) -> Self {
        self.lock()
            .read_failures
            .insert(normalize_remote_path(path), offset);
        self
    }

    /// Sleep this long inside every chunk read / write.
    pub fn with_chunk_delay(self, delay: Duration) -> Self {
        self.lock().chunk_delay = delay;
        self
    }

    /// Sleep this long before answering a connection attempt.
    pub fn with_connect_delay(self, delay: Duration) -> Self {
        self.lock().connect_delay = delay;
        self
    }

    pub fn with_multiplexing(self, enabled: bool) -> Self {
        self.lock().multiplexing = enabled;
        self
    }

    // ── Inspection ───────────────────────────────────────────────────────────

    /// Operations in the order they reached the remote, e.g. `read_dir /home/u`.
    pub fn ops(&self) -> Vec<String> {
        self.lock().ops.clone()
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        match self.lock().tree.get(&normalize_remote_path(path)) {
            Some(Node::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.lock().tree.contains_key(&normalize_remote_path(path))
    }

    /// Successful connections so far.
    pub fn connections(&self) -> usize {
        self.lock().connections
    }

    /// Drop every open channel as if the network went away.
    pub fn sever(&self) {
        self.lock().generation += 1;
    }

    fn open_channel(&self) -> MemoryChannel {
        let generation = self.lock().generation;
        MemoryChannel {
            remote: self.clone(),
            generation,
            handles: HashMap::new(),
            next_handle: 1,
        }
    }
}

impl Connector for MemoryRemote {
    fn connect(
        &self,
        config: ConnectionConfig,
        timeout: Duration,
    ) -> Result<Connected, ConnectionError> {
        let (delay, host) = {
            let s = self.lock();
            (s.connect_delay, s.host.clone())
        };
        if !delay.is_zero() {
            if delay >= timeout {
                std::thread::sleep(timeout);
                return Err(ConnectionError::Timeout(format!(
                    "no answer from {} within {:?}",
                    config.address(),
                    timeout
                )));
            }
            std::thread::sleep(delay);
        }

        if let Some(expected) = host {
            if expected != config.host {
                return Err(ConnectionError::NetworkUnreachable(format!(
                    "host {} is unreachable",
                    config.host
                )));
            }
        }

        let auth_method = {
            let mut s = self.lock();
            let key_ok = config.usable_key_path().map_or(false, |k| {
                s.authorized_keys
                    .get(&config.username)
                    .map_or(false, |keys| keys.iter().any(|a| a == k))
            });
            let password_ok = config.usable_password().map_or(false, |p| {
                s.passwords.get(&config.username).map(String::as_str) == Some(p)
            });
            let method = if key_ok {
                AuthMethod::PrivateKey
            } else if password_ok {
                AuthMethod::Password
            } else {
                return Err(ConnectionError::AuthFailed(format!(
                    "authentication failed for {}",
                    config.username
                )));
            };
            s.connections += 1;
            method
        };

        debug!("memory remote: {} authenticated", config.username);
        Ok(Connected {
            channel: Box::new(self.open_channel()),
            auth_method,
        })
    }
}

// ── Channel ──────────────────────────────────────────────────────────────────

enum OpenFile {
    Read { path: String, pos: u64 },
    Write { path: String },
}

pub struct MemoryChannel {
    remote: MemoryRemote,
    generation: u64,
    handles: HashMap<u64, OpenFile>,
    next_handle: u64,
}

impl MemoryChannel {
    /// Lock the tree, failing with `Closed` once the remote was severed, and
    /// record `op` in the op log.
    fn enter(&self, op: &str, path: &str) -> RemoteResult<MutexGuard<'_, Shared>> {
        let mut s = self.remote.lock();
        if s.generation != self.generation {
            return Err(RemoteError::Closed);
        }
        s.ops.push(format!("{} {}", op, path));
        Ok(s)
    }

    fn chunk_delay(&self) {
        let delay = self.remote.lock().chunk_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }

    fn insert_handle(&mut self, file: OpenFile) -> RemoteHandle {
        let id = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(id, file);
        RemoteHandle(id)
    }
}

impl RemoteChannel for MemoryChannel {
    fn read_dir(&mut self, path: &str) -> RemoteResult<Vec<RemoteEntry>> {
        let s = self.enter("read_dir", path)?;
        let dir = s.resolve(path);
        if s.is_denied(&dir) {
            return Err(RemoteError::PermissionDenied(dir));
        }
        match s.tree.get(&dir) {
            None => return Err(RemoteError::NotFound(dir)),
            Some(Node::File { .. }) => return Err(RemoteError::NotADirectory(dir)),
            Some(Node::Dir { .. }) => {}
        }

        let mut entries = vec![
            RemoteEntry {
                name: ".".into(),
                is_dir: true,
                size: None,
                modified: None,
            },
            RemoteEntry {
                name: "..".into(),
                is_dir: true,
                size: None,
                modified: None,
            },
        ];
        for (child, node) in s.tree.iter() {
            if child == &dir || parent_of(child) != Some(dir.as_str()) {
                continue;
            }
            let name = child.rsplit('/').next().unwrap_or(child).to_string();
            entries.push(match node {
                Node::Dir { modified } => RemoteEntry {
                    name,
                    is_dir: true,
                    size: Some(0),
                    modified: Some(*modified),
                },
                Node::File { data, modified } => RemoteEntry {
                    name,
                    is_dir: false,
                    size: Some(data.len() as u64),
                    modified: Some(*modified),
                },
            });
        }
        Ok(entries)
    }

    fn stat(&mut self, path: &str) -> RemoteResult<RemoteStat> {
        let s = self.enter("stat", path)?;
        let resolved = s.resolve(path);
        if s.is_denied(&resolved) {
            return Err(RemoteError::PermissionDenied(resolved));
        }
        match s.tree.get(&resolved) {
            Some(Node::Dir { modified }) => Ok(RemoteStat {
                is_dir: true,
                size: None,
                modified: Some(*modified),
            }),
            Some(Node::File { data, modified }) => Ok(RemoteStat {
                is_dir: false,
                size: Some(data.len() as u64),
                modified: Some(*modified),
            }),
            None => Err(RemoteError::NotFound(resolved)),
        }
    }

    fn realpath(&mut self, path: &str) -> RemoteResult<String> {
        let s = self.enter("realpath", path)?;
        let resolved = s.resolve(path);
        if s.tree.contains_key(&resolved) {
            Ok(resolved)
        } else {
            Err(RemoteError::NotFound(resolved))
        }
    }

    fn open_read(&mut self, path: &str) -> RemoteResult<RemoteHandle> {
        let resolved = {
            let s = self.enter("open_read", path)?;
            let resolved = s.resolve(path);
            if s.is_denied(&resolved) {
                return Err(RemoteError::PermissionDenied(resolved));
            }
            match s.tree.get(&resolved) {
                None => return Err(RemoteError::NotFound(resolved)),
                Some(Node::Dir { .. }) => return Err(RemoteError::IsADirectory(resolved)),
                Some(Node::File { .. }) => resolved,
            }
        };
        Ok(self.insert_handle(OpenFile::Read {
            path: resolved,
            pos: 0,
        }))
    }

    fn open_write(&mut self, path: &str) -> RemoteResult<RemoteHandle> {
        let resolved = {
            let mut s = self.enter("open_write", path)?;
            let resolved = s.resolve(path);
            if s.is_denied(&resolved) {
                return Err(RemoteError::PermissionDenied(resolved));
            }
            match parent_of(&resolved).map(|p| s.tree.get(p)) {
                Some(Some(Node::Dir { .. })) => {}
                Some(Some(Node::File { .. })) => {
                    return Err(RemoteError::NotADirectory(resolved));
                }
                _ => return Err(RemoteError::NotFound(resolved)),
            }
            if let Some(Node::Dir { .. }) = s.tree.get(&resolved) {
                return Err(RemoteError::IsADirectory(resolved));
            }
            s.tree.insert(
                resolved.clone(),
                Node::File {
                    data: Vec::new(),
                    modified: now_epoch(),
                },
            );
            resolved
        };
        Ok(self.insert_handle(OpenFile::Write { path: resolved }))
    }

    fn read(&mut self, handle: RemoteHandle, max_len: usize) -> RemoteResult<Vec<u8>> {
        self.chunk_delay();
        let (path, pos) = match self.handles.get(&handle.0) {
            Some(OpenFile::Read { path, pos }) => (path.clone(), *pos),
            _ => return Err(RemoteError::Other(format!("bad read handle {}", handle.0))),
        };
        let chunk = {
            let s = self.enter("read", &path)?;
            if let Some(fail_at) = s.read_failures.get(&path) {
                if pos >= *fail_at {
                    return Err(RemoteError::Other(format!("read error in {} at {}", path, pos)));
                }
            }
            match s.tree.get(&path) {
                Some(Node::File { data, .. }) => {
                    let start = (pos as usize).min(data.len());
                    let end = start.saturating_add(max_len).min(data.len());
                    data[start..end].to_vec()
                }
                _ => return Err(RemoteError::NotFound(path)),
            }
        };
        if let Some(OpenFile::Read { pos, .. }) = self.handles.get_mut(&handle.0) {
            *pos += chunk.len() as u64;
        }
        Ok(chunk)
    }

    fn write(&mut self, handle: RemoteHandle, data: &[u8]) -> RemoteResult<()> {
        self.chunk_delay();
        let path = match self.handles.get(&handle.0) {
            Some(OpenFile::Write { path }) => path.clone(),
            _ => return Err(RemoteError::Other(format!("bad write handle {}", handle.0))),
        };
        let mut s = self.enter("write", &path)?;
        match s.tree.get_mut(&path) {
            Some(Node::File { data: content, modified }) => {
                content.extend_from_slice(data);
                *modified = now_epoch();
                Ok(())
            }
            _ => Err(RemoteError::NotFound(path)),
        }
    }

    fn close(&mut self, handle: RemoteHandle) {
        if let Some(file) = self.handles.remove(&handle.0) {
            let path = match file {
                OpenFile::Read { path, .. } | OpenFile::Write { path } => path,
            };
            if let Err(e) = self.enter("close", &path) {
                debug!("close {} on dead channel: {}", path, e);
            }
        }
    }

    fn remove_file(&mut self, path: &str) -> RemoteResult<()> {
        let mut s = self.enter("remove", path)?;
        let resolved = s.resolve(path);
        match s.tree.get(&resolved) {
            Some(Node::File { .. }) => {
                s.tree.remove(&resolved);
                Ok(())
            }
            Some(Node::Dir { .. }) => Err(RemoteError::IsADirectory(resolved)),
            None => Err(RemoteError::NotFound(resolved)),
        }
    }

    fn is_alive(&self) -> bool {
        self.remote.lock().generation == self.generation
    }

    fn supports_multiplexing(&self) -> bool {
        self.remote.lock().multiplexing
    }

    fn open_subchannel(&mut self) -> RemoteResult<Box<dyn RemoteChannel>> {
        drop(self.enter("open_subchannel", "")?);
        if !self.supports_multiplexing() {
            return Err(RemoteError::Other("multiplexing disabled".into()));
        }
        let mut sub = self.remote.open_channel();
        sub.generation = self.generation;
        Ok(Box::new(sub))
    }
}
