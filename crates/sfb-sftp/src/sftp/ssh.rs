// ── libssh2-backed connector & channel ───────────────────────────────────────

use crate::sftp::channel::{
    Connected, Connector, RemoteChannel, RemoteEntry, RemoteError, RemoteHandle, RemoteResult,
    RemoteStat,
};
use crate::sftp::types::{AuthMethod, ConnectionConfig};
use sfb_core::config::CoreConfig;
use sfb_core::diagnostics::{open_tcp, summarize};
use sfb_core::error::ConnectionError;
use ssh2::{ErrorCode, Session, Sftp};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

// libssh2 session-level codes after which the transport is gone.
const LIBSSH2_ERROR_SOCKET_SEND: i32 = -7;
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;
const LIBSSH2_ERROR_SOCKET_DISCONNECT: i32 = -13;
const LIBSSH2_ERROR_CHANNEL_CLOSED: i32 = -26;
const LIBSSH2_ERROR_SOCKET_TIMEOUT: i32 = -30;
const LIBSSH2_ERROR_SOCKET_RECV: i32 = -43;

// SFTP status codes.
const SSH_FX_NO_SUCH_FILE: i32 = 2;
const SSH_FX_PERMISSION_DENIED: i32 = 3;
const SSH_FX_NO_SUCH_PATH: i32 = 10;
const SSH_FX_NOT_A_DIRECTORY: i32 = 19;
const SSH_FX_FILE_IS_A_DIRECTORY: i32 = 24;

fn is_transport_loss(code: ErrorCode) -> bool {
    matches!(
        code,
        ErrorCode::Session(
            LIBSSH2_ERROR_SOCKET_SEND
                | LIBSSH2_ERROR_TIMEOUT
                | LIBSSH2_ERROR_SOCKET_DISCONNECT
                | LIBSSH2_ERROR_CHANNEL_CLOSED
                | LIBSSH2_ERROR_SOCKET_TIMEOUT
                | LIBSSH2_ERROR_SOCKET_RECV
        )
    )
}

fn classify(err: &ssh2::Error, path: &str) -> RemoteError {
    match err.code() {
        ErrorCode::SFTP(SSH_FX_NO_SUCH_FILE | SSH_FX_NO_SUCH_PATH) => {
            RemoteError::NotFound(path.to_string())
        }
        ErrorCode::SFTP(SSH_FX_PERMISSION_DENIED) => RemoteError::PermissionDenied(path.to_string()),
        ErrorCode::SFTP(SSH_FX_NOT_A_DIRECTORY) => RemoteError::NotADirectory(path.to_string()),
        ErrorCode::SFTP(SSH_FX_FILE_IS_A_DIRECTORY) => RemoteError::IsADirectory(path.to_string()),
        code if is_transport_loss(code) => RemoteError::Closed,
        _ => RemoteError::Other(format!("{}: {}", path, err)),
    }
}

fn classify_io(err: &std::io::Error, path: &str) -> RemoteError {
    if let Some(inner) = err.get_ref().and_then(|e| e.downcast_ref::<ssh2::Error>()) {
        return classify(inner, path);
    }
    match err.kind() {
        std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::NotConnected => RemoteError::Closed,
        _ => RemoteError::Other(format!("{}: {}", path, err)),
    }
}

// ── Connector ────────────────────────────────────────────────────────────────

/// Opens real SSH sessions: TCP probe, handshake, authentication, SFTP.
pub struct Ssh2Connector {
    keepalive_interval_secs: u64,
}

impl Ssh2Connector {
    pub fn new(config: &CoreConfig) -> Self {
        Self {
            keepalive_interval_secs: config.keepalive_interval_secs,
        }
    }
}

impl Connector for Ssh2Connector {
    fn connect(
        &self,
        config: ConnectionConfig,
        timeout: Duration,
    ) -> Result<Connected, ConnectionError> {
        let mut steps = Vec::new();
        let tcp = open_tcp(&config.host, config.port, timeout, &mut steps).map_err(|e| {
            debug!("probe {}: {}", config.address(), summarize(&steps));
            e
        })?;
        debug!("probe {}: {}", config.address(), summarize(&steps));

        let mut session = Session::new().map_err(|e| {
            ConnectionError::NetworkUnreachable(format!("failed to create SSH session: {}", e))
        })?;
        session.set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);
        session.set_tcp_stream(tcp);
        session.handshake().map_err(|e| {
            if matches!(e.code(), ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT | LIBSSH2_ERROR_SOCKET_TIMEOUT)) {
                ConnectionError::Timeout(format!("SSH handshake with {} timed out", config.address()))
            } else {
                ConnectionError::NetworkUnreachable(format!(
                    "SSH handshake with {} failed: {}",
                    config.address(),
                    e
                ))
            }
        })?;

        let auth_method = authenticate(&session, &config)?;
        info!("authenticated to {} via {:?}", config.address(), auth_method);
        // Credentials are not needed past this point.
        drop(config);

        // Transfers have no deadline; only the handshake does.
        session.set_timeout(0);
        if self.keepalive_interval_secs > 0 {
            session.set_keepalive(true, self.keepalive_interval_secs.min(u32::MAX as u64) as u32);
        }

        let sftp = session.sftp().map_err(|e| {
            ConnectionError::NetworkUnreachable(format!("SFTP subsystem unavailable: {}", e))
        })?;

        Ok(Connected {
            channel: Box::new(Ssh2Channel::new(session, sftp)),
            auth_method,
        })
    }
}

// ── Authentication helpers ───────────────────────────────────────────────────

struct PasswordPrompt<'a> {
    password: &'a str,
}

impl ssh2::KeyboardInteractivePrompt for PasswordPrompt<'_> {
    fn prompt(
        &mut self,
        _username: &str,
        _instructions: &str,
        prompts: &[ssh2::Prompt],
    ) -> Vec<String> {
        prompts.iter().map(|_| self.password.to_string()).collect()
    }
}

/// Key first (when given), then password, then keyboard-interactive with the
/// same password.
fn authenticate(session: &Session, config: &ConnectionConfig) -> Result<AuthMethod, ConnectionError> {
    let user = config.username.as_str();
    let mut failures = Vec::new();

    if let Some(key_path) = config.usable_key_path() {
        match session.userauth_pubkey_file(user, None, Path::new(key_path), config.usable_passphrase()) {
            Ok(()) if session.authenticated() => return Ok(AuthMethod::PrivateKey),
            Ok(()) => failures.push("public key not accepted".to_string()),
            Err(e) => failures.push(format!("public key: {}", e)),
        }
    }

    if let Some(password) = config.usable_password() {
        match session.userauth_password(user, password) {
            Ok(()) if session.authenticated() => return Ok(AuthMethod::Password),
            Ok(()) => failures.push("password not accepted".to_string()),
            Err(e) => failures.push(format!("password: {}", e)),
        }

        let mut prompt = PasswordPrompt { password };
        match session.userauth_keyboard_interactive(user, &mut prompt) {
            Ok(()) if session.authenticated() => return Ok(AuthMethod::KeyboardInteractive),
            Ok(()) => failures.push("keyboard-interactive not accepted".to_string()),
            Err(e) => failures.push(format!("keyboard-interactive: {}", e)),
        }
    }

    Err(ConnectionError::AuthFailed(format!(
        "no method succeeded for {} ({})",
        user,
        failures.join("; ")
    )))
}

// ── Channel ──────────────────────────────────────────────────────────────────

pub struct Ssh2Channel {
    session: Session,
    sftp: Option<Sftp>,
    files: HashMap<u64, ssh2::File>,
    next_handle: u64,
    alive: Arc<AtomicBool>,
    /// Sub-channels share the session but must not disconnect it.
    owns_session: bool,
}

impl Ssh2Channel {
    fn new(session: Session, sftp: Sftp) -> Self {
        Self {
            session,
            sftp: Some(sftp),
            files: HashMap::new(),
            next_handle: 1,
            alive: Arc::new(AtomicBool::new(true)),
            owns_session: true,
        }
    }

    fn sftp(&self) -> RemoteResult<&Sftp> {
        self.sftp.as_ref().ok_or(RemoteError::Closed)
    }

    /// Record transport loss so the gate stops using this channel.
    fn note(&self, err: RemoteError) -> RemoteError {
        if err == RemoteError::Closed {
            self.alive.store(false, Ordering::SeqCst);
        }
        err
    }

    fn sftp_call<T>(&self, path: &str, f: impl FnOnce(&Sftp) -> Result<T, ssh2::Error>) -> RemoteResult<T> {
        let sftp = self.sftp()?;
        f(sftp).map_err(|e| self.note(classify(&e, path)))
    }

    fn insert_file(&mut self, file: ssh2::File) -> RemoteHandle {
        let id = self.next_handle;
        self.next_handle += 1;
        self.files.insert(id, file);
        RemoteHandle(id)
    }
}

impl RemoteChannel for Ssh2Channel {
    fn read_dir(&mut self, path: &str) -> RemoteResult<Vec<RemoteEntry>> {
        let raw = self.sftp_call(path, |s| s.readdir(Path::new(path)))?;
        Ok(raw
            .into_iter()
            .map(|(entry_path, stat)| RemoteEntry {
                name: entry_path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default(),
                is_dir: stat.is_dir(),
                size: stat.size,
                modified: stat.mtime,
            })
            .collect())
    }

    fn stat(&mut self, path: &str) -> RemoteResult<RemoteStat> {
        let stat = self.sftp_call(path, |s| s.stat(Path::new(path)))?;
        Ok(RemoteStat {
            is_dir: stat.is_dir(),
            size: stat.size,
            modified: stat.mtime,
        })
    }

    fn realpath(&mut self, path: &str) -> RemoteResult<String> {
        let resolved = self.sftp_call(path, |s| s.realpath(Path::new(path)))?;
        Ok(resolved.to_string_lossy().to_string())
    }

    fn open_read(&mut self, path: &str) -> RemoteResult<RemoteHandle> {
        let file = self.sftp_call(path, |s| s.open(Path::new(path)))?;
        Ok(self.insert_file(file))
    }

    fn open_write(&mut self, path: &str) -> RemoteResult<RemoteHandle> {
        let file = self.sftp_call(path, |s| s.create(Path::new(path)))?;
        Ok(self.insert_file(file))
    }

    fn read(&mut self, handle: RemoteHandle, max_len: usize) -> RemoteResult<Vec<u8>> {
        let file = self
            .files
            .get_mut(&handle.0)
            .ok_or_else(|| RemoteError::Other(format!("bad read handle {}", handle.0)))?;
        let mut buf = vec![0u8; max_len];
        let result = file.read(&mut buf);
        match result {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) => Err(self.note(classify_io(&e, "read"))),
        }
    }

    fn write(&mut self, handle: RemoteHandle, data: &[u8]) -> RemoteResult<()> {
        let file = self
            .files
            .get_mut(&handle.0)
            .ok_or_else(|| RemoteError::Other(format!("bad write handle {}", handle.0)))?;
        let result = file.write_all(data);
        result.map_err(|e| self.note(classify_io(&e, "write")))
    }

    fn close(&mut self, handle: RemoteHandle) {
        if let Some(mut file) = self.files.remove(&handle.0) {
            if let Err(e) = file.close() {
                debug!("closing remote handle {} failed: {}", handle.0, e);
            }
        }
    }

    fn remove_file(&mut self, path: &str) -> RemoteResult<()> {
        self.sftp_call(path, |s| s.unlink(Path::new(path)))
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn supports_multiplexing(&self) -> bool {
        true
    }

    fn open_subchannel(&mut self) -> RemoteResult<Box<dyn RemoteChannel>> {
        let sftp = self
            .session
            .sftp()
            .map_err(|e| self.note(classify(&e, "sftp")))?;
        Ok(Box::new(Ssh2Channel {
            session: self.session.clone(),
            sftp: Some(sftp),
            files: HashMap::new(),
            next_handle: 1,
            alive: self.alive.clone(),
            owns_session: false,
        }))
    }

    fn keepalive(&mut self) -> RemoteResult<()> {
        match self.session.keepalive_send() {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!("keepalive failed: {}", e);
                self.alive.store(false, Ordering::SeqCst);
                Err(RemoteError::Closed)
            }
        }
    }

    fn shutdown(&mut self) {
        self.files.clear();
        self.sftp.take();
        if self.owns_session {
            let _ = self.session.disconnect(None, "client disconnecting", None);
            self.alive.store(false, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn sftp_status_codes_are_classified() {
        let cases = [
            (SSH_FX_NO_SUCH_FILE, RemoteError::NotFound("/x".into())),
            (SSH_FX_NO_SUCH_PATH, RemoteError::NotFound("/x".into())),
            (SSH_FX_PERMISSION_DENIED, RemoteError::PermissionDenied("/x".into())),
            (SSH_FX_NOT_A_DIRECTORY, RemoteError::NotADirectory("/x".into())),
            (SSH_FX_FILE_IS_A_DIRECTORY, RemoteError::IsADirectory("/x".into())),
        ];
        for (code, expected) in cases {
            let err = ssh2::Error::new(ErrorCode::SFTP(code), "sftp");
            assert_eq!(classify(&err, "/x"), expected);
        }
    }

    #[test]
    fn socket_errors_mean_closed() {
        let err = ssh2::Error::new(ErrorCode::Session(LIBSSH2_ERROR_SOCKET_DISCONNECT), "gone");
        assert_eq!(classify(&err, "/x"), RemoteError::Closed);
        let err = ssh2::Error::new(ErrorCode::Session(-14), "proto");
        assert!(matches!(classify(&err, "/x"), RemoteError::Other(_)));
    }

    #[test]
    fn refused_port_is_network_unreachable() {
        let addr = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap()
        };
        let connector = Ssh2Connector::new(&CoreConfig::default());
        let mut cfg = ConnectionConfig::with_password("127.0.0.1", "u", "p");
        cfg.port = addr.port();
        let err = connector.connect(cfg, Duration::from_secs(2)).err().unwrap();
        assert!(matches!(err, ConnectionError::NetworkUnreachable(_)));
    }

    #[test]
    fn non_ssh_peer_fails_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        // Accept and immediately hang up.
        let server = std::thread::spawn(move || {
            if let Ok((stream, _)) = listener.accept() {
                drop(stream);
            }
        });
        let connector = Ssh2Connector::new(&CoreConfig::default());
        let mut cfg = ConnectionConfig::with_password("127.0.0.1", "u", "p");
        cfg.port = port;
        let err = connector.connect(cfg, Duration::from_secs(2)).err().unwrap();
        assert!(matches!(
            err,
            ConnectionError::NetworkUnreachable(_) | ConnectionError::Timeout(_)
        ));
        server.join().unwrap();
    }
}
