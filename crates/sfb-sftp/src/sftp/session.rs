// ── SessionManager – session lifecycle management ────────────────────────────

use crate::sftp::channel::Connector;
use crate::sftp::gate::SessionGate;
use crate::sftp::types::*;
use chrono::Utc;
use sfb_core::config::CoreConfig;
use sfb_core::error::{ConnectionError, SessionError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ── Internal session handle (never handed to the view layer) ─────────────────

struct ActiveSession {
    info: SessionInfo,
    gate: Arc<SessionGate>,
}

#[derive(Default)]
struct Slot {
    state: SessionState,
    active: Option<ActiveSession>,
}

/// Owns the single authenticated session.
///
/// `connect` and `disconnect` are serialised against each other; everything
/// else only takes a short lock to clone the current gate.
pub struct SessionManager {
    connector: Arc<dyn Connector>,
    connect_timeout: Duration,
    keepalive_interval: Duration,
    lifecycle: tokio::sync::Mutex<()>,
    slot: Mutex<Slot>,
}

impl SessionManager {
    pub fn new(connector: Arc<dyn Connector>, config: &CoreConfig) -> Self {
        Self {
            connector,
            connect_timeout: config.connect_timeout(),
            keepalive_interval: Duration::from_secs(config.keepalive_interval_secs),
            lifecycle: tokio::sync::Mutex::new(()),
            slot: Mutex::new(Slot::default()),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|p| p.into_inner())
    }

    // ── Connect ──────────────────────────────────────────────────────────────

    pub async fn connect(&self, config: ConnectionConfig) -> Result<SessionInfo, ConnectionError> {
        config.validate()?;
        let _lifecycle = self.lifecycle.lock().await;

        // An existing session is fully torn down before the new attempt.
        self.teardown("replaced by a new connection");
        self.slot().state = SessionState::Connecting;

        let host = config.host.clone();
        let port = config.port;
        let username = config.username.clone();
        info!("connecting to {}:{} as {}", host, port, username);

        let connected = match self.establish(config).await {
            Ok(c) => c,
            Err(e) => {
                warn!("connection to {}:{} failed: {}", host, port, e);
                self.slot().state = SessionState::Failed;
                return Err(e);
            }
        };

        let id = Uuid::new_v4().to_string();
        let closed = CancellationToken::new();
        let gate = match SessionGate::spawn(short_id(&id), connected.channel, closed.clone()) {
            Ok(gate) => Arc::new(gate),
            Err(e) => {
                self.slot().state = SessionState::Failed;
                return Err(ConnectionError::NetworkUnreachable(format!(
                    "failed to start session worker: {}",
                    e
                )));
            }
        };

        let remote_home = match gate.call(|ch| ch.realpath(".")).await {
            Ok(home) => Some(home),
            Err(e) => {
                debug!("remote home not resolvable: {}", e);
                None
            }
        };

        self.spawn_keepalive(&gate, closed);

        let info = SessionInfo {
            id,
            host,
            port,
            username,
            auth_method: connected.auth_method,
            state: SessionState::Connected,
            connected_at: Utc::now(),
            remote_home,
        };
        info!(
            "session {} connected to {}:{} via {:?}",
            info.id, info.host, info.port, info.auth_method
        );

        let mut slot = self.slot();
        slot.state = SessionState::Connected;
        slot.active = Some(ActiveSession {
            info: info.clone(),
            gate,
        });
        Ok(info)
    }

    /// Run the blocking handshake off the runtime, bounded by the connect timeout.
    async fn establish(
        &self,
        config: ConnectionConfig,
    ) -> Result<crate::sftp::channel::Connected, ConnectionError> {
        let connector = self.connector.clone();
        let timeout = self.connect_timeout;
        let address = config.address();
        let handshake = tokio::task::spawn_blocking(move || connector.connect(config, timeout));

        match tokio::time::timeout(timeout, handshake).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(ConnectionError::NetworkUnreachable(format!(
                "connect task for {} failed: {}",
                address, join
            ))),
            Err(_) => Err(ConnectionError::Timeout(format!(
                "no session with {} after {}s",
                address,
                timeout.as_secs()
            ))),
        }
    }

    fn spawn_keepalive(&self, gate: &Arc<SessionGate>, closed: CancellationToken) {
        if self.keepalive_interval.is_zero() {
            return;
        }
        let interval = self.keepalive_interval;
        let gate = Arc::downgrade(gate);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = closed.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(gate) = gate.upgrade() else { break };
                gate.run_detached(|ch| {
                    if let Err(e) = ch.keepalive() {
                        warn!("keepalive failed: {}", e);
                    }
                });
            }
        });
    }

    // ── Disconnect ───────────────────────────────────────────────────────────

    /// Idempotent; always ends `Disconnected`.
    pub async fn disconnect(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.teardown("disconnect requested");
        self.slot().state = SessionState::Disconnected;
    }

    fn teardown(&self, reason: &str) {
        let previous = self.slot().active.take();
        if let Some(active) = previous {
            active.gate.close();
            info!("session {} closed: {}", active.info.id, reason);
        }
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    /// Gate of the live session.
    pub fn gate(&self) -> Result<Arc<SessionGate>, SessionError> {
        let slot = self.slot();
        match &slot.active {
            None => Err(SessionError::NotConnected),
            Some(active) if active.gate.is_closed() => Err(SessionError::SessionClosed),
            Some(active) => Ok(active.gate.clone()),
        }
    }

    pub fn state(&self) -> SessionState {
        let slot = self.slot();
        match &slot.active {
            Some(active) if active.gate.is_closed() => SessionState::Failed,
            _ => slot.state,
        }
    }

    pub fn info(&self) -> Option<SessionInfo> {
        let slot = self.slot();
        slot.active.as_ref().map(|active| {
            let mut info = active.info.clone();
            if active.gate.is_closed() {
                info.state = SessionState::Failed;
            }
            info
        })
    }

    pub fn remote_home(&self) -> Option<String> {
        self.slot()
            .active
            .as_ref()
            .and_then(|a| a.info.remote_home.clone())
    }
}

fn short_id(id: &str) -> String {
    id.chars().take(8).collect()
}
