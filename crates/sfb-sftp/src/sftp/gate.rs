// ── SessionGate – single logical access point to a remote channel ───────────
//
// A dedicated worker thread owns the channel and executes jobs strictly in
// the order they were submitted. Callers await a oneshot reply; closing the
// gate resolves every waiter with `SessionClosed` instead of leaving it hanging.

use crate::sftp::channel::{RemoteChannel, RemoteError, RemoteResult};
use sfb_core::error::SessionError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Runs against the channel and hands back the step that delivers its result.
/// Delivery happens after the liveness check, so a caller never observes a
/// reply from a connection that is already known to be gone.
type Job = Box<dyn FnOnce(&mut dyn RemoteChannel) -> Deliver + Send>;
type Deliver = Box<dyn FnOnce() + Send>;

fn job<F>(f: F) -> Job
where
    F: FnOnce(&mut dyn RemoteChannel) -> Deliver + Send + 'static,
{
    Box::new(f)
}

enum GateMsg {
    Job(Job),
    Shutdown,
}

pub struct SessionGate {
    tx: mpsc::UnboundedSender<GateMsg>,
    closed: CancellationToken,
    multiplexing: bool,
    label: String,
}

impl SessionGate {
    /// Spawn the worker thread and hand it `channel`.
    pub fn spawn(
        label: impl Into<String>,
        channel: Box<dyn RemoteChannel>,
        closed: CancellationToken,
    ) -> std::io::Result<Self> {
        let label = label.into();
        let multiplexing = channel.supports_multiplexing();
        let (tx, rx) = mpsc::unbounded_channel::<GateMsg>();

        let worker_closed = closed.clone();
        let worker_label = label.clone();
        std::thread::Builder::new()
            .name(format!("sfb-gate-{}", label))
            .spawn(move || gate_worker(worker_label, channel, rx, worker_closed))?;

        Ok(Self {
            tx,
            closed,
            multiplexing,
            label,
        })
    }

    /// Queue `f` behind every previously submitted job and await its result.
    pub async fn run<T, F>(&self, f: F) -> Result<T, SessionError>
    where
        F: FnOnce(&mut dyn RemoteChannel) -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.closed.is_cancelled() {
            return Err(SessionError::SessionClosed);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let queued = job(move |channel| {
            let out = f(channel);
            let deliver: Deliver = Box::new(move || {
                let _ = reply_tx.send(out);
            });
            deliver
        });
        self.tx
            .send(GateMsg::Job(queued))
            .map_err(|_| SessionError::SessionClosed)?;

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(SessionError::SessionClosed),
            reply = reply_rx => reply.map_err(|_| SessionError::SessionClosed),
        }
    }

    /// Like [`SessionGate::run`] for jobs that already return a remote result,
    /// flattening session loss into [`RemoteError::Closed`].
    pub async fn call<T, F>(&self, f: F) -> RemoteResult<T>
    where
        F: FnOnce(&mut dyn RemoteChannel) -> RemoteResult<T> + Send + 'static,
        T: Send + 'static,
    {
        match self.run(f).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Closed),
        }
    }

    /// Queue `f` without waiting for it. Used for cleanup from `Drop`.
    pub fn run_detached<F>(&self, f: F)
    where
        F: FnOnce(&mut dyn RemoteChannel) + Send + 'static,
    {
        let _ = self.tx.send(GateMsg::Job(job(move |channel| {
            f(channel);
            let deliver: Deliver = Box::new(|| ());
            deliver
        })));
    }

    /// Open an independent sub-channel with its own worker, if the channel
    /// supports it. The child gate closes together with this one.
    pub async fn open_subgate(&self, label: &str) -> Option<SessionGate> {
        if !self.multiplexing {
            return None;
        }
        let sub = match self.call(|ch| ch.open_subchannel()).await {
            Ok(sub) => sub,
            Err(e) => {
                warn!("gate {}: sub-channel unavailable, sharing FIFO: {}", self.label, e);
                return None;
            }
        };
        match SessionGate::spawn(
            format!("{}-{}", self.label, label),
            sub,
            self.closed.child_token(),
        ) {
            Ok(gate) => Some(gate),
            Err(e) => {
                warn!("gate {}: failed to spawn sub-gate worker: {}", self.label, e);
                None
            }
        }
    }

    pub fn supports_multiplexing(&self) -> bool {
        self.multiplexing
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Fail every queued and future job with `SessionClosed` and stop the
    /// worker once its current job returns.
    pub fn close(&self) {
        self.closed.cancel();
        let _ = self.tx.send(GateMsg::Shutdown);
    }
}

impl Drop for SessionGate {
    fn drop(&mut self) {
        let _ = self.tx.send(GateMsg::Shutdown);
    }
}

fn gate_worker(
    label: String,
    mut channel: Box<dyn RemoteChannel>,
    mut rx: mpsc::UnboundedReceiver<GateMsg>,
    closed: CancellationToken,
) {
    debug!("gate {} worker started", label);
    while let Some(msg) = rx.blocking_recv() {
        match msg {
            GateMsg::Job(job) => {
                if closed.is_cancelled() {
                    // Dropping the job drops its reply sender.
                    continue;
                }
                let deliver = job(channel.as_mut());
                if !channel.is_alive() {
                    warn!("gate {}: remote connection lost", label);
                    closed.cancel();
                }
                deliver();
            }
            GateMsg::Shutdown => break,
        }
    }
    // Remaining queued jobs are dropped with the receiver.
    drop(rx);
    channel.shutdown();
    debug!("gate {} worker stopped", label);
}
