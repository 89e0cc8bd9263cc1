// ── ProgressChannel – token-keyed progress / terminal event stream ──────────
//
// Publishing only takes a short std mutex and never waits on subscribers.
// Each subscriber owns a queue in which progress updates are bounded (the
// oldest progress update is evicted first) while terminal events are never
// evicted. Recent terminal events are retained and replayed to new
// subscribers so a late subscriber still sees how a transfer ended.

use crate::sftp::types::{ProgressEvent, TransferOutcome, TransferToken};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

#[derive(Clone)]
pub struct ProgressChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    state: Mutex<ChannelState>,
    progress_capacity: usize,
    terminal_retention: usize,
    next_id: AtomicU64,
    closed: AtomicBool,
}

#[derive(Default)]
struct ChannelState {
    subscribers: HashMap<u64, Arc<SubscriberQueue>>,
    recent_terminals: VecDeque<ProgressEvent>,
}

struct SubscriberQueue {
    filter: Option<TransferToken>,
    pending: Mutex<PendingEvents>,
    notify: Notify,
}

#[derive(Default)]
struct PendingEvents {
    events: VecDeque<ProgressEvent>,
    progress_len: usize,
    dropped: u64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SubscriberQueue {
    fn wants(&self, event: &ProgressEvent) -> bool {
        self.filter.map_or(true, |t| t == event.token())
    }

    fn push(&self, event: ProgressEvent, capacity: usize) {
        {
            let mut pending = lock(&self.pending);
            if event.is_terminal() {
                pending.events.push_back(event);
            } else {
                if pending.progress_len >= capacity {
                    if let Some(idx) = pending.events.iter().position(|e| !e.is_terminal()) {
                        pending.events.remove(idx);
                        pending.progress_len -= 1;
                        pending.dropped += 1;
                    }
                }
                pending.events.push_back(event);
                pending.progress_len += 1;
            }
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<ProgressEvent> {
        let mut pending = lock(&self.pending);
        let event = pending.events.pop_front()?;
        if !event.is_terminal() {
            pending.progress_len -= 1;
        }
        Some(event)
    }
}

impl ProgressChannel {
    pub fn new(progress_capacity: usize, terminal_retention: usize) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                state: Mutex::new(ChannelState::default()),
                progress_capacity: progress_capacity.max(1),
                terminal_retention,
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Deliver `event` to every interested subscriber. Never blocks on them.
    pub fn publish(&self, event: ProgressEvent) {
        let mut state = lock(&self.inner.state);
        if event.is_terminal() && self.inner.terminal_retention > 0 {
            if state.recent_terminals.len() >= self.inner.terminal_retention {
                state.recent_terminals.pop_front();
            }
            state.recent_terminals.push_back(event.clone());
        }
        for sub in state.subscribers.values() {
            if sub.wants(&event) {
                sub.push(event.clone(), self.inner.progress_capacity);
            }
        }
    }

    /// All events for all tokens.
    pub fn subscribe(&self) -> Subscription {
        self.register(None)
    }

    /// Events for one token only.
    pub fn subscribe_token(&self, token: TransferToken) -> Subscription {
        self.register(Some(token))
    }

    fn register(&self, filter: Option<TransferToken>) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SubscriberQueue {
            filter,
            pending: Mutex::new(PendingEvents::default()),
            notify: Notify::new(),
        });

        // Replay under the same lock `publish` takes, so nothing is seen twice
        // or missed between replay and registration.
        let mut state = lock(&self.inner.state);
        for event in state.recent_terminals.iter().filter(|e| queue.wants(e)) {
            queue.push(event.clone(), self.inner.progress_capacity);
        }
        state.subscribers.insert(id, queue.clone());

        Subscription {
            id,
            queue,
            channel: self.inner.clone(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.state).subscribers.len()
    }

    /// Wake every subscriber; `recv` returns `None` once its queue is drained.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let state = lock(&self.inner.state);
        for sub in state.subscribers.values() {
            sub.notify.notify_one();
        }
    }
}

/// A live subscription. Dropping it unregisters it.
pub struct Subscription {
    id: u64,
    queue: Arc<SubscriberQueue>,
    channel: Arc<ChannelInner>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        loop {
            if let Some(event) = self.queue.pop() {
                return Some(event);
            }
            if self.channel.closed.load(Ordering::SeqCst) {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        self.queue.pop()
    }

    /// Consume events until the terminal event for `token` arrives.
    pub async fn wait_terminal(&mut self, token: TransferToken) -> Option<TransferOutcome> {
        while let Some(event) = self.recv().await {
            if let ProgressEvent::Terminal { token: t, outcome } = event {
                if t == token {
                    return Some(outcome);
                }
            }
        }
        None
    }

    /// Progress updates evicted from this subscription's buffer so far.
    pub fn dropped_progress(&self) -> u64 {
        lock(&self.queue.pending).dropped
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        lock(&self.channel.state).subscribers.remove(&self.id);
    }
}
