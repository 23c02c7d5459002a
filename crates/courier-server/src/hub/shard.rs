//! One partition of the connection registry.
//!
//! A shard is a single task that owns its [`ShardIndex`] outright. Callers
//! talk to it through three bounded queues (register, unregister,
//! broadcast); the loop is the only writer, so the index needs no lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

use courier_core::events::ScopedEvent;
use courier_core::ids::{SessionId, UserId};
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::ShardError;
use crate::metrics::{BROADCAST_DELIVERIES_TOTAL, SESSION_DROPS_TOTAL, TENANT_MISMATCH_TOTAL};
use crate::session::ClientSession;

/// What a shard knows about the node it runs on.
#[derive(Clone, Debug)]
pub struct ShardContext {
    /// Node name, for log fields.
    pub node: Arc<str>,
}

/// A single broadcast request.
#[derive(Debug)]
pub struct Broadcast {
    /// Recipient.
    pub user_id: UserId,
    /// Event, shared by every session it is queued to.
    pub event: Arc<ScopedEvent>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Progress probe
// ─────────────────────────────────────────────────────────────────────────────

/// What the loop is doing right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ShardPhase {
    /// Waiting on its queues.
    Idle = 0,
    /// Indexing a session.
    Registering = 1,
    /// Removing a session.
    Unregistering = 2,
    /// Delivering to a user's sessions.
    Broadcasting = 3,
    /// Loop has exited.
    Stopped = 4,
}

impl ShardPhase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::Registering,
            2 => Self::Unregistering,
            3 => Self::Broadcasting,
            _ => Self::Stopped,
        }
    }

    /// Label for diagnostics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Registering => "registering",
            Self::Unregistering => "unregistering",
            Self::Broadcasting => "broadcasting",
            Self::Stopped => "stopped",
        }
    }
}

/// Loop progress, written by the loop and read by the watchdog.
#[derive(Debug)]
pub struct ShardProbe {
    phase: AtomicU8,
    last_progress: Mutex<Instant>,
    current_user: Mutex<Option<UserId>>,
}

/// Point-in-time copy of a [`ShardProbe`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeSnapshot {
    /// Current phase.
    pub phase: ShardPhase,
    /// Time since the loop last finished a step.
    pub since_progress: Duration,
    /// User being broadcast to, when broadcasting.
    pub current_user: Option<UserId>,
}

impl ShardProbe {
    fn new() -> Self {
        Self {
            phase: AtomicU8::new(ShardPhase::Idle as u8),
            last_progress: Mutex::new(Instant::now()),
            current_user: Mutex::new(None),
        }
    }

    fn enter(&self, phase: ShardPhase, user: Option<&UserId>) {
        self.phase.store(phase as u8, Ordering::Release);
        *self.current_user.lock() = user.cloned();
    }

    fn progressed(&self) {
        self.phase.store(ShardPhase::Idle as u8, Ordering::Release);
        *self.current_user.lock() = None;
        *self.last_progress.lock() = Instant::now();
    }

    /// Read the current state.
    pub fn snapshot(&self) -> ProbeSnapshot {
        ProbeSnapshot {
            phase: ShardPhase::from_u8(self.phase.load(Ordering::Acquire)),
            since_progress: self.last_progress.lock().elapsed(),
            current_user: self.current_user.lock().clone(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Index
// ─────────────────────────────────────────────────────────────────────────────

/// Sessions of one shard with O(1) insert, lookup by user, and removal.
///
/// `positions` maps a session id to its slot in `sessions` and its slot in
/// the owning user's list; both lists remove by swapping with the last
/// element, so the moved element's position is patched on every removal.
#[derive(Default)]
pub(crate) struct ShardIndex {
    sessions: Vec<Arc<ClientSession>>,
    by_user: HashMap<UserId, Vec<Arc<ClientSession>>>,
    positions: HashMap<SessionId, (usize, usize)>,
}

impl ShardIndex {
    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }

    pub(crate) fn sessions_for(&self, user_id: &UserId) -> &[Arc<ClientSession>] {
        self.by_user
            .get(user_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Index `session`. Returns `false` if its id is already present.
    pub(crate) fn insert(&mut self, session: Arc<ClientSession>) -> bool {
        if self.positions.contains_key(session.id()) {
            return false;
        }
        let slot = self.sessions.len();
        let user_sessions = self.by_user.entry(session.user_id().clone()).or_default();
        let user_slot = user_sessions.len();
        user_sessions.push(session.clone());
        let _ = self.positions.insert(session.id().clone(), (slot, user_slot));
        self.sessions.push(session);
        true
    }

    /// Remove exactly this session. A different session that happens to
    /// share the id is left alone.
    pub(crate) fn remove(&mut self, session: &Arc<ClientSession>) -> bool {
        let Some(&(slot, user_slot)) = self.positions.get(session.id()) else {
            return false;
        };
        if !self.sessions.get(slot).is_some_and(|s| Arc::ptr_eq(s, session)) {
            return false;
        }
        let _ = self.positions.remove(session.id());

        let _ = self.sessions.swap_remove(slot);
        if let Some(moved) = self.sessions.get(slot) {
            if let Some(pos) = self.positions.get_mut(moved.id()) {
                pos.0 = slot;
            }
        }

        if let Some(user_sessions) = self.by_user.get_mut(session.user_id()) {
            let _ = user_sessions.swap_remove(user_slot);
            if let Some(moved) = user_sessions.get(user_slot) {
                if let Some(pos) = self.positions.get_mut(moved.id()) {
                    pos.1 = user_slot;
                }
            }
            if user_sessions.is_empty() {
                let _ = self.by_user.remove(session.user_id());
            }
        }
        true
    }

    fn drain(&mut self) -> Vec<Arc<ClientSession>> {
        self.by_user.clear();
        self.positions.clear();
        std::mem::take(&mut self.sessions)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Shard handle
// ─────────────────────────────────────────────────────────────────────────────

/// Handle to a running shard loop.
pub struct Shard {
    id: usize,
    register_tx: mpsc::Sender<Arc<ClientSession>>,
    unregister_tx: mpsc::Sender<Arc<ClientSession>>,
    broadcast_tx: mpsc::Sender<Broadcast>,
    stop: CancellationToken,
    connections: Arc<AtomicUsize>,
    probe: Arc<ShardProbe>,
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("id", &self.id)
            .field("connections", &self.connection_count())
            .field("queue_depth", &self.broadcast_queue_depth())
            .finish_non_exhaustive()
    }
}

impl Shard {
    /// Build a shard and the loop future that drives it. The loop exits
    /// when `stop` is cancelled.
    pub fn new(
        id: usize,
        ctx: ShardContext,
        control_depth: usize,
        broadcast_depth: usize,
        stop: CancellationToken,
    ) -> (Self, impl Future<Output = ()> + Send + 'static) {
        let (register_tx, register_rx) = mpsc::channel(control_depth.max(1));
        let (unregister_tx, unregister_rx) = mpsc::channel(control_depth.max(1));
        let (broadcast_tx, broadcast_rx) = mpsc::channel(broadcast_depth.max(1));
        let connections = Arc::new(AtomicUsize::new(0));
        let probe = Arc::new(ShardProbe::new());

        let shard_loop = ShardLoop {
            id,
            ctx,
            index: ShardIndex::default(),
            connections: connections.clone(),
            probe: probe.clone(),
        };
        let run = shard_loop.run(register_rx, unregister_rx, broadcast_rx, stop.clone());

        let shard = Self {
            id,
            register_tx,
            unregister_tx,
            broadcast_tx,
            stop,
            connections,
            probe,
        };
        (shard, run)
    }

    /// Shard index within the hub.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Queue `session` for indexing.
    pub async fn register(&self, session: Arc<ClientSession>) -> Result<(), ShardError> {
        self.enqueue(&self.register_tx, session).await
    }

    /// Queue `session` for removal.
    pub async fn unregister(&self, session: Arc<ClientSession>) -> Result<(), ShardError> {
        self.enqueue(&self.unregister_tx, session).await
    }

    /// Queue `event` for every session of `user_id` in this shard.
    pub async fn broadcast(
        &self,
        user_id: UserId,
        event: Arc<ScopedEvent>,
    ) -> Result<(), ShardError> {
        self.enqueue(&self.broadcast_tx, Broadcast { user_id, event }).await
    }

    async fn enqueue<T>(&self, tx: &mpsc::Sender<T>, item: T) -> Result<(), ShardError> {
        let stopped = ShardError::Stopped { shard: self.id };
        tokio::select! {
            biased;
            () = self.stop.cancelled() => Err(stopped),
            sent = tx.send(item) => sent.map_err(|_| stopped),
        }
    }

    /// Sessions currently indexed.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }

    /// Broadcasts waiting in the queue.
    pub fn broadcast_queue_depth(&self) -> usize {
        self.broadcast_tx.max_capacity() - self.broadcast_tx.capacity()
    }

    /// Broadcast queue capacity.
    pub fn broadcast_queue_capacity(&self) -> usize {
        self.broadcast_tx.max_capacity()
    }

    /// Loop progress.
    pub fn probe(&self) -> ProbeSnapshot {
        self.probe.snapshot()
    }

    /// Whether the loop has been told to stop.
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Loop
// ─────────────────────────────────────────────────────────────────────────────

struct ShardLoop {
    id: usize,
    ctx: ShardContext,
    index: ShardIndex,
    connections: Arc<AtomicUsize>,
    probe: Arc<ShardProbe>,
}

impl ShardLoop {
    async fn run(
        mut self,
        mut register_rx: mpsc::Receiver<Arc<ClientSession>>,
        mut unregister_rx: mpsc::Receiver<Arc<ClientSession>>,
        mut broadcast_rx: mpsc::Receiver<Broadcast>,
        stop: CancellationToken,
    ) {
        debug!(shard = self.id, node = %self.ctx.node, "shard loop started");
        loop {
            tokio::select! {
                biased;
                () = stop.cancelled() => break,
                Some(session) = register_rx.recv() => self.register(session),
                Some(session) = unregister_rx.recv() => self.unregister(&session),
                Some(broadcast) = broadcast_rx.recv() => self.broadcast(&broadcast),
                else => break,
            }
            self.connections.store(self.index.len(), Ordering::Release);
            self.probe.progressed();
        }

        let remaining = self.index.drain();
        for session in &remaining {
            let _ = session.close();
        }
        self.connections.store(0, Ordering::Release);
        self.probe.enter(ShardPhase::Stopped, None);
        debug!(shard = self.id, node = %self.ctx.node, closed = remaining.len(), "shard loop stopped");
    }

    fn register(&mut self, session: Arc<ClientSession>) {
        self.probe.enter(ShardPhase::Registering, Some(session.user_id()));
        if !session.is_active() {
            debug!(shard = self.id, session_id = %session.id(), "skipping register of closed session");
            return;
        }
        if !self.index.insert(session.clone()) {
            debug!(shard = self.id, session_id = %session.id(), "session already registered");
        }
    }

    fn unregister(&mut self, session: &Arc<ClientSession>) {
        self.probe.enter(ShardPhase::Unregistering, Some(session.user_id()));
        if !self.index.remove(session) {
            debug!(shard = self.id, session_id = %session.id(), "unregister of unknown session");
        }
    }

    fn broadcast(&mut self, broadcast: &Broadcast) {
        let Broadcast { user_id, event } = broadcast;
        self.probe.enter(ShardPhase::Broadcasting, Some(user_id));

        let mut dropped = Vec::new();
        for session in self.index.sessions_for(user_id) {
            if session.tenant_id() != &event.tenant_id {
                warn!(
                    shard = self.id,
                    node = %self.ctx.node,
                    session_id = %session.id(),
                    user_id = %user_id,
                    session_tenant = %session.tenant_id(),
                    event_tenant = %event.tenant_id,
                    "tenant mismatch, dropping event"
                );
                counter!(TENANT_MISMATCH_TOTAL).increment(1);
                continue;
            }
            match session.try_enqueue(event.clone()) {
                Ok(()) => counter!(BROADCAST_DELIVERIES_TOTAL).increment(1),
                Err(e) => dropped.push((session.clone(), e)),
            }
        }

        for (session, reason) in dropped {
            let _ = session.close();
            let _ = self.index.remove(&session);
            counter!(SESSION_DROPS_TOTAL, "reason" => reason.as_str()).increment(1);
            warn!(
                shard = self.id,
                node = %self.ctx.node,
                session_id = %session.id(),
                user_id = %user_id,
                reason = reason.as_str(),
                "dropping session that cannot accept events"
            );
        }
    }
}
