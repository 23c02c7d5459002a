//! Client session: one live connection and its bounded delivery queue.
//!
//! A [`ClientSession`] is shared between the shard that indexes it and the
//! write pump that drains it. Shards only ever call [`ClientSession::try_enqueue`]
//! and [`ClientSession::close`]; everything else happens in [`run_write_pump`].
//!
//! Lifecycle: `Active -> Closing -> Closed`. Every exit path of the pump goes
//! through one teardown (unregister from the shard, delete the presence row)
//! that runs at most once per session.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use chrono::Utc;
use courier_core::events::{Event, ScopedEvent};
use courier_core::ids::{SessionId, TenantId, UserId};
use courier_store::PresenceStore;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::hub::Hub;
use crate::metrics::{SESSION_DROPS_TOTAL, SESSIONS_ACTIVE};
use crate::transport::EventSink;

/// Receiving half of a session's delivery queue.
pub type SessionQueue = mpsc::Receiver<Arc<ScopedEvent>>;

/// Lifecycle state of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// Accepting events.
    Active = 0,
    /// Close requested; the pump has not finished teardown yet.
    Closing = 1,
    /// Torn down. Terminal.
    Closed = 2,
}

impl SessionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Active,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Why a write pump returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    /// No ping refresh within the stale window.
    Stale,
    /// Closed on request (client left, shard dropped it).
    Closed,
    /// Server shutdown or caller cancellation.
    Cancelled,
    /// Every sender of the queue was dropped.
    QueueClosed,
    /// Writing to the transport failed.
    Transport,
}

impl SessionEnd {
    /// Metric label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stale => "stale",
            Self::Closed => "closed",
            Self::Cancelled => "cancelled",
            Self::QueueClosed => "queue_closed",
            Self::Transport => "transport",
        }
    }
}

/// Why an event could not be queued for a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnqueueError {
    /// The consumer is not keeping up.
    Full,
    /// The session is closing or its pump is gone.
    Closed,
}

impl EnqueueError {
    /// Metric label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "queue_full",
            Self::Closed => "queue_closed",
        }
    }
}

/// One live client connection.
pub struct ClientSession {
    id: SessionId,
    user_id: UserId,
    tenant_id: TenantId,
    tx: mpsc::Sender<Arc<ScopedEvent>>,
    ping_observed: Notify,
    last_active: Mutex<Instant>,
    state: AtomicU8,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("tenant_id", &self.tenant_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ClientSession {
    /// Create a session with a fresh id and a queue of `queue_depth` events.
    pub fn new(
        user_id: UserId,
        tenant_id: TenantId,
        queue_depth: usize,
    ) -> (Arc<Self>, SessionQueue) {
        Self::with_id(SessionId::generate(), user_id, tenant_id, queue_depth)
    }

    /// Create a session with a known id.
    pub fn with_id(
        id: SessionId,
        user_id: UserId,
        tenant_id: TenantId,
        queue_depth: usize,
    ) -> (Arc<Self>, SessionQueue) {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let session = Arc::new(Self {
            id,
            user_id,
            tenant_id,
            tx,
            ping_observed: Notify::new(),
            last_active: Mutex::new(Instant::now()),
            state: AtomicU8::new(SessionState::Active as u8),
            cancel: CancellationToken::new(),
        });
        (session, rx)
    }

    /// Session id.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Owning user.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Tenant the session was opened in.
    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the session still accepts events.
    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Queue an event without waiting.
    pub fn try_enqueue(&self, event: Arc<ScopedEvent>) -> Result<(), EnqueueError> {
        if !self.is_active() {
            return Err(EnqueueError::Closed);
        }
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    /// Request the pump to stop. Returns `true` for the call that moved the
    /// session out of `Active`.
    pub fn close(&self) -> bool {
        let moved = self
            .state
            .compare_exchange(
                SessionState::Active as u8,
                SessionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        self.cancel.cancel();
        moved
    }

    /// Signal that a ping for this session was observed. Coalesces: at most
    /// one pending signal is kept.
    pub fn observe_ping(&self) {
        self.ping_observed.notify_one();
    }

    /// Record a heartbeat.
    pub fn mark_active(&self) {
        *self.last_active.lock() = Instant::now();
    }

    /// Time since the last heartbeat (or connect).
    pub fn idle_for(&self) -> Duration {
        self.last_active.lock().elapsed()
    }

    /// Move to `Closed`. Returns `true` exactly once per session.
    fn finish(&self) -> bool {
        self.cancel.cancel();
        self.state.swap(SessionState::Closed as u8, Ordering::AcqRel) != SessionState::Closed as u8
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Write pump
// ─────────────────────────────────────────────────────────────────────────────

/// What the write pump needs beyond the session itself.
#[derive(Clone)]
pub struct PumpContext {
    /// Registry the session is indexed in.
    pub hub: Arc<Hub>,
    /// Presence rows to touch and release.
    pub presence: Arc<PresenceStore>,
    /// Timer period for the stale check.
    pub health_check_interval: Duration,
    /// Idle time after which the session is torn down.
    pub stale_after: Duration,
    /// Upper bound on presence cleanup.
    pub teardown_timeout: Duration,
    /// Server shutdown.
    pub shutdown: CancellationToken,
}

/// Drain `queue` into `sink` until the session ends, then tear it down.
pub async fn run_write_pump<S: EventSink>(
    session: Arc<ClientSession>,
    mut queue: SessionQueue,
    mut sink: S,
    ctx: &PumpContext,
) -> SessionEnd {
    let mut ticker = tokio::time::interval_at(
        Instant::now() + ctx.health_check_interval,
        ctx.health_check_interval,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let reason = loop {
        tokio::select! {
            biased;
            () = ctx.shutdown.cancelled() => break SessionEnd::Cancelled,
            () = session.cancel.cancelled() => break SessionEnd::Closed,
            () = session.ping_observed.notified() => {
                session.mark_active();
                match ctx.presence.set_active(&session.id, Utc::now()).await {
                    Ok(true) => {}
                    Ok(false) => debug!(session_id = %session.id, "heartbeat for missing presence row"),
                    Err(e) => warn!(session_id = %session.id, error = %e, "failed to persist heartbeat"),
                }
            }
            event = queue.recv() => {
                let Some(event) = event else {
                    break SessionEnd::QueueClosed;
                };
                match &event.event {
                    Event::Ping(ping) if ping.session_id == session.id => session.observe_ping(),
                    Event::Ping(_) => {}
                    Event::NewMessage(_) | Event::DeleteMessage(_) => {
                        if let Err(e) = sink.send(&event.event).await {
                            debug!(session_id = %session.id, error = %e, "transport write failed");
                            break SessionEnd::Transport;
                        }
                    }
                }
            }
            _ = ticker.tick() => {
                if session.idle_for() > ctx.stale_after {
                    break SessionEnd::Stale;
                }
            }
        }
    };

    sink.close().await;
    if teardown(&session, ctx).await {
        info!(
            session_id = %session.id,
            user_id = %session.user_id,
            reason = reason.as_str(),
            "session ended"
        );
        if reason != SessionEnd::Cancelled {
            counter!(SESSION_DROPS_TOTAL, "reason" => reason.as_str()).increment(1);
        }
    }
    reason
}

/// Release the session everywhere. Returns `false` if it was already torn down.
pub async fn teardown(session: &Arc<ClientSession>, ctx: &PumpContext) -> bool {
    if !session.finish() {
        return false;
    }
    gauge!(SESSIONS_ACTIVE).decrement(1.0);

    if let Err(e) = ctx.hub.unregister(session.clone()).await {
        debug!(session_id = %session.id, error = %e, "unregister skipped");
    }

    match tokio::time::timeout(ctx.teardown_timeout, ctx.presence.delete(&session.id)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => warn!(session_id = %session.id, error = %e, "failed to release presence"),
        Err(_) => warn!(
            session_id = %session.id,
            timeout_ms = u64::try_from(ctx.teardown_timeout.as_millis()).unwrap_or(u64::MAX),
            "presence release timed out"
        ),
    }
    true
}
