//! In-memory doubles shared by the unit tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::events::{CrossNodeEnvelope, Event, MessageKind, NewMessage};
use courier_core::ids::{SessionId, TenantId, UserId};
use courier_store::{
    DeviceToken, DeviceTokenSource, OnlineEntry, PresenceBackend, PresenceRecord, PresenceStore,
    StoreError,
};
use futures::StreamExt;
use parking_lot::Mutex;

use crate::bus::{BusError, MessageBus, PublishAck, Subscription};
use crate::dispatch::{Dispatcher, DispatcherConfig, DispatcherDeps};
use crate::hub::{Hub, HubConfig};
use crate::notify::{BatchReport, Notification, NotificationError, PushGateway, TokenFailure};
use crate::policy::PublishFailurePolicy;
use crate::session::{ClientSession, PumpContext, SessionQueue};
use crate::shutdown::ShutdownCoordinator;

/// A text message event.
pub fn new_message(conversation: &str, message: &str) -> Event {
    Event::NewMessage(NewMessage {
        conversation_id: conversation.into(),
        message_id: message.into(),
        conversation_name: Some("General".into()),
        sender_id: Some(UserId::from("sender")),
        content: "hello".into(),
        kind: MessageKind::Text,
        url_media: None,
        local_message_id: None,
        target_user: None,
        created_at: DateTime::<Utc>::UNIX_EPOCH,
    })
}

/// Poll `cond` until it holds, yielding to spawned tasks in between.
pub async fn wait_for(cond: impl Fn() -> bool) {
    for _ in 0..2000 {
        if cond() {
            return;
        }
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}

// ─────────────────────────────────────────────────────────────────────────────
// Presence
// ─────────────────────────────────────────────────────────────────────────────

/// Presence backend over a vector of rows.
#[derive(Default)]
pub struct FakePresence {
    rows: Mutex<Vec<PresenceRecord>>,
    touches: Mutex<Vec<SessionId>>,
    deletes: Mutex<Vec<SessionId>>,
    fail_lookups: AtomicBool,
}

impl FakePresence {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Seed a live row for `user` on `node`.
    pub fn online(&self, user: &str, node: &str) {
        let record = PresenceRecord::connected_now(
            SessionId::generate(),
            UserId::from(user),
            TenantId::from("t1"),
            node,
        );
        self.rows.lock().push(record);
    }

    pub fn fail_lookups(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::SeqCst);
    }

    pub fn touches(&self) -> Vec<SessionId> {
        self.touches.lock().clone()
    }

    pub fn deletes(&self) -> Vec<SessionId> {
        self.deletes.lock().clone()
    }
}

#[async_trait]
impl PresenceBackend for FakePresence {
    async fn insert(&self, record: &PresenceRecord) -> courier_store::Result<()> {
        self.rows.lock().push(record.clone());
        Ok(())
    }

    async fn set_active(
        &self,
        session_id: &SessionId,
        at: DateTime<Utc>,
    ) -> courier_store::Result<bool> {
        self.touches.lock().push(session_id.clone());
        let mut rows = self.rows.lock();
        match rows.iter_mut().find(|r| &r.session_id == session_id) {
            Some(row) => {
                row.last_active_at = at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, session_id: &SessionId) -> courier_store::Result<bool> {
        self.deletes.lock().push(session_id.clone());
        let mut rows = self.rows.lock();
        let before = rows.len();
        rows.retain(|r| &r.session_id != session_id);
        Ok(rows.len() < before)
    }

    async fn find_online(
        &self,
        user_ids: &[UserId],
        since: DateTime<Utc>,
    ) -> courier_store::Result<Vec<OnlineEntry>> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(StoreError::Timeout {
                operation: "presence.find",
                timeout_ms: 1,
            });
        }
        Ok(self
            .rows
            .lock()
            .iter()
            .filter(|r| user_ids.contains(&r.user_id) && r.last_active_at >= since)
            .map(|r| OnlineEntry {
                user_id: r.user_id.clone(),
                node_name: r.node_name.clone(),
            })
            .collect())
    }
}

/// Pump context over a two-shard hub backed by `presence`.
pub fn ctx_with(presence: Arc<FakePresence>) -> (PumpContext, ShutdownCoordinator) {
    let shutdown = ShutdownCoordinator::new();
    let hub = Hub::start(
        &HubConfig {
            shard_count: 2,
            broadcast_queue_depth: 64,
            node: Arc::from("n1"),
        },
        &shutdown,
    );
    let ctx = PumpContext {
        hub,
        presence: Arc::new(PresenceStore::new(presence)),
        health_check_interval: Duration::from_secs(5),
        stale_after: Duration::from_secs(15),
        teardown_timeout: Duration::from_secs(3),
        shutdown: shutdown.token(),
    };
    (ctx, shutdown)
}

// ─────────────────────────────────────────────────────────────────────────────
// Bus
// ─────────────────────────────────────────────────────────────────────────────

/// Bus that fails according to a script, then accepts everything.
#[derive(Clone, Default)]
pub struct ScriptedBus {
    script: Arc<Mutex<VecDeque<Result<(), BusError>>>>,
    attempts: Arc<AtomicU32>,
    accepted: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl ScriptedBus {
    pub fn new(script: Vec<Result<(), BusError>>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into())),
            ..Self::default()
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Accepted payloads decoded as envelopes.
    pub fn envelopes(&self) -> Vec<CrossNodeEnvelope> {
        self.accepted
            .lock()
            .iter()
            .map(|p| serde_json::from_slice(p).unwrap())
            .collect()
    }
}

#[async_trait]
impl MessageBus for ScriptedBus {
    async fn publish(&self, _topic: &str, payload: Vec<u8>) -> Result<PublishAck, BusError> {
        let _ = self.attempts.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().pop_front();
        if let Some(Err(e)) = next {
            return Err(e);
        }
        self.accepted.lock().push(payload);
        Ok(PublishAck { receivers: 1 })
    }

    async fn subscribe(&self, _topic: &str) -> Result<Subscription, BusError> {
        Ok(futures::stream::pending().boxed())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Notifications
// ─────────────────────────────────────────────────────────────────────────────

enum GatewayMode {
    Ok,
    Partial(Vec<TokenFailure>),
    Direct,
}

/// Gateway recording the tokens of every call.
pub struct RecordingGateway {
    mode: GatewayMode,
    calls: Mutex<Vec<Vec<String>>>,
}

impl RecordingGateway {
    fn with_mode(mode: GatewayMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn ok() -> Arc<Self> {
        Self::with_mode(GatewayMode::Ok)
    }

    pub fn partial(failures: Vec<TokenFailure>) -> Arc<Self> {
        Self::with_mode(GatewayMode::Partial(failures))
    }

    pub fn failing_direct() -> Arc<Self> {
        Self::with_mode(GatewayMode::Direct)
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl PushGateway for RecordingGateway {
    async fn send(
        &self,
        tokens: &[DeviceToken],
        _notification: &Notification,
    ) -> Result<BatchReport, NotificationError> {
        self.calls
            .lock()
            .push(tokens.iter().map(|t| t.token.clone()).collect());
        match &self.mode {
            GatewayMode::Ok => Ok(BatchReport {
                success: tokens.len(),
                failure: 0,
            }),
            GatewayMode::Partial(failures) => Err(NotificationError::Partial {
                report: BatchReport {
                    success: tokens.len() - failures.len(),
                    failure: failures.len(),
                },
                failures: failures.clone(),
            }),
            GatewayMode::Direct => Err(NotificationError::Direct {
                reason: "provider unreachable".into(),
            }),
        }
    }
}

/// Token source over fixed `(user, token)` pairs.
#[derive(Default)]
pub struct FakeTokens {
    tokens: Mutex<Vec<DeviceToken>>,
    removed: Mutex<Vec<String>>,
}

impl FakeTokens {
    pub fn with(pairs: &[(&str, &str)]) -> Arc<Self> {
        let tokens = pairs
            .iter()
            .map(|(user, token)| DeviceToken {
                user_id: UserId::from(*user),
                token: (*token).to_string(),
                platform: "ios".into(),
            })
            .collect();
        Arc::new(Self {
            tokens: Mutex::new(tokens),
            removed: Mutex::new(Vec::new()),
        })
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().clone()
    }
}

#[async_trait]
impl DeviceTokenSource for FakeTokens {
    async fn tokens_for_users(&self, user_ids: &[UserId]) -> courier_store::Result<Vec<DeviceToken>> {
        Ok(self
            .tokens
            .lock()
            .iter()
            .filter(|t| user_ids.contains(&t.user_id))
            .cloned()
            .collect())
    }

    async fn remove_tokens(&self, tokens: &[String]) -> courier_store::Result<usize> {
        let mut held = self.tokens.lock();
        let before = held.len();
        held.retain(|t| !tokens.contains(&t.token));
        self.removed.lock().extend(tokens.iter().cloned());
        Ok(before - held.len())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Cluster
// ─────────────────────────────────────────────────────────────────────────────

/// Nodes sharing one presence table, bus, gateway and token source.
pub struct Cluster {
    pub shutdown: ShutdownCoordinator,
    presence: Arc<FakePresence>,
    bus: Arc<dyn MessageBus>,
    gateway: Arc<RecordingGateway>,
    tokens: Arc<FakeTokens>,
}

/// One node of a [`Cluster`].
pub struct TestNode {
    pub dispatcher: Arc<Dispatcher>,
    shutdown: tokio_util::sync::CancellationToken,
}

impl Cluster {
    pub fn new(
        presence: Arc<FakePresence>,
        bus: impl MessageBus + 'static,
        gateway: Arc<RecordingGateway>,
        tokens: Arc<FakeTokens>,
    ) -> Self {
        Self {
            shutdown: ShutdownCoordinator::new(),
            presence,
            bus: Arc::new(bus),
            gateway,
            tokens,
        }
    }

    pub fn node(&self, name: &str) -> TestNode {
        let node: Arc<str> = Arc::from(name);
        let hub = Hub::start(
            &HubConfig {
                shard_count: 2,
                broadcast_queue_depth: 64,
                node: node.clone(),
            },
            &self.shutdown,
        );
        let config = DispatcherConfig {
            node,
            topic: "chat.internal_broadcast".into(),
            health_check_interval: Duration::from_secs(5),
            stale_after: Duration::from_secs(15),
            teardown_timeout: Duration::from_secs(3),
            session_queue_depth: 16,
            notifications_enabled: true,
        };
        let deps = DispatcherDeps {
            hub,
            presence: Arc::new(PresenceStore::new(self.presence.clone())),
            bus: self.bus.clone(),
            gateway: self.gateway.clone(),
            tokens: self.tokens.clone(),
            policy: PublishFailurePolicy::default(),
            shutdown: self.shutdown.token(),
        };
        TestNode {
            dispatcher: Arc::new(Dispatcher::new(config, deps)),
            shutdown: self.shutdown.child_token(),
        }
    }
}

impl TestNode {
    /// Open a session without a write pump; events pile up in the queue.
    pub async fn connect(&self, user: &str, tenant: &str) -> (Arc<ClientSession>, SessionQueue) {
        self.dispatcher
            .open_session(UserId::from(user), TenantId::from(tenant))
            .await
            .unwrap()
    }

    /// Subscribe to the internal topic and consume in the background.
    pub async fn start_consumer(&self) {
        let subscription = self.dispatcher.subscribe_internal().await.unwrap();
        let dispatcher = self.dispatcher.clone();
        let cancel = self.shutdown.clone();
        drop(tokio::spawn(async move {
            dispatcher.consume(subscription, cancel).await;
        }));
    }
}
