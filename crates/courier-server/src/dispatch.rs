//! Dispatch router: decides where each recipient of an event lives.
//!
//! For every push the router resolves recipients through the
//! [`PresenceStore`], delivers to sessions on this node through the [`Hub`],
//! notifies recipients with no live session, and publishes one
//! [`CrossNodeEnvelope`] for everyone on other nodes. The consumer side of
//! that envelope is [`Dispatcher::handle_internal_broadcast`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use courier_core::events::{CrossNodeEnvelope, Event, NewMessage, ScopedEvent};
use courier_core::ids::{SessionId, TenantId, UserId};
use courier_core::options::{NotificationOpts, PushOptions};
use courier_store::{DeviceTokenSource, PresenceRecord, PresenceStore};
use futures::StreamExt;
use metrics::{counter, gauge, histogram};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::bus::{BusError, MessageBus, Subscription};
use crate::errors::DispatchError;
use crate::hub::Hub;
use crate::metrics::{NOTIFICATIONS_TOTAL, PUSH_DURATION_SECONDS, SESSIONS_ACTIVE, SESSIONS_TOTAL};
use crate::notify::{NotificationError, PushGateway, build_notification};
use crate::policy::{PublishFailurePolicy, PublishOutcome};
use crate::session::{ClientSession, PumpContext, SessionEnd, SessionQueue, run_write_pump, teardown};
use crate::transport::EventSink;

/// Static parameters of a [`Dispatcher`].
#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    /// This node's name as recorded in presence rows.
    pub node: Arc<str>,
    /// Bus topic for cross-node envelopes.
    pub topic: String,
    /// Session liveness timer period.
    pub health_check_interval: Duration,
    /// Idle time after which a session is stale; also the presence lookback.
    pub stale_after: Duration,
    /// Upper bound on presence cleanup at teardown.
    pub teardown_timeout: Duration,
    /// Outbound queue depth of each session.
    pub session_queue_depth: usize,
    /// Master switch for offline notifications.
    pub notifications_enabled: bool,
}

/// What a push did.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushReport {
    /// Recipients with a session on this node.
    pub local: usize,
    /// Recipients on other nodes.
    pub remote: usize,
    /// Recipients with no recent session.
    pub offline: usize,
    /// Whether an envelope was accepted by the bus.
    pub published: bool,
    /// Presence lookup failed; only local delivery was attempted.
    pub degraded: bool,
}

/// External collaborators of a [`Dispatcher`].
pub struct DispatcherDeps {
    /// Connection registry of this node.
    pub hub: Arc<Hub>,
    /// Presence lookups.
    pub presence: Arc<PresenceStore>,
    /// Cross-node transport.
    pub bus: Arc<dyn MessageBus>,
    /// Offline notification delivery.
    pub gateway: Arc<dyn PushGateway>,
    /// Device tokens of offline recipients.
    pub tokens: Arc<dyn DeviceTokenSource>,
    /// Publish retry behaviour.
    pub policy: PublishFailurePolicy,
    /// Server shutdown.
    pub shutdown: CancellationToken,
}

/// Routes events to local sessions, other nodes and the push gateway.
pub struct Dispatcher {
    config: DispatcherConfig,
    hub: Arc<Hub>,
    presence: Arc<PresenceStore>,
    bus: Arc<dyn MessageBus>,
    gateway: Arc<dyn PushGateway>,
    tokens: Arc<dyn DeviceTokenSource>,
    policy: PublishFailurePolicy,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("node", &self.config.node)
            .field("topic", &self.config.topic)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Assemble a dispatcher.
    pub fn new(config: DispatcherConfig, deps: DispatcherDeps) -> Self {
        Self {
            config,
            hub: deps.hub,
            presence: deps.presence,
            bus: deps.bus,
            gateway: deps.gateway,
            tokens: deps.tokens,
            policy: deps.policy,
            shutdown: deps.shutdown,
        }
    }

    /// This node's name.
    pub fn node(&self) -> &str {
        &self.config.node
    }

    /// Connection registry.
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Presence store.
    pub fn presence(&self) -> &Arc<PresenceStore> {
        &self.presence
    }

    /// Static configuration.
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    // ─────────────────────────────────────────────────────────────────────
    // Push
    // ─────────────────────────────────────────────────────────────────────

    /// Deliver `event` to `user_ids` wherever they are connected, notifying
    /// offline recipients of new messages when `options` asks for it.
    ///
    /// A gateway failure that affected the whole batch is returned after the
    /// cross-node publish has completed.
    #[instrument(skip_all, fields(kind = event.event.kind(), recipients = user_ids.len()))]
    pub async fn push_message(
        &self,
        user_ids: &[UserId],
        event: ScopedEvent,
        options: &PushOptions,
    ) -> Result<PushReport, DispatchError> {
        self.fan_out(user_ids, event, Some(&options.notification)).await
    }

    /// Deliver a deletion. Never notifies.
    #[instrument(skip_all, fields(kind = event.event.kind(), recipients = user_ids.len()))]
    pub async fn push_message_deleted(
        &self,
        user_ids: &[UserId],
        event: ScopedEvent,
    ) -> Result<PushReport, DispatchError> {
        self.fan_out(user_ids, event, None).await
    }

    async fn fan_out(
        &self,
        user_ids: &[UserId],
        event: ScopedEvent,
        notification: Option<&NotificationOpts>,
    ) -> Result<PushReport, DispatchError> {
        let started = Instant::now();
        let result = self.fan_out_inner(user_ids, event, notification).await;
        histogram!(PUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        result
    }

    async fn fan_out_inner(
        &self,
        user_ids: &[UserId],
        event: ScopedEvent,
        notification: Option<&NotificationOpts>,
    ) -> Result<PushReport, DispatchError> {
        let users = dedupe(user_ids);
        if users.is_empty() {
            return Ok(PushReport::default());
        }
        let event = Arc::new(event);

        let mut by_node = match self.presence.find(&users, self.lookback()).await {
            Ok(map) => map,
            Err(e) => {
                warn!(
                    node = %self.config.node,
                    error = %e,
                    kind = %e.kind(),
                    "presence lookup failed, delivering to local sessions only"
                );
                self.hub.broadcast_many(&users, &event).await?;
                return Ok(PushReport {
                    local: users.len(),
                    degraded: true,
                    ..PushReport::default()
                });
            }
        };

        let online: HashSet<&UserId> = by_node.values().flatten().collect();
        let offline: Vec<UserId> = users
            .iter()
            .filter(|u| !online.contains(u))
            .cloned()
            .collect();

        let local = by_node.remove(self.config.node.as_ref()).unwrap_or_default();
        self.hub.broadcast_many(&local, &event).await?;

        let gateway_failure = match (notification, &event.event) {
            (Some(opts), Event::NewMessage(message)) if opts.enabled => {
                self.notify_offline(&offline, message, opts).await
            }
            _ => None,
        };

        by_node.retain(|_, users| !users.is_empty());
        let mut report = PushReport {
            local: local.len(),
            remote: by_node.values().map(Vec::len).sum(),
            offline: offline.len(),
            ..PushReport::default()
        };

        if !by_node.is_empty() {
            let envelope = CrossNodeEnvelope {
                tenant_id: event.tenant_id.clone(),
                event: event.event.clone(),
                node_receive: by_node,
            };
            let payload = serde_json::to_vec(&envelope).map_err(BusError::from)?;
            let outcome = self
                .policy
                .publish(self.bus.as_ref(), &self.config.topic, payload)
                .await?;
            report.published = matches!(outcome, PublishOutcome::Delivered(_));
        }

        match gateway_failure {
            Some(e) => Err(e.into()),
            None => Ok(report),
        }
    }

    /// Notify `offline` recipients. Returns the error only when the gateway
    /// rejected the whole batch.
    async fn notify_offline(
        &self,
        offline: &[UserId],
        message: &NewMessage,
        opts: &NotificationOpts,
    ) -> Option<NotificationError> {
        if !self.config.notifications_enabled {
            return None;
        }
        let targets: Vec<UserId> = offline
            .iter()
            .filter(|u| !opts.ignored_users.contains(u))
            .cloned()
            .collect();
        if targets.is_empty() {
            return None;
        }

        let tokens = match self.tokens.tokens_for_users(&targets).await {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!(error = %e, users = targets.len(), "device token lookup failed");
                return None;
            }
        };
        if tokens.is_empty() {
            debug!(users = targets.len(), "no device tokens for offline recipients");
            return None;
        }

        let notification = build_notification(message, opts);
        match self.gateway.send(&tokens, &notification).await {
            Ok(report) => {
                counter!(NOTIFICATIONS_TOTAL, "outcome" => "sent").increment(1);
                debug!(sent = report.success, "notifications sent");
                None
            }
            Err(NotificationError::Partial { report, failures }) => {
                counter!(NOTIFICATIONS_TOTAL, "outcome" => "partial").increment(1);
                warn!(
                    success = report.success,
                    failure = report.failure,
                    "some notifications failed"
                );
                self.forget_dead_tokens(&failures).await;
                None
            }
            Err(e @ NotificationError::Direct { .. }) => {
                counter!(NOTIFICATIONS_TOTAL, "outcome" => "failed").increment(1);
                error!(error = %e, tokens = tokens.len(), "notification batch failed");
                Some(e)
            }
        }
    }

    async fn forget_dead_tokens(&self, failures: &[crate::notify::TokenFailure]) {
        let dead: Vec<String> = failures
            .iter()
            .filter(|f| f.is_dead_token())
            .map(|f| f.token.clone())
            .collect();
        if dead.is_empty() {
            return;
        }
        match self.tokens.remove_tokens(&dead).await {
            Ok(removed) => info!(removed, "removed rejected device tokens"),
            Err(e) => warn!(error = %e, "failed to remove rejected device tokens"),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Cross-node consumer
    // ─────────────────────────────────────────────────────────────────────

    /// Deliver this node's slice of an envelope received from the bus.
    /// Returns how many recipients were queued.
    pub async fn handle_internal_broadcast(&self, payload: &[u8]) -> Result<usize, DispatchError> {
        let envelope: CrossNodeEnvelope = serde_json::from_slice(payload)?;
        let Some(recipients) = envelope.recipients_for(&self.config.node) else {
            debug!(node = %self.config.node, "envelope has no recipients on this node");
            return Ok(0);
        };
        let event = Arc::new(envelope.scoped());
        self.hub.broadcast_many(recipients, &event).await?;
        Ok(recipients.len())
    }

    /// Subscribe to the cross-node topic.
    pub async fn subscribe_internal(&self) -> Result<Subscription, BusError> {
        self.bus.subscribe(&self.config.topic).await
    }

    /// Feed `subscription` into [`Self::handle_internal_broadcast`] until
    /// `cancel` fires or the subscription ends.
    pub async fn consume(&self, mut subscription: Subscription, cancel: CancellationToken) {
        info!(node = %self.config.node, topic = %self.config.topic, "bus consumer started");
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                payload = subscription.next() => {
                    let Some(payload) = payload else {
                        warn!(topic = %self.config.topic, "bus subscription ended");
                        break;
                    };
                    if let Err(e) = self.handle_internal_broadcast(&payload).await {
                        warn!(error = %e, bytes = payload.len(), "dropping cross-node envelope");
                    }
                }
            }
        }
        debug!(node = %self.config.node, "bus consumer stopped");
    }

    // ─────────────────────────────────────────────────────────────────────
    // Sessions
    // ─────────────────────────────────────────────────────────────────────

    /// Unary ping: re-broadcast `Ping{session_id}` to every node holding
    /// `user_id`. No notifications.
    pub async fn ping(
        &self,
        user_id: &UserId,
        tenant_id: &TenantId,
        session_id: Option<SessionId>,
    ) -> Result<PushReport, DispatchError> {
        let session_id = session_id
            .filter(|s| !s.is_blank())
            .ok_or_else(|| DispatchError::InvalidArgument("sessionId is required".into()))?;
        validate_identity(user_id, tenant_id)?;

        let nodes = self
            .presence
            .find(std::slice::from_ref(user_id), self.lookback())
            .await?;
        if nodes.is_empty() {
            return Err(DispatchError::NotOnline(user_id.clone()));
        }

        let event = ScopedEvent::new(tenant_id.clone(), Event::ping(session_id));
        self.fan_out(std::slice::from_ref(user_id), event, None).await
    }

    /// Create a session for a newly connected client: persist presence and
    /// index it on its shard.
    pub async fn open_session(
        &self,
        user_id: UserId,
        tenant_id: TenantId,
    ) -> Result<(Arc<ClientSession>, SessionQueue), DispatchError> {
        validate_identity(&user_id, &tenant_id)?;
        let (session, queue) =
            ClientSession::new(user_id, tenant_id, self.config.session_queue_depth);

        let record = PresenceRecord::connected_now(
            session.id().clone(),
            session.user_id().clone(),
            session.tenant_id().clone(),
            self.config.node.as_ref(),
        );
        self.presence.insert(&record).await?;

        if let Err(e) = self.hub.register(session.clone()).await {
            let _ = session.close();
            if let Err(cleanup) = self.presence.delete(session.id()).await {
                warn!(session_id = %session.id(), error = %cleanup, "failed to release presence");
            }
            return Err(e.into());
        }

        counter!(SESSIONS_TOTAL).increment(1);
        gauge!(SESSIONS_ACTIVE).increment(1.0);
        info!(
            session_id = %session.id(),
            user_id = %session.user_id(),
            tenant_id = %session.tenant_id(),
            node = %self.config.node,
            "session opened"
        );
        Ok((session, queue))
    }

    /// Greet the client with `Ping{sessionId}` and pump events until the
    /// session ends.
    pub async fn serve_session<S: EventSink>(
        &self,
        session: Arc<ClientSession>,
        queue: SessionQueue,
        mut sink: S,
    ) -> SessionEnd {
        let ctx = self.pump_context();
        if let Err(e) = sink.send(&Event::ping(session.id().clone())).await {
            debug!(session_id = %session.id(), error = %e, "greeting failed");
            let _ = teardown(&session, &ctx).await;
            return SessionEnd::Transport;
        }
        run_write_pump(session, queue, sink, &ctx).await
    }

    /// Everything a write pump needs.
    pub fn pump_context(&self) -> PumpContext {
        PumpContext {
            hub: self.hub.clone(),
            presence: self.presence.clone(),
            health_check_interval: self.config.health_check_interval,
            stale_after: self.config.stale_after,
            teardown_timeout: self.config.teardown_timeout,
            shutdown: self.shutdown.clone(),
        }
    }

    fn lookback(&self) -> chrono::DateTime<Utc> {
        let now = Utc::now();
        chrono::Duration::from_std(self.config.stale_after)
            .ok()
            .and_then(|d| now.checked_sub_signed(d))
            .unwrap_or(now)
    }
}

fn validate_identity(user_id: &UserId, tenant_id: &TenantId) -> Result<(), DispatchError> {
    if user_id.is_blank() {
        return Err(DispatchError::InvalidArgument("user id is required".into()));
    }
    if tenant_id.is_blank() {
        return Err(DispatchError::InvalidArgument("tenant id is required".into()));
    }
    Ok(())
}

fn dedupe(user_ids: &[UserId]) -> Vec<UserId> {
    let mut seen = HashSet::with_capacity(user_ids.len());
    user_ids
        .iter()
        .filter(|u| !u.is_blank() && seen.insert(*u))
        .cloned()
        .collect()
}
