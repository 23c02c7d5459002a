//! `CourierServer`: Axum HTTP + WebSocket transport over the [`Dispatcher`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::State;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use courier_core::errors::ErrorKind;
use courier_core::events::{Event, ScopedEvent};
use courier_core::ids::{SessionId, TenantId, UserId};
use courier_core::options::PushOptions;
use courier_settings::CourierSettings;
use courier_store::{DeviceTokenSource, PresenceStore};
use futures::StreamExt;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::bus::{BusError, MessageBus};
use crate::dispatch::{Dispatcher, DispatcherConfig, DispatcherDeps};
use crate::errors::DispatchError;
use crate::health::HealthResponse;
use crate::hub::{Hub, HubConfig};
use crate::metrics;
use crate::notify::PushGateway;
use crate::policy::PublishFailurePolicy;
use crate::shutdown::ShutdownCoordinator;
use crate::transport::WsSink;
use crate::watchdog::run_watchdog;

/// Header carrying the caller's user id.
pub const USER_HEADER: &str = "x-user-id";
/// Header carrying the caller's tenant.
pub const TENANT_HEADER: &str = "x-tenant-id";

/// Startup failures.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listener could not be bound.
    #[error("failed to bind listener: {0}")]
    Bind(#[from] std::io::Error),
    /// The cross-node subscription could not be established.
    #[error("failed to subscribe to the internal topic: {0}")]
    Bus(#[from] BusError),
}

impl ServerError {
    /// Classification of this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Bind(_) => ErrorKind::Unavailable,
            Self::Bus(e) => e.kind(),
        }
    }
}

/// Collaborators the binary builds from settings.
pub struct ServerDeps {
    /// Presence lookups.
    pub presence: Arc<PresenceStore>,
    /// Cross-node transport.
    pub bus: Arc<dyn MessageBus>,
    /// Offline notification delivery.
    pub gateway: Arc<dyn PushGateway>,
    /// Device tokens.
    pub tokens: Arc<dyn DeviceTokenSource>,
    /// Installed Prometheus recorder, if any.
    pub metrics: Option<PrometheusHandle>,
}

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Dispatch router of this node.
    pub dispatcher: Arc<Dispatcher>,
    /// Renders `/metrics`.
    pub metrics: Option<PrometheusHandle>,
    /// When the server started.
    pub start_time: Instant,
}

impl AppState {
    /// State for `dispatcher`, started now.
    pub fn new(dispatcher: Arc<Dispatcher>, metrics: Option<PrometheusHandle>) -> Self {
        Self {
            dispatcher,
            metrics,
            start_time: Instant::now(),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/subscribe", get(subscribe_handler))
        .route("/ping", post(ping_handler))
        .route("/push", post(push_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// The Courier node.
pub struct CourierServer {
    settings: CourierSettings,
    deps: ServerDeps,
}

impl CourierServer {
    /// Create a server from settings and prebuilt collaborators.
    pub fn new(settings: CourierSettings, deps: ServerDeps) -> Self {
        Self { settings, deps }
    }

    /// Start shards, background tasks and the listener.
    pub async fn start(self) -> Result<ServerHandle, ServerError> {
        let Self { settings, deps } = self;
        let listener =
            tokio::net::TcpListener::bind((settings.server.host.as_str(), settings.server.port))
                .await?;
        let addr = listener.local_addr()?;

        let shutdown = Arc::new(ShutdownCoordinator::new());
        let fanout = &settings.fanout;
        let node: Arc<str> = Arc::from(settings.node.name.as_str());

        let hub = Hub::start(
            &HubConfig {
                shard_count: fanout.resolved_shard_count(),
                broadcast_queue_depth: fanout.shard_queue_depth,
                node: node.clone(),
            },
            &shutdown,
        );

        let config = DispatcherConfig {
            node: node.clone(),
            topic: settings.bus.topic.clone(),
            health_check_interval: fanout.health_check_interval(),
            stale_after: fanout.stale_after(),
            teardown_timeout: fanout.teardown_timeout(),
            session_queue_depth: fanout.session_queue_depth,
            notifications_enabled: settings.notification.enabled,
        };
        let dispatcher = Arc::new(Dispatcher::new(
            config,
            DispatcherDeps {
                hub: hub.clone(),
                presence: deps.presence.clone(),
                bus: deps.bus,
                gateway: deps.gateway,
                tokens: deps.tokens,
                policy: PublishFailurePolicy::new(settings.bus.publish_retry.clone()),
                shutdown: shutdown.token(),
            },
        ));

        let subscription = match dispatcher.subscribe_internal().await {
            Ok(subscription) => subscription,
            Err(e) => {
                shutdown.shutdown();
                return Err(e.into());
            }
        };
        let consumer = dispatcher.clone();
        shutdown.spawn("bus-consumer", move |token| async move {
            consumer.consume(subscription, token).await;
        });

        let (period, warn_percent) =
            (fanout.deadlock_check_interval(), fanout.deadlock_warn_percent);
        shutdown.spawn("watchdog", move |token| {
            run_watchdog(hub, period, warn_percent, token)
        });

        let (sweep_every, ttl) = (fanout.health_check_interval(), settings.presence.cache_ttl());
        let presence = deps.presence;
        shutdown.spawn("presence-sweep", move |token| {
            sweep_presence_cache(presence, sweep_every, ttl, token)
        });

        info!(%addr, node = %node, "courier server started");

        let router = build_router(AppState::new(dispatcher.clone(), deps.metrics));
        let stop = shutdown.token();
        let server = tokio::spawn(async move {
            let serve = axum::serve(listener, router)
                .with_graceful_shutdown(async move { stop.cancelled().await });
            if let Err(e) = serve.await {
                error!(error = %e, "http server failed");
            }
        });

        Ok(ServerHandle {
            addr,
            dispatcher,
            shutdown,
            server,
            shutdown_timeout: Duration::from_millis(settings.server.shutdown_timeout_ms),
        })
    }
}

/// Handle returned by [`CourierServer::start`].
pub struct ServerHandle {
    addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    shutdown: Arc<ShutdownCoordinator>,
    server: JoinHandle<()>,
    shutdown_timeout: Duration,
}

impl ServerHandle {
    /// Bound address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Bound port.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Dispatch router, for in-process callers.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Stop accepting, cancel every task and wait for them.
    pub async fn shutdown(self) {
        self.shutdown.drain(self.shutdown_timeout).await;
        if tokio::time::timeout(self.shutdown_timeout, self.server)
            .await
            .is_err()
        {
            warn!("http server did not stop in time");
        }
        info!("courier server stopped");
    }
}

async fn sweep_presence_cache(
    presence: Arc<PresenceStore>,
    period: Duration,
    ttl: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let evicted = presence.invalidate_cache(ttl);
                if evicted > 0 {
                    debug!(evicted, remaining = presence.cached_users(), "presence cache swept");
                }
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

fn header_value(headers: &HeaderMap, name: &'static str) -> Result<String, DispatchError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
        .ok_or_else(|| DispatchError::InvalidArgument(format!("missing {name} header")))
}

fn identity(headers: &HeaderMap) -> Result<(UserId, TenantId), DispatchError> {
    let user = header_value(headers, USER_HEADER)?;
    let tenant = header_value(headers, TENANT_HEADER)?;
    Ok((user.into(), tenant.into()))
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidArgument | ErrorKind::ProtocolViolation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Transient | ErrorKind::Unavailable | ErrorKind::ResourceExhausted => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &DispatchError) -> Response {
    let kind = err.kind();
    let status = status_for(kind);
    if status.is_server_error() {
        warn!(error = %err, kind = %kind, "request failed");
    }
    let body = json!({ "error": kind.as_str(), "message": err.to_string() });
    (status, Json(body)).into_response()
}

/// GET /subscribe
async fn subscribe_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let (user_id, tenant_id) = match identity(&headers) {
        Ok(identity) => identity,
        Err(e) => return error_response(&e),
    };
    match ws {
        Ok(ws) => ws.on_upgrade(move |socket| {
            handle_socket(socket, state.dispatcher, user_id, tenant_id)
        }),
        Err(rejection) => rejection.into_response(),
    }
}

async fn handle_socket(
    mut socket: WebSocket,
    dispatcher: Arc<Dispatcher>,
    user_id: UserId,
    tenant_id: TenantId,
) {
    let (session, queue) = match dispatcher.open_session(user_id, tenant_id).await {
        Ok(opened) => opened,
        Err(e) => {
            warn!(error = %e, "failed to open session");
            let frame = CloseFrame {
                code: close_code::AGAIN,
                reason: "session unavailable".into(),
            };
            let _ = socket.send(Message::Close(Some(frame))).await;
            return;
        }
    };

    let (tx, mut rx) = socket.split();
    let reader = tokio::spawn({
        let session = session.clone();
        async move {
            while let Some(frame) = rx.next().await {
                match frame {
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            if session.close() {
                debug!(session_id = %session.id(), "client went away");
            }
        }
    });

    let end = dispatcher
        .serve_session(session.clone(), queue, WsSink::new(tx))
        .await;
    reader.abort();
    debug!(session_id = %session.id(), reason = end.as_str(), "websocket closed");
}

/// Body of `POST /ping`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingRequest {
    /// Session the caller holds.
    #[serde(default)]
    pub session_id: Option<SessionId>,
}

/// POST /ping
async fn ping_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<PingRequest>,
) -> Response {
    let result = match identity(&headers) {
        Ok((user_id, tenant_id)) => {
            state
                .dispatcher
                .ping(&user_id, &tenant_id, body.session_id)
                .await
        }
        Err(e) => Err(e),
    };
    match result {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e),
    }
}

/// Body of `POST /push`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    /// Recipients.
    pub user_ids: Vec<UserId>,
    /// Tenant the event belongs to; missing is treated like blank.
    #[serde(default)]
    pub tenant_id: TenantId,
    /// The event.
    pub event: Event,
    /// Notification options; ignored for deletions.
    #[serde(default)]
    pub options: PushOptions,
}

/// POST /push
async fn push_handler(State(state): State<AppState>, Json(body): Json<PushRequest>) -> Response {
    let PushRequest {
        user_ids,
        tenant_id,
        event,
        options,
    } = body;
    if tenant_id.is_blank() {
        return error_response(&DispatchError::InvalidArgument("tenantId is required".into()));
    }

    let scoped = ScopedEvent::new(tenant_id, event);
    let result = if matches!(scoped.event, Event::DeleteMessage(_)) {
        state
            .dispatcher
            .push_message_deleted(&user_ids, scoped)
            .await
    } else {
        state
            .dispatcher
            .push_message(&user_ids, scoped, &options)
            .await
    };
    match result {
        Ok(report) => Json(report).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let hub = state.dispatcher.hub();
    Json(HealthResponse::snapshot(
        state.start_time,
        state.dispatcher.node(),
        hub.connection_count(),
        hub.shard_count(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            metrics::render(handle),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
