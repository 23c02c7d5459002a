//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

pub use courier_store::presence::{
    CACHE_HITS_TOTAL as PRESENCE_CACHE_HITS_TOTAL, CACHE_MISSES_TOTAL as PRESENCE_CACHE_MISSES_TOTAL,
};

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render `/metrics`. Call once at
/// startup before any metrics are recorded.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across modules.

/// Live client sessions on this node (gauge).
pub const SESSIONS_ACTIVE: &str = "courier_sessions_active";
/// Sessions opened (counter).
pub const SESSIONS_TOTAL: &str = "courier_sessions_total";
/// Sessions dropped by a shard or the write pump (counter, labels: reason).
pub const SESSION_DROPS_TOTAL: &str = "courier_session_drops_total";
/// Broadcasts refused because the tenant did not match the session (counter).
pub const TENANT_MISMATCH_TOTAL: &str = "courier_tenant_mismatch_total";
/// Events accepted into a session queue (counter).
pub const BROADCAST_DELIVERIES_TOTAL: &str = "courier_broadcast_deliveries_total";
/// Envelopes published to other nodes (counter).
pub const CROSS_NODE_PUBLISH_TOTAL: &str = "courier_cross_node_publish_total";
/// Failed publishes (counter, labels: action).
pub const PUBLISH_FAILURES_TOTAL: &str = "courier_publish_failures_total";
/// Notification batches (counter, labels: outcome).
pub const NOTIFICATIONS_TOTAL: &str = "courier_notifications_total";
/// Broadcast queue occupancy per shard (gauge, labels: shard).
pub const SHARD_QUEUE_DEPTH: &str = "courier_shard_queue_depth";
/// End-to-end `push_message` latency (histogram).
pub const PUSH_DURATION_SECONDS: &str = "courier_push_duration_seconds";
