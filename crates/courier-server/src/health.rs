//! `/health` body.

use std::time::Instant;

use serde::Serialize;

/// Liveness report for load balancers and operators.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always `"ok"`.
    pub status: &'static str,
    /// Node name as registered in presence rows.
    pub node: String,
    /// Sessions indexed across all shards.
    pub connections: usize,
    pub shards: usize,
    /// Whole seconds since the server started.
    pub uptime_secs: u64,
}

impl HealthResponse {
    /// Snapshot the node's counters. A node that can answer is `"ok"`.
    pub fn snapshot(started: Instant, node: &str, connections: usize, shards: usize) -> Self {
        Self {
            status: "ok",
            node: node.to_owned(),
            connections,
            shards,
            uptime_secs: started.elapsed().as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn fresh_node_reports_ok() {
        let resp = HealthResponse::snapshot(Instant::now(), "n1", 0, 4);
        assert_eq!(resp.status, "ok");
        assert_eq!(resp.node, "n1");
        assert!(resp.uptime_secs < 2);
    }

    #[test]
    fn uptime_counts_from_start() {
        let Some(started) = Instant::now().checked_sub(Duration::from_secs(90)) else {
            return;
        };
        assert!(HealthResponse::snapshot(started, "n1", 0, 1).uptime_secs >= 89);
    }

    #[test]
    fn wire_shape() {
        let body = serde_json::to_value(HealthResponse::snapshot(Instant::now(), "n1", 2, 8)).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["node"], "n1");
        assert_eq!(body["connections"], 2);
        assert_eq!(body["shards"], 8);
        assert!(body["uptimeSecs"].is_u64());
    }
}
