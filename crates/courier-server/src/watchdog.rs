//! Deadlock watchdog.
//!
//! A shard whose broadcast queue sits at the edge of its capacity has
//! stopped keeping up, usually because its loop is wedged. The watchdog
//! samples every queue, exports the depth as a gauge, and logs a diagnostic
//! dump for each shard over the threshold. It never intervenes.

use std::sync::Arc;
use std::time::Duration;

use metrics::gauge;
use tokio::time::{MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::hub::{Hub, ProbeSnapshot, Shard};
use crate::metrics::SHARD_QUEUE_DEPTH;

/// A shard over the warning threshold.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardAlarm {
    /// Shard index.
    pub shard: usize,
    /// Broadcasts waiting.
    pub depth: usize,
    /// Queue capacity.
    pub capacity: usize,
    /// Sessions indexed.
    pub connections: usize,
    /// Loop progress at sampling time.
    pub probe: ProbeSnapshot,
}

/// Whether `depth` reaches `percent` of `capacity`.
fn over_threshold(depth: usize, capacity: usize, percent: u8) -> bool {
    capacity > 0 && depth.saturating_mul(100) >= capacity.saturating_mul(usize::from(percent))
}

/// Sample every shard, update the depth gauge, and return the ones at or
/// above `warn_percent` of capacity.
pub fn check_shards(shards: &[Shard], warn_percent: u8) -> Vec<ShardAlarm> {
    let mut alarms = Vec::new();
    for shard in shards {
        let depth = shard.broadcast_queue_depth();
        let capacity = shard.broadcast_queue_capacity();
        #[allow(clippy::cast_precision_loss)]
        gauge!(SHARD_QUEUE_DEPTH, "shard" => shard.id().to_string()).set(depth as f64);

        if over_threshold(depth, capacity, warn_percent) {
            alarms.push(ShardAlarm {
                shard: shard.id(),
                depth,
                capacity,
                connections: shard.connection_count(),
                probe: shard.probe(),
            });
        }
    }
    alarms
}

fn report(alarm: &ShardAlarm) {
    error!(
        shard = alarm.shard,
        queue_depth = alarm.depth,
        capacity = alarm.capacity,
        connections = alarm.connections,
        phase = alarm.probe.phase.as_str(),
        since_progress_ms = u64::try_from(alarm.probe.since_progress.as_millis()).unwrap_or(u64::MAX),
        current_user = alarm.probe.current_user.as_deref().unwrap_or("-"),
        "shard broadcast queue near capacity, possible deadlock"
    );
}

/// Check `hub` every `period` until `cancel` fires.
pub async fn run_watchdog(
    hub: Arc<Hub>,
    period: Duration,
    warn_percent: u8,
    cancel: CancellationToken,
) {
    let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(period_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX), "watchdog started");

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                for alarm in check_shards(hub.shards(), warn_percent) {
                    report(&alarm);
                }
            }
        }
    }
    debug!("watchdog stopped");
}
