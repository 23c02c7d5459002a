//! Package-level constants and fan-out defaults.

use std::time::Duration;

/// Current version of Courier (sourced from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Package name.
pub const NAME: &str = "courier";

/// How often a session checks its own liveness.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// A session is stale once this many health-check intervals pass without a ping.
pub const STALE_AFTER_INTERVALS: u32 = 3;

/// How often the deadlock watchdog inspects shard queues.
pub const DEADLOCK_CHECK_INTERVAL: Duration = Duration::from_secs(15);

/// Outbound queue depth of a single client session.
pub const SESSION_QUEUE_DEPTH: usize = 256;

/// Broadcast queue depth of a single shard.
pub const SHARD_BROADCAST_QUEUE_DEPTH: usize = 4096;

/// Register/unregister control queue depth of a single shard.
pub const SHARD_CONTROL_QUEUE_DEPTH: usize = 1;

/// Queue occupancy (percent) at which the watchdog raises an alarm.
pub const DEADLOCK_WARN_PERCENT: u8 = 99;

/// Upper bound on presence cleanup during session teardown.
pub const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(3);

/// Default pub/sub topic for cross-node envelopes.
pub const INTERNAL_BROADCAST_TOPIC: &str = "chat.internal_broadcast";

/// Number of shards for the given parallelism: two per core, never zero.
#[must_use]
pub fn default_shard_count(parallelism: usize) -> usize {
    parallelism.max(1) * 2
}
