use std::path::PathBuf;
use std::time::Duration;

use courier_core::constants;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Shard, session, and watchdog tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FanoutSettings {
    /// Session liveness check period.
    pub health_check_interval_ms: u64,
    /// Missed intervals before a session is considered stale.
    pub stale_after_intervals: u32,
    /// Deadlock watchdog period.
    pub deadlock_check_interval_ms: u64,
    /// Broadcast queue occupancy (percent) that triggers the watchdog alarm.
    pub deadlock_warn_percent: u8,
    /// Outbound queue depth per session.
    pub session_queue_depth: usize,
    /// Broadcast queue depth per shard.
    pub shard_queue_depth: usize,
    /// Fixed shard count; `None` uses twice the available parallelism.
    pub shard_count: Option<usize>,
    /// Bound on presence cleanup when a session ends.
    pub teardown_timeout_ms: u64,
}

impl Default for FanoutSettings {
    #[allow(clippy::cast_possible_truncation)]
    fn default() -> Self {
        Self {
            health_check_interval_ms: constants::HEALTH_CHECK_INTERVAL.as_millis() as u64,
            stale_after_intervals: constants::STALE_AFTER_INTERVALS,
            deadlock_check_interval_ms: constants::DEADLOCK_CHECK_INTERVAL.as_millis() as u64,
            deadlock_warn_percent: constants::DEADLOCK_WARN_PERCENT,
            session_queue_depth: constants::SESSION_QUEUE_DEPTH,
            shard_queue_depth: constants::SHARD_BROADCAST_QUEUE_DEPTH,
            shard_count: None,
            teardown_timeout_ms: constants::TEARDOWN_TIMEOUT.as_millis() as u64,
        }
    }
}

impl FanoutSettings {
    /// Health-check interval as a [`Duration`].
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// Idle time after which a session is torn down.
    pub fn stale_after(&self) -> Duration {
        self.health_check_interval() * self.stale_after_intervals
    }

    /// Deadlock watchdog interval as a [`Duration`].
    pub fn deadlock_check_interval(&self) -> Duration {
        Duration::from_millis(self.deadlock_check_interval_ms)
    }

    /// Teardown timeout as a [`Duration`].
    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }

    /// Configured shard count, or twice the machine's parallelism.
    pub fn resolved_shard_count(&self) -> usize {
        self.shard_count.filter(|n| *n > 0).unwrap_or_else(|| {
            let parallelism = std::thread::available_parallelism().map_or(1, usize::from);
            constants::default_shard_count(parallelism)
        })
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.health_check_interval_ms == 0 {
            return Err(SettingsError::invalid(
                "fanout.healthCheckIntervalMs",
                "must be > 0",
            ));
        }
        if self.session_queue_depth == 0 || self.shard_queue_depth == 0 {
            return Err(SettingsError::invalid(
                "fanout.sessionQueueDepth",
                "queue depths must be > 0",
            ));
        }
        if self.deadlock_warn_percent == 0 || self.deadlock_warn_percent > 100 {
            return Err(SettingsError::invalid(
                "fanout.deadlockWarnPercent",
                "must be within 1..=100",
            ));
        }
        Ok(())
    }
}

/// Presence persistence and cache settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PresenceSettings {
    /// `SQLite` database path (`~` expands to `$HOME`).
    pub db_path: String,
    /// Connection pool size.
    pub pool_size: u32,
    /// `SQLite` busy timeout.
    pub busy_timeout_ms: u64,
    /// Cache entries older than this are evicted by the sweep.
    pub cache_ttl_ms: u64,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            db_path: "~/.courier/courier.db".to_string(),
            pool_size: 8,
            busy_timeout_ms: 5_000,
            cache_ttl_ms: 15_000,
        }
    }
}

impl PresenceSettings {
    /// Cache TTL as a [`Duration`].
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    /// Database path with a leading `~` expanded.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_home(&self.db_path)
    }
}

pub(crate) fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(rest)
        }
        None => PathBuf::from(path),
    }
}
