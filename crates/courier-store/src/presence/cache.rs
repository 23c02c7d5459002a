//! Per-user node list cache.
//!
//! Safe for concurrent readers and writers; entries are only ever replaced
//! whole, and removed by the sweep.

use chrono::{DateTime, Utc};
use courier_core::ids::UserId;
use dashmap::DashMap;

#[derive(Clone, Debug)]
struct CacheEntry {
    nodes: Vec<String>,
    cached_at: DateTime<Utc>,
}

/// Cached `user -> [node]` lookups stamped with the time they were fetched.
#[derive(Debug, Default)]
pub struct PresenceCache {
    entries: DashMap<UserId, CacheEntry>,
}

impl PresenceCache {
    /// Nodes for `user` if an entry exists and was cached at or after `since`.
    pub fn get_fresh(&self, user: &UserId, since: DateTime<Utc>) -> Option<Vec<String>> {
        self.entries
            .get(user)
            .filter(|e| e.cached_at >= since)
            .map(|e| e.nodes.clone())
    }

    /// Replace the entry for `user`.
    pub fn put(&self, user: UserId, nodes: Vec<String>, cached_at: DateTime<Utc>) {
        let _ = self.entries.insert(user, CacheEntry { nodes, cached_at });
    }

    /// Drop entries cached before `cutoff`. Returns how many were removed.
    pub fn evict_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.cached_at >= cutoff);
        before.saturating_sub(self.entries.len())
    }

    /// Number of cached users.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
