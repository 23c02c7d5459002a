//! Two-tier presence: which node holds each user's live sessions.
//!
//! Every fan-out needs a presence lookup, so reads go through
//! [`PresenceCache`] first. The [`PresenceBackend`] stays authoritative:
//! connect inserts, heartbeats touch, disconnect deletes, and none of those
//! writes touch the cache. Only users found online are cached, so a user who
//! just connected is never hidden behind an earlier "offline" answer. Entries
//! age out by comparison with the caller's `since` threshold and by the
//! periodic [`PresenceStore::invalidate_cache`] sweep.

mod cache;
mod sqlite;

pub use cache::PresenceCache;
pub use sqlite::SqlitePresenceBackend;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::ids::{SessionId, TenantId, UserId};
use metrics::counter;
use tracing::debug;

use crate::errors::Result;

/// Counter of user lookups answered from the cache.
pub const CACHE_HITS_TOTAL: &str = "courier_presence_cache_hits_total";
/// Counter of user lookups that fell through to the backend.
pub const CACHE_MISSES_TOTAL: &str = "courier_presence_cache_misses_total";

/// Online recipients grouped by node name.
pub type NodeMap = HashMap<String, Vec<UserId>>;

/// A live session as persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PresenceRecord {
    /// Session id (primary key).
    pub session_id: SessionId,
    /// Owning user.
    pub user_id: UserId,
    /// Tenant of the session.
    pub tenant_id: TenantId,
    /// Node holding the session.
    pub node_name: String,
    /// Last heartbeat.
    pub last_active_at: DateTime<Utc>,
    /// Connect time.
    pub created_at: DateTime<Utc>,
}

impl PresenceRecord {
    /// Record for a session connecting now.
    pub fn connected_now(
        session_id: SessionId,
        user_id: UserId,
        tenant_id: TenantId,
        node_name: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            user_id,
            tenant_id,
            node_name: node_name.into(),
            last_active_at: now,
            created_at: now,
        }
    }
}

/// One `(user, node)` pair reported online by the backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OnlineEntry {
    /// User with at least one recent session.
    pub user_id: UserId,
    /// Node holding that session.
    pub node_name: String,
}

/// Authoritative presence storage.
#[async_trait]
pub trait PresenceBackend: Send + Sync {
    /// Persist a newly connected session.
    async fn insert(&self, record: &PresenceRecord) -> Result<()>;

    /// Advance a session's `last_active_at`. Returns whether the row exists.
    async fn set_active(&self, session_id: &SessionId, at: DateTime<Utc>) -> Result<bool>;

    /// Remove a session. Returns whether a row was removed.
    async fn delete(&self, session_id: &SessionId) -> Result<bool>;

    /// `(user, node)` pairs for `user_ids` active at or after `since`.
    async fn find_online(
        &self,
        user_ids: &[UserId],
        since: DateTime<Utc>,
    ) -> Result<Vec<OnlineEntry>>;
}

/// Cached presence lookups over a [`PresenceBackend`].
pub struct PresenceStore {
    backend: Arc<dyn PresenceBackend>,
    cache: PresenceCache,
}

impl std::fmt::Debug for PresenceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceStore")
            .field("cached_users", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl PresenceStore {
    /// Wrap a backend with an empty cache.
    pub fn new(backend: Arc<dyn PresenceBackend>) -> Self {
        Self {
            backend,
            cache: PresenceCache::default(),
        }
    }

    /// Resolve `user_ids` to the nodes holding their sessions.
    ///
    /// Users whose cache entry is missing or was fetched before `since` are
    /// looked up in one backend call. Users found online are written back
    /// before merging; offline users are not cached and do not appear in the
    /// returned map.
    pub async fn find(&self, user_ids: &[UserId], since: DateTime<Utc>) -> Result<NodeMap> {
        let mut seen = HashSet::with_capacity(user_ids.len());
        let mut resolved: Vec<(UserId, Vec<String>)> = Vec::with_capacity(user_ids.len());
        let mut misses: Vec<UserId> = Vec::new();

        for user in user_ids {
            if !seen.insert(user) {
                continue;
            }
            match self.cache.get_fresh(user, since) {
                Some(nodes) => resolved.push((user.clone(), nodes)),
                None => misses.push(user.clone()),
            }
        }

        counter!(CACHE_HITS_TOTAL).increment(resolved.len() as u64);

        if !misses.is_empty() {
            counter!(CACHE_MISSES_TOTAL).increment(misses.len() as u64);
            debug!(misses = misses.len(), hits = resolved.len(), "presence cache miss");

            let rows = self.backend.find_online(&misses, since).await?;
            let mut per_user: HashMap<UserId, Vec<String>> = HashMap::new();
            for row in rows {
                let nodes = per_user.entry(row.user_id).or_default();
                if !nodes.contains(&row.node_name) {
                    nodes.push(row.node_name);
                }
            }

            let cached_at = Utc::now();
            for (user, nodes) in per_user {
                self.cache.put(user.clone(), nodes.clone(), cached_at);
                resolved.push((user, nodes));
            }
        }

        let mut by_node = NodeMap::new();
        for (user, nodes) in resolved {
            for node in nodes {
                by_node.entry(node).or_default().push(user.clone());
            }
        }
        Ok(by_node)
    }

    /// Persist a newly connected session.
    pub async fn insert(&self, record: &PresenceRecord) -> Result<()> {
        self.backend.insert(record).await
    }

    /// Record a heartbeat for `session_id`.
    pub async fn set_active(&self, session_id: &SessionId, at: DateTime<Utc>) -> Result<bool> {
        self.backend.set_active(session_id, at).await
    }

    /// Remove the row for `session_id`; removing a missing row is not an error.
    pub async fn delete(&self, session_id: &SessionId) -> Result<bool> {
        self.backend.delete(session_id).await
    }

    /// Evict cache entries older than `now - ttl`. Returns how many were evicted.
    pub fn invalidate_cache(&self, ttl: Duration) -> usize {
        let cutoff = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_sub_signed(ttl));
        match cutoff {
            Some(cutoff) => self.cache.evict_older_than(cutoff),
            None => 0,
        }
    }

    /// Number of users currently cached.
    pub fn cached_users(&self) -> usize {
        self.cache.len()
    }

    #[cfg(test)]
    fn prime(&self, user: &str, nodes: &[&str], cached_at: DateTime<Utc>) {
        self.cache.put(
            UserId::from(user),
            nodes.iter().map(|n| (*n).to_string()).collect(),
            cached_at,
        );
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
