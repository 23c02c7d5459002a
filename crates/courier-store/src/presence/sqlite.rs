//! [`PresenceBackend`] over the `SQLite` presence table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::ids::{SessionId, UserId};

use super::{OnlineEntry, PresenceBackend, PresenceRecord};
use crate::errors::Result;
use crate::sqlite::repositories::{PresenceRepo, PresenceRow};
use crate::sqlite::{ConnectionPool, with_conn};

/// Presence rows stored in `SQLite`; each call runs on the blocking pool.
#[derive(Clone, Debug)]
pub struct SqlitePresenceBackend {
    pool: ConnectionPool,
}

impl SqlitePresenceBackend {
    /// Wrap a migrated pool.
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// Remove every row this node left behind, e.g. after a crash.
    pub async fn purge_node(&self, node_name: &str) -> Result<usize> {
        let node = node_name.to_owned();
        with_conn(&self.pool, move |conn| PresenceRepo::delete_by_node(conn, &node)).await
    }
}

#[async_trait]
impl PresenceBackend for SqlitePresenceBackend {
    async fn insert(&self, record: &PresenceRecord) -> Result<()> {
        let row = PresenceRow {
            session_id: record.session_id.to_string(),
            user_id: record.user_id.to_string(),
            tenant_id: record.tenant_id.to_string(),
            node_name: record.node_name.clone(),
            last_active_at: record.last_active_at.timestamp_millis(),
            created_at: record.created_at.timestamp_millis(),
        };
        with_conn(&self.pool, move |conn| PresenceRepo::upsert(conn, &row)).await
    }

    async fn set_active(&self, session_id: &SessionId, at: DateTime<Utc>) -> Result<bool> {
        let session = session_id.to_string();
        let at_ms = at.timestamp_millis();
        with_conn(&self.pool, move |conn| PresenceRepo::touch(conn, &session, at_ms)).await
    }

    async fn delete(&self, session_id: &SessionId) -> Result<bool> {
        let session = session_id.to_string();
        with_conn(&self.pool, move |conn| PresenceRepo::delete(conn, &session)).await
    }

    async fn find_online(
        &self,
        user_ids: &[UserId],
        since: DateTime<Utc>,
    ) -> Result<Vec<OnlineEntry>> {
        let users: Vec<String> = user_ids.iter().map(ToString::to_string).collect();
        let since_ms = since.timestamp_millis();
        let rows = with_conn(&self.pool, move |conn| {
            let refs: Vec<&str> = users.iter().map(String::as_str).collect();
            PresenceRepo::find_online(conn, &refs, since_ms)
        })
        .await?;

        Ok(rows
            .into_iter()
            .map(|(user, node)| OnlineEntry {
                user_id: UserId::from(user),
                node_name: node,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::PresenceStore;
    use crate::sqlite::{ConnectionConfig, open_and_migrate};
    use courier_core::ids::TenantId;
    use std::sync::Arc;

    fn backend() -> SqlitePresenceBackend {
        let pool = open_and_migrate(None, &ConnectionConfig::default()).unwrap();
        SqlitePresenceBackend::new(pool)
    }

    fn record(session: &str, user: &str, node: &str) -> PresenceRecord {
        PresenceRecord::connected_now(
            SessionId::from(session),
            UserId::from(user),
            TenantId::from("t1"),
            node,
        )
    }

    #[tokio::test]
    async fn insert_find_delete_cycle() {
        let backend = backend();
        backend.insert(&record("s1", "a", "n1")).await.unwrap();
        backend.insert(&record("s2", "b", "n2")).await.unwrap();

        let since = Utc::now() - chrono::Duration::seconds(15);
        let found = backend
            .find_online(&[UserId::from("a"), UserId::from("b")], since)
            .await
            .unwrap();
        assert_eq!(found.len(), 2);

        assert!(backend.delete(&SessionId::from("s1")).await.unwrap());
        assert!(!backend.delete(&SessionId::from("s1")).await.unwrap());
        let found = backend.find_online(&[UserId::from("a")], since).await.unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn stale_rows_are_not_online() {
        let backend = backend();
        let mut rec = record("s1", "a", "n1");
        rec.last_active_at = Utc::now() - chrono::Duration::seconds(60);
        backend.insert(&rec).await.unwrap();

        let since = Utc::now() - chrono::Duration::seconds(15);
        assert!(backend.find_online(&[UserId::from("a")], since).await.unwrap().is_empty());

        assert!(backend.set_active(&SessionId::from("s1"), Utc::now()).await.unwrap());
        assert_eq!(backend.find_online(&[UserId::from("a")], since).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn store_over_sqlite_groups_by_node() {
        let backend = backend();
        backend.insert(&record("s1", "a", "n1")).await.unwrap();
        backend.insert(&record("s2", "a", "n1")).await.unwrap();
        backend.insert(&record("s3", "b", "n2")).await.unwrap();
        let store = PresenceStore::new(Arc::new(backend));

        let map = store
            .find(
                &[UserId::from("a"), UserId::from("b"), UserId::from("c")],
                Utc::now() - chrono::Duration::seconds(15),
            )
            .await
            .unwrap();
        assert_eq!(map["n1"], vec![UserId::from("a")]);
        assert_eq!(map["n2"], vec![UserId::from("b")]);
    }

    #[tokio::test]
    async fn purge_node_removes_leftovers() {
        let backend = backend();
        backend.insert(&record("s1", "a", "n1")).await.unwrap();
        backend.insert(&record("s2", "b", "n2")).await.unwrap();
        assert_eq!(backend.purge_node("n1").await.unwrap(), 1);
    }
}
