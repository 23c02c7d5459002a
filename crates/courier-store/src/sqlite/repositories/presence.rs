//! Presence repository: CRUD for the `presence` table.
//!
//! One row per live session. Timestamps are Unix milliseconds so recency
//! filters are plain integer comparisons.

use rusqlite::{Connection, OptionalExtension, params, params_from_iter};

use crate::errors::Result;

/// A row of the `presence` table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PresenceRow {
    /// Session id (primary key).
    pub session_id: String,
    /// Owning user.
    pub user_id: String,
    /// Tenant of the session.
    pub tenant_id: String,
    /// Node holding the session.
    pub node_name: String,
    /// Last heartbeat, Unix ms.
    pub last_active_at: i64,
    /// Connect time, Unix ms.
    pub created_at: i64,
}

/// Presence repository.
pub struct PresenceRepo;

impl PresenceRepo {
    /// Insert or replace the row for `row.session_id`.
    pub fn upsert(conn: &Connection, row: &PresenceRow) -> Result<()> {
        let _ = conn.execute(
            "INSERT INTO presence (session_id, user_id, tenant_id, node_name, last_active_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(session_id) DO UPDATE SET
                 user_id = excluded.user_id,
                 tenant_id = excluded.tenant_id,
                 node_name = excluded.node_name,
                 last_active_at = excluded.last_active_at",
            params![
                row.session_id,
                row.user_id,
                row.tenant_id,
                row.node_name,
                row.last_active_at,
                row.created_at
            ],
        )?;
        Ok(())
    }

    /// Advance `last_active_at`. Returns whether the session row exists.
    pub fn touch(conn: &Connection, session_id: &str, at_ms: i64) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE presence SET last_active_at = MAX(last_active_at, ?2) WHERE session_id = ?1",
            params![session_id, at_ms],
        )?;
        Ok(changed > 0)
    }

    /// Delete a session row. Returns whether a row was removed.
    pub fn delete(conn: &Connection, session_id: &str) -> Result<bool> {
        let changed = conn.execute(
            "DELETE FROM presence WHERE session_id = ?1",
            params![session_id],
        )?;
        Ok(changed > 0)
    }

    /// Delete every row owned by `node_name` (used when a node restarts).
    pub fn delete_by_node(conn: &Connection, node_name: &str) -> Result<usize> {
        Ok(conn.execute(
            "DELETE FROM presence WHERE node_name = ?1",
            params![node_name],
        )?)
    }

    /// Get one row by session id.
    pub fn get(conn: &Connection, session_id: &str) -> Result<Option<PresenceRow>> {
        Ok(conn
            .query_row(
                "SELECT session_id, user_id, tenant_id, node_name, last_active_at, created_at
                 FROM presence WHERE session_id = ?1",
                params![session_id],
                Self::map_row,
            )
            .optional()?)
    }

    /// Distinct `(user_id, node_name)` pairs for `user_ids` active at or after `since_ms`.
    pub fn find_online(
        conn: &Connection,
        user_ids: &[&str],
        since_ms: i64,
    ) -> Result<Vec<(String, String)>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; user_ids.len()].join(", ");
        let sql = format!(
            "SELECT DISTINCT user_id, node_name FROM presence
             WHERE last_active_at >= ? AND user_id IN ({placeholders})
             ORDER BY user_id, node_name"
        );
        let mut stmt = conn.prepare(&sql)?;

        let mut args: Vec<rusqlite::types::Value> = Vec::with_capacity(user_ids.len() + 1);
        args.push(since_ms.into());
        args.extend(user_ids.iter().map(|u| rusqlite::types::Value::from((*u).to_owned())));

        let rows = stmt
            .query_map(params_from_iter(args), |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PresenceRow> {
        Ok(PresenceRow {
            session_id: row.get(0)?,
            user_id: row.get(1)?,
            tenant_id: row.get(2)?,
            node_name: row.get(3)?,
            last_active_at: row.get(4)?,
            created_at: row.get(5)?,
        })
    }
}

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use crate::sqlite::migrations::run_migrations;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    fn row(session: &str, user: &str, node: &str, at: i64) -> PresenceRow {
        PresenceRow {
            session_id: session.into(),
            user_id: user.into(),
            tenant_id: "t1".into(),
            node_name: node.into(),
            last_active_at: at,
            created_at: at,
        }
    }

    #[test]
    fn upsert_and_get() {
        let conn = setup();
        PresenceRepo::upsert(&conn, &row("s1", "u1", "n1", 100)).unwrap();
        let got = PresenceRepo::get(&conn, "s1").unwrap().unwrap();
        assert_eq!(got.user_id, "u1");
        assert_eq!(got.node_name, "n1");
    }

    #[test]
    fn touch_only_moves_forward() {
        let conn = setup();
        PresenceRepo::upsert(&conn, &row("s1", "u1", "n1", 100)).unwrap();
        assert!(PresenceRepo::touch(&conn, "s1", 200).unwrap());
        assert!(PresenceRepo::touch(&conn, "s1", 150).unwrap());
        assert_eq!(PresenceRepo::get(&conn, "s1").unwrap().unwrap().last_active_at, 200);
        assert!(!PresenceRepo::touch(&conn, "missing", 300).unwrap());
    }

    #[test]
    fn delete_is_idempotent() {
        let conn = setup();
        PresenceRepo::upsert(&conn, &row("s1", "u1", "n1", 100)).unwrap();
        assert!(PresenceRepo::delete(&conn, "s1").unwrap());
        assert!(!PresenceRepo::delete(&conn, "s1").unwrap());
    }

    #[test]
    fn find_online_filters_by_recency_and_user() {
        let conn = setup();
        PresenceRepo::upsert(&conn, &row("s1", "a", "n1", 1_000)).unwrap();
        PresenceRepo::upsert(&conn, &row("s2", "a", "n2", 1_000)).unwrap();
        PresenceRepo::upsert(&conn, &row("s3", "a", "n1", 1_000)).unwrap();
        PresenceRepo::upsert(&conn, &row("s4", "b", "n2", 10)).unwrap();
        PresenceRepo::upsert(&conn, &row("s5", "c", "n3", 1_000)).unwrap();

        let found = PresenceRepo::find_online(&conn, &["a", "b"], 500).unwrap();
        assert_eq!(
            found,
            vec![
                ("a".to_string(), "n1".to_string()),
                ("a".to_string(), "n2".to_string()),
            ]
        );
    }

    #[test]
    fn find_online_empty_input() {
        let conn = setup();
        assert!(PresenceRepo::find_online(&conn, &[], 0).unwrap().is_empty());
    }

    #[test]
    fn delete_by_node() {
        let conn = setup();
        PresenceRepo::upsert(&conn, &row("s1", "a", "n1", 1)).unwrap();
        PresenceRepo::upsert(&conn, &row("s2", "b", "n1", 1)).unwrap();
        PresenceRepo::upsert(&conn, &row("s3", "c", "n2", 1)).unwrap();
        assert_eq!(PresenceRepo::delete_by_node(&conn, "n1").unwrap(), 2);
        assert!(PresenceRepo::get(&conn, "s3").unwrap().is_some());
    }
}
