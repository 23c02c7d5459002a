//! Embedded schema migrations.
//!
//! `schema_version` holds one row per applied step. Steps newer than the
//! highest recorded version run in order, each in its own transaction.

use rusqlite::{Connection, params};
use tracing::info;

use crate::errors::{Result, StoreError};

/// `(version, label, sql)`, ascending by version.
const STEPS: &[(u32, &str, &str)] = &[
    (
        1,
        "presence table keyed by session id",
        include_str!("v001_presence.sql"),
    ),
    (
        2,
        "device tokens keyed by user and token",
        include_str!("v002_device_tokens.sql"),
    ),
];

fn failed(what: impl std::fmt::Display) -> impl FnOnce(rusqlite::Error) -> StoreError {
    move |e| StoreError::Migration {
        message: format!("{what}: {e}"),
    }
}

/// Bring `conn` up to [`latest_version`]. Returns the number of steps run.
pub fn run_migrations(conn: &Connection) -> Result<u32> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
           version     INTEGER PRIMARY KEY,
           applied_at  TEXT    NOT NULL,
           description TEXT
         );",
    )
    .map_err(failed("creating schema_version"))?;

    let from = current_version(conn)?;
    let mut applied = 0;
    for &(version, label, sql) in STEPS.iter().filter(|(v, ..)| *v > from) {
        info!(version, label, "applying presence schema step");
        let tx = conn
            .unchecked_transaction()
            .map_err(failed(format!("opening v{version}")))?;
        tx.execute_batch(sql)
            .map_err(failed(format!("v{version} ({label})")))?;
        let _ = tx
            .execute(
                "INSERT INTO schema_version (version, applied_at, description)
                 VALUES (?1, datetime('now'), ?2)",
                params![version, label],
            )
            .map_err(failed(format!("recording v{version}")))?;
        tx.commit()
            .map_err(failed(format!("committing v{version}")))?;
        applied += 1;
    }

    if applied > 0 {
        info!(from, to = latest_version(), "presence schema migrated");
    }
    Ok(applied)
}

/// Highest recorded version, 0 for a fresh database.
pub fn current_version(conn: &Connection) -> Result<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .map_err(failed("reading schema_version"))
}

#[must_use]
pub fn latest_version() -> u32 {
    STEPS.last().map_or(0, |&(v, ..)| v)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get::<_, i64>(0),
        )
        .unwrap()
            == 1
    }

    #[test]
    fn fresh_database_gets_all_tables() {
        let conn = Connection::open_in_memory().unwrap();
        let applied = run_migrations(&conn).unwrap();
        assert_eq!(applied, latest_version());
        assert!(table_exists(&conn, "presence"));
        assert!(table_exists(&conn, "device_tokens"));
        assert_eq!(current_version(&conn).unwrap(), latest_version());
    }

    #[test]
    fn partially_migrated_database_resumes() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE schema_version (
               version INTEGER PRIMARY KEY, applied_at TEXT NOT NULL, description TEXT
             );
             INSERT INTO schema_version VALUES (1, datetime('now'), 'presence');",
        )
        .unwrap();
        conn.execute_batch(STEPS[0].2).unwrap();

        assert_eq!(run_migrations(&conn).unwrap(), latest_version() - 1);
        assert!(table_exists(&conn, "device_tokens"));
    }

    #[test]
    fn rerun_is_noop() {
        let conn = Connection::open_in_memory().unwrap();
        let _ = run_migrations(&conn).unwrap();
        assert_eq!(run_migrations(&conn).unwrap(), 0);
    }
}
