//! Device token repository: CRUD for the `device_tokens` table.
//!
//! A user may register several devices; tokens are unique per
//! `(user_id, token)`.

use rusqlite::{Connection, OptionalExtension, params, params_from_iter};

use crate::errors::Result;

/// A row of the `device_tokens` table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceTokenRow {
    /// Owning user.
    pub user_id: String,
    /// Opaque push token.
    pub token: String,
    /// Platform (`ios`, `android`).
    pub platform: String,
    /// Registration time, Unix ms.
    pub created_at: i64,
    /// Last re-registration, Unix ms.
    pub updated_at: i64,
}

/// Result of registering a device token (upsert).
#[derive(Debug)]
pub struct RegisterTokenResult {
    /// Whether a new row was created (vs. refreshed).
    pub created: bool,
}

/// Device token repository.
pub struct DeviceTokenRepo;

impl DeviceTokenRepo {
    /// Register or refresh a device token.
    pub fn register(
        conn: &Connection,
        user_id: &str,
        token: &str,
        platform: &str,
        now_ms: i64,
    ) -> Result<RegisterTokenResult> {
        let existing: Option<i64> = conn
            .query_row(
                "SELECT created_at FROM device_tokens WHERE user_id = ?1 AND token = ?2",
                params![user_id, token],
                |row| row.get(0),
            )
            .optional()?;

        if existing.is_some() {
            let _ = conn.execute(
                "UPDATE device_tokens SET platform = ?3, updated_at = ?4
                 WHERE user_id = ?1 AND token = ?2",
                params![user_id, token, platform, now_ms],
            )?;
            Ok(RegisterTokenResult { created: false })
        } else {
            let _ = conn.execute(
                "INSERT INTO device_tokens (user_id, token, platform, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![user_id, token, platform, now_ms],
            )?;
            Ok(RegisterTokenResult { created: true })
        }
    }

    /// Remove a token for every user holding it. Returns rows removed.
    pub fn unregister(conn: &Connection, token: &str) -> Result<usize> {
        Ok(conn.execute(
            "DELETE FROM device_tokens WHERE token = ?1",
            params![token],
        )?)
    }

    /// All tokens registered by any of `user_ids`.
    pub fn find_by_users(conn: &Connection, user_ids: &[&str]) -> Result<Vec<DeviceTokenRow>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; user_ids.len()].join(", ");
        let sql = format!(
            "SELECT user_id, token, platform, created_at, updated_at
             FROM device_tokens WHERE user_id IN ({placeholders})
             ORDER BY user_id, updated_at DESC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(user_ids.iter()), Self::map_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeviceTokenRow> {
        Ok(DeviceTokenRow {
            user_id: row.get(0)?,
            token: row.get(1)?,
            platform: row.get(2)?,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
        })
    }
}
