//! Device tokens consulted for offline push notifications.

use async_trait::async_trait;
use chrono::Utc;
use courier_core::ids::UserId;

use crate::errors::Result;
use crate::sqlite::repositories::DeviceTokenRepo;
use crate::sqlite::{ConnectionPool, with_conn};

/// A push token registered by a user's device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceToken {
    /// Owning user.
    pub user_id: UserId,
    /// Opaque push token.
    pub token: String,
    /// Platform (`ios`, `android`).
    pub platform: String,
}

/// Lookup and maintenance of device tokens.
#[async_trait]
pub trait DeviceTokenSource: Send + Sync {
    /// All tokens registered by any of `user_ids`.
    async fn tokens_for_users(&self, user_ids: &[UserId]) -> Result<Vec<DeviceToken>>;

    /// Forget tokens the push provider rejected. Returns rows removed.
    async fn remove_tokens(&self, tokens: &[String]) -> Result<usize>;
}

/// [`DeviceTokenSource`] over the `SQLite` `device_tokens` table.
#[derive(Clone, Debug)]
pub struct SqliteDeviceTokens {
    pool: ConnectionPool,
}

impl SqliteDeviceTokens {
    /// Wrap a migrated pool.
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// Register or refresh a token for `user_id`. Returns whether it was new.
    pub async fn register(&self, user_id: &UserId, token: &str, platform: &str) -> Result<bool> {
        let (user, token, platform) = (user_id.to_string(), token.to_owned(), platform.to_owned());
        let now = Utc::now().timestamp_millis();
        let result = with_conn(&self.pool, move |conn| {
            DeviceTokenRepo::register(conn, &user, &token, &platform, now)
        })
        .await?;
        Ok(result.created)
    }
}

#[async_trait]
impl DeviceTokenSource for SqliteDeviceTokens {
    async fn tokens_for_users(&self, user_ids: &[UserId]) -> Result<Vec<DeviceToken>> {
        let users: Vec<String> = user_ids.iter().map(ToString::to_string).collect();
        let rows = with_conn(&self.pool, move |conn| {
            let refs: Vec<&str> = users.iter().map(String::as_str).collect();
            DeviceTokenRepo::find_by_users(conn, &refs)
        })
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| DeviceToken {
                user_id: UserId::from(row.user_id),
                token: row.token,
                platform: row.platform,
            })
            .collect())
    }

    async fn remove_tokens(&self, tokens: &[String]) -> Result<usize> {
        let tokens = tokens.to_vec();
        with_conn(&self.pool, move |conn| {
            let mut removed = 0;
            for token in &tokens {
                removed += DeviceTokenRepo::unregister(conn, token)?;
            }
            Ok(removed)
        })
        .await
    }
}
