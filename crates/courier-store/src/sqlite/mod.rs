//! `SQLite` backend: pool, migrations, and repositories.

pub mod connection;
pub mod migrations;
pub mod repositories;

pub use connection::{ConnectionConfig, ConnectionPool, PooledConnection, new_file, new_in_memory};
pub use migrations::run_migrations;

/// Open a pool and bring its schema up to date.
pub fn open_and_migrate(
    path: Option<&std::path::Path>,
    config: &ConnectionConfig,
) -> crate::Result<ConnectionPool> {
    let pool = match path {
        Some(p) => {
            if let Some(parent) = p.parent() {
                std::fs::create_dir_all(parent).map_err(|e| crate::StoreError::Migration {
                    message: format!("failed to create {}: {e}", parent.display()),
                })?;
            }
            new_file(p, config)?
        }
        None => new_in_memory(config)?,
    };
    let conn = pool.get()?;
    let _ = run_migrations(&conn)?;
    Ok(pool)
}

/// Run a blocking closure against a pooled connection on the blocking pool.
pub(crate) async fn with_conn<T, F>(pool: &ConnectionPool, f: F) -> crate::Result<T>
where
    F: FnOnce(&rusqlite::Connection) -> crate::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let conn = pool.get()?;
        f(&conn)
    })
    .await
    .map_err(|e| crate::StoreError::Join(e.to_string()))?
}
