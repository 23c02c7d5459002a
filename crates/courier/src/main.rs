//! # courier
//!
//! Fan-out node binary: loads settings, opens the presence database, picks
//! a bus and a push gateway, and serves `/subscribe` until interrupted.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use courier_server::bus::{LocalBus, MessageBus};
use courier_server::notify::{ApnsGateway, DisabledGateway, PushGateway};
use courier_server::{CourierServer, ServerDeps};
use courier_settings::{BusBackend, CourierSettings};
use courier_store::sqlite::{ConnectionConfig, open_and_migrate};
use courier_store::{PresenceStore, SqliteDeviceTokens, SqlitePresenceBackend};
use tracing::{info, warn};

/// Courier fan-out node.
#[derive(Parser, Debug)]
#[command(name = "courier", about = "Real-time chat fan-out node")]
struct Cli {
    /// Settings file (defaults to `~/.courier/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Node name registered in presence rows (overrides settings).
    #[arg(long)]
    node_name: Option<String>,

    /// Path to the presence `SQLite` database (overrides settings).
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Log filter, e.g. `info` or `courier_server=debug` (overrides settings).
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn load_settings(&self) -> Result<CourierSettings> {
        let mut settings = match &self.config {
            Some(path) => courier_settings::load_settings_from_path(path),
            None => courier_settings::load_settings(),
        }
        .context("Failed to load settings")?;

        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(name) = &self.node_name {
            settings.node.name.clone_from(name);
        }
        if let Some(path) = &self.db_path {
            settings.presence.db_path = path.to_string_lossy().into_owned();
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        settings.validate().context("Invalid settings after CLI overrides")?;
        Ok(settings)
    }
}

async fn build_bus(settings: &CourierSettings) -> Result<Arc<dyn MessageBus>> {
    match (&settings.bus.backend, settings.bus.url.as_deref()) {
        #[cfg(feature = "redis")]
        (BusBackend::Redis, Some(url)) => {
            let bus = courier_server::bus::RedisBus::connect(url)
                .await
                .context("Failed to connect to the redis bus")?;
            Ok(Arc::new(bus))
        }
        (BusBackend::Redis, _) => {
            warn!("redis bus requested but unavailable in this build, using the in-process bus");
            Ok(Arc::new(LocalBus::default()))
        }
        (BusBackend::Local, _) => Ok(Arc::new(LocalBus::default())),
    }
}

fn build_gateway(settings: &CourierSettings) -> Arc<dyn PushGateway> {
    if !settings.notification.enabled {
        return Arc::new(DisabledGateway);
    }
    match &settings.notification.apns {
        Some(apns) => match ApnsGateway::new(apns.clone()) {
            Ok(gateway) => Arc::new(gateway),
            Err(e) => {
                warn!(error = %e, "APNS gateway unavailable, offline notifications disabled");
                Arc::new(DisabledGateway)
            }
        },
        None => Arc::new(DisabledGateway),
    }
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate =
            signal(SignalKind::terminate()).context("Failed to listen for SIGTERM")?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res.context("Failed to listen for ctrl-c")?,
            _ = terminate.recv() => {}
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for ctrl-c")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let settings = args.load_settings()?;

    courier_core::logging::init_subscriber(&settings.logging.level);
    let metrics = match courier_server::metrics::install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "metrics recorder not installed");
            None
        }
    };

    let db_path = settings.presence.resolved_db_path();
    let pool = open_and_migrate(
        Some(&db_path),
        &ConnectionConfig {
            pool_size: settings.presence.pool_size,
            busy_timeout_ms: settings.presence.busy_timeout_ms,
        },
    )
    .context("Failed to open presence database")?;

    // Rows left by a previous run of this node point at sessions that no
    // longer exist.
    let backend = Arc::new(SqlitePresenceBackend::new(pool.clone()));
    let purged = backend
        .purge_node(&settings.node.name)
        .await
        .context("Failed to purge stale presence rows")?;
    if purged > 0 {
        info!(purged, node = %settings.node.name, "removed presence rows from a previous run");
    }

    let deps = ServerDeps {
        presence: Arc::new(PresenceStore::new(backend)),
        bus: build_bus(&settings).await?,
        gateway: build_gateway(&settings),
        tokens: Arc::new(SqliteDeviceTokens::new(pool)),
        metrics,
    };

    let node = settings.node.name.clone();
    let handle = CourierServer::new(settings, deps)
        .start()
        .await
        .context("Failed to start server")?;
    info!(node = %node, addr = %handle.addr(), db = %db_path.display(), "courier listening");

    shutdown_signal().await?;

    info!("shutting down");
    handle.shutdown().await;
    info!("shutdown complete");
    Ok(())
}
