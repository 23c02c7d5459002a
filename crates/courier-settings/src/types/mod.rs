//! Settings type definitions.
//!
//! All types use camelCase JSON and implement [`Default`] with production
//! values; `#[serde(default)]` lets a settings file name only what it changes.

mod fanout;
mod integrations;
mod server;

pub use fanout::*;
pub use integrations::*;
pub use server::*;

use serde::{Deserialize, Serialize};

/// Root settings type.
///
/// ```json
/// {
///   "node": { "name": "chat-1" },
///   "server": { "port": 9000 },
///   "fanout": { "healthCheckIntervalMs": 5000 }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CourierSettings {
    /// Identity of this node within the cluster.
    pub node: NodeSettings,
    /// HTTP / WebSocket listener.
    pub server: ServerSettings,
    /// Shard, session, and watchdog tuning.
    pub fanout: FanoutSettings,
    /// Presence persistence and cache.
    pub presence: PresenceSettings,
    /// Cross-node pub/sub bus.
    pub bus: BusSettings,
    /// Offline push notifications.
    pub notification: NotificationSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl CourierSettings {
    /// Reject combinations the runtime cannot work with.
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.name.trim().is_empty() {
            return Err(crate::SettingsError::invalid("node.name", "must not be empty"));
        }
        self.fanout.validate()?;
        self.bus.validate()
    }
}

/// Node identity.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeSettings {
    /// Name recorded in presence rows and used as the cross-node routing key.
    pub name: String,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            name: gethostname::gethostname().to_string_lossy().into_owned(),
        }
    }
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
