//! Per-push options supplied by callers of the dispatch router.

use serde::{Deserialize, Serialize};

use crate::ids::UserId;

/// Options for a single push.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PushOptions {
    /// Offline notification fallback.
    pub notification: NotificationOpts,
}

/// Controls the device notification sent to recipients with no live session.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotificationOpts {
    /// Send notifications at all.
    pub enabled: bool,
    /// Deliver as a data-only push with no visible alert.
    pub silence: bool,
    /// Alert title; falls back to the conversation name.
    pub title: Option<String>,
    /// Users never notified, typically the sender.
    pub ignored_users: Vec<UserId>,
}

impl PushOptions {
    /// Options with notifications turned on and `ignored` excluded.
    #[must_use]
    pub fn notify(ignored: Vec<UserId>) -> Self {
        Self {
            notification: NotificationOpts {
                enabled: true,
                ignored_users: ignored,
                ..NotificationOpts::default()
            },
        }
    }
}
