use std::path::PathBuf;

use courier_core::constants::INTERNAL_BROADCAST_TOPIC;
use courier_core::retry::RetryConfig;
use serde::{Deserialize, Serialize};

use super::fanout::expand_home;
use crate::errors::{Result, SettingsError};

/// Which pub/sub implementation carries cross-node envelopes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BusBackend {
    /// In-process only; suitable for a single node.
    #[default]
    Local,
    /// Redis `PUBLISH` / `SUBSCRIBE`.
    Redis,
}

/// Cross-node pub/sub settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BusSettings {
    /// Bus implementation.
    pub backend: BusBackend,
    /// Connection URL for networked backends.
    pub url: Option<String>,
    /// Topic carrying cross-node envelopes.
    pub topic: String,
    /// Retry policy for transient publish failures.
    pub publish_retry: RetryConfig,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            backend: BusBackend::Local,
            url: None,
            topic: INTERNAL_BROADCAST_TOPIC.to_string(),
            publish_retry: RetryConfig::default(),
        }
    }
}

impl BusSettings {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.topic.trim().is_empty() {
            return Err(SettingsError::invalid("bus.topic", "must not be empty"));
        }
        if self.backend == BusBackend::Redis && self.url.is_none() {
            return Err(SettingsError::invalid(
                "bus.url",
                "required for the redis backend",
            ));
        }
        Ok(())
    }
}

/// Offline push notification settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotificationSettings {
    /// Master switch; when off, no gateway is ever called.
    pub enabled: bool,
    /// APNS credentials; absent disables the gateway.
    pub apns: Option<ApnsSettings>,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            apns: None,
        }
    }
}

/// APNS token-based authentication settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApnsSettings {
    /// Path to the `.p8` signing key (`~` expands to `$HOME`).
    pub key_path: String,
    /// Key id issued by Apple.
    pub key_id: String,
    /// Developer team id.
    pub team_id: String,
    /// App bundle id used as the APNS topic.
    pub bundle_id: String,
    /// `production` or `sandbox`.
    pub environment: String,
    /// Per-request timeout.
    pub timeout_ms: u64,
}

impl Default for ApnsSettings {
    fn default() -> Self {
        Self {
            key_path: "~/.courier/apns/AuthKey.p8".to_string(),
            key_id: String::new(),
            team_id: String::new(),
            bundle_id: String::new(),
            environment: "production".to_string(),
            timeout_ms: 30_000,
        }
    }
}

impl ApnsSettings {
    /// APNS host for the configured environment.
    pub fn apns_host(&self) -> &'static str {
        if self.environment == "sandbox" {
            "api.sandbox.push.apple.com"
        } else {
            "api.push.apple.com"
        }
    }

    /// Key path with a leading `~` expanded.
    pub fn resolved_key_path(&self) -> PathBuf {
        expand_home(&self.key_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_defaults_to_local() {
        let bus = BusSettings::default();
        assert_eq!(bus.backend, BusBackend::Local);
        assert_eq!(bus.topic, "chat.internal_broadcast");
        bus.validate().unwrap();
    }

    #[test]
    fn redis_requires_url() {
        let bus: BusSettings = serde_json::from_str(r#"{"backend": "redis"}"#).unwrap();
        assert!(bus.validate().is_err());
    }

    #[test]
    fn apns_host_by_environment() {
        let mut apns = ApnsSettings::default();
        assert_eq!(apns.apns_host(), "api.push.apple.com");
        apns.environment = "sandbox".into();
        assert_eq!(apns.apns_host(), "api.sandbox.push.apple.com");
    }

    #[test]
    fn notifications_enabled_without_credentials_by_default() {
        let n = NotificationSettings::default();
        assert!(n.enabled);
        assert!(n.apns.is_none());
    }
}
