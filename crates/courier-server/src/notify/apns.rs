//! APNS gateway: ES256 JWT signing and HTTP/2 delivery.
//!
//! Uses `reqwest` for HTTP/2 transport and `jsonwebtoken` for the provider
//! token, which Apple accepts for an hour and we refresh after 55 minutes.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use courier_settings::ApnsSettings;
use courier_store::DeviceToken;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::{BatchReport, Notification, NotificationError, PushGateway, TokenFailure};

const REFRESH_AFTER: Duration = Duration::from_secs(55 * 60);

#[derive(Serialize)]
struct Claims<'a> {
    iss: &'a str,
    iat: i64,
}

/// Signed provider JWT and when it was minted.
struct ProviderToken {
    jwt: String,
    minted: Instant,
}

impl ProviderToken {
    fn fresh(&self) -> Option<&str> {
        (self.minted.elapsed() < REFRESH_AFTER).then_some(self.jwt.as_str())
    }
}

/// [`PushGateway`] for Apple devices.
pub struct ApnsGateway {
    settings: ApnsSettings,
    key: EncodingKey,
    http: reqwest::Client,
    provider: Mutex<Option<ProviderToken>>,
}

impl std::fmt::Debug for ApnsGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApnsGateway")
            .field("key_id", &self.settings.key_id)
            .field("environment", &self.settings.environment)
            .finish_non_exhaustive()
    }
}

impl ApnsGateway {
    /// Read the signing key from disk and build an HTTP/2 client.
    pub fn new(settings: ApnsSettings) -> Result<Self, ApnsError> {
        let path = settings.resolved_key_path();
        let pem = std::fs::read(&path).map_err(|source| ApnsError::KeyRead { path, source })?;
        Self::from_pem(settings, &pem)
    }

    /// Build from an in-memory PKCS#8 EC key.
    pub fn from_pem(settings: ApnsSettings, key_pem: &[u8]) -> Result<Self, ApnsError> {
        let key = EncodingKey::from_ec_pem(key_pem).map_err(ApnsError::KeyParse)?;
        let http = reqwest::Client::builder()
            .http2_prior_knowledge()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()
            .map_err(ApnsError::Http)?;

        info!(
            key_id = %settings.key_id,
            team_id = %settings.team_id,
            environment = %settings.environment,
            "APNS gateway initialized"
        );

        Ok(Self {
            settings,
            key,
            http,
            provider: Mutex::new(None),
        })
    }

    async fn send_one(
        &self,
        jwt: &str,
        token: &str,
        notification: &Notification,
    ) -> Result<(), TokenFailure> {
        let url = format!("https://{}:443/3/device/{token}", self.settings.apns_host());
        let (push_type, priority) = if notification.is_silent() {
            ("background", "5")
        } else {
            ("alert", "10")
        };

        let response = self
            .http
            .post(&url)
            .header("authorization", format!("bearer {jwt}"))
            .header("apns-topic", &self.settings.bundle_id)
            .header("apns-push-type", push_type)
            .header("apns-priority", priority)
            .header("apns-expiration", "0")
            .json(&build_payload(notification))
            .send()
            .await
            .map_err(|e| TokenFailure {
                token: token.to_owned(),
                status: None,
                reason: e.to_string(),
            })?;

        let status = response.status();
        if status.is_success() {
            debug!(status = status.as_u16(), token_prefix = prefix(token), "APNS send OK");
            return Ok(());
        }

        // Apple answers errors with `{"reason": "BadDeviceToken"}` and friends.
        let raw = response.text().await.unwrap_or_default();
        let reason = match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(body)) => match body.get("reason") {
                Some(Value::String(r)) => r.clone(),
                _ => raw,
            },
            _ => raw,
        };
        warn!(
            status = status.as_u16(),
            reason = %reason,
            token_prefix = prefix(token),
            "APNS send failed"
        );
        Err(TokenFailure {
            token: token.to_owned(),
            status: Some(status.as_u16()),
            reason,
        })
    }

    fn provider_token(&self) -> Result<String, ApnsError> {
        let mut slot = self.provider.lock();
        if let Some(jwt) = slot.as_ref().and_then(ProviderToken::fresh) {
            return Ok(jwt.to_owned());
        }

        let header = Header {
            kid: Some(self.settings.key_id.clone()),
            ..Header::new(Algorithm::ES256)
        };
        let claims = Claims {
            iss: &self.settings.team_id,
            iat: chrono::Utc::now().timestamp(),
        };
        let jwt = jsonwebtoken::encode(&header, &claims, &self.key).map_err(ApnsError::Sign)?;
        debug!(key_id = %self.settings.key_id, "minted APNS provider token");
        *slot = Some(ProviderToken {
            jwt: jwt.clone(),
            minted: Instant::now(),
        });
        Ok(jwt)
    }
}

#[async_trait]
impl PushGateway for ApnsGateway {
    async fn send(
        &self,
        tokens: &[DeviceToken],
        notification: &Notification,
    ) -> Result<BatchReport, NotificationError> {
        let jwt = self.provider_token().map_err(|e| NotificationError::Direct {
            reason: e.to_string(),
        })?;

        let sends = tokens
            .iter()
            .map(|t| self.send_one(&jwt, &t.token, notification));
        let results = futures::future::join_all(sends).await;

        let failures: Vec<TokenFailure> = results.into_iter().filter_map(Result::err).collect();
        summarize(tokens.len(), failures)
    }
}

/// Fold per-token results into the batch outcome. A batch where no send
/// got an answer from APNS at all is a gateway failure, not a partial one.
fn summarize(sent: usize, failures: Vec<TokenFailure>) -> Result<BatchReport, NotificationError> {
    let report = BatchReport {
        success: sent - failures.len(),
        failure: failures.len(),
    };
    if failures.is_empty() {
        return Ok(report);
    }
    if report.success == 0 && failures.iter().all(|f| f.status.is_none()) {
        let reason = failures
            .first()
            .map(|f| f.reason.clone())
            .unwrap_or_default();
        warn!(tokens = sent, reason = %reason, "APNS unreachable for the whole batch");
        return Err(NotificationError::Direct { reason });
    }
    Err(NotificationError::Partial { report, failures })
}

fn prefix(token: &str) -> &str {
    token.get(..8).unwrap_or(token)
}

/// Build the APNS JSON payload. Custom data sits at the root next to `aps`.
pub(crate) fn build_payload(notification: &Notification) -> Value {
    let mut aps = if notification.is_silent() {
        json!({ "content-available": 1 })
    } else {
        json!({
            "alert": {
                "title": notification.title,
                "body": notification.body,
            },
            "sound": "default",
            "mutable-content": 1,
        })
    };
    if let Some(thread_id) = &notification.thread_id {
        aps["thread-id"] = json!(thread_id);
    }

    let mut payload = json!({ "aps": aps });
    if let Some(obj) = payload.as_object_mut() {
        for (key, value) in &notification.data {
            let _ = obj.insert(key.clone(), json!(value));
        }
    }
    payload
}

/// Reasons an [`ApnsGateway`] cannot be built or cannot sign.
#[derive(Debug, thiserror::Error)]
pub enum ApnsError {
    /// The `.p8` file could not be read.
    #[error("cannot read APNS key {}: {source}", path.display())]
    KeyRead {
        /// Resolved key path.
        path: std::path::PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
    /// The key file did not hold an ES256 key.
    #[error("APNS key is not a PKCS#8 EC key: {0}")]
    KeyParse(#[source] jsonwebtoken::errors::Error),
    /// TLS or HTTP/2 client setup failed.
    #[error("cannot build APNS HTTP/2 client: {0}")]
    Http(#[source] reqwest::Error),
    /// JWT signing failed.
    #[error("cannot sign APNS provider token: {0}")]
    Sign(#[source] jsonwebtoken::errors::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::collections::HashMap;

    fn notification(title: Option<&str>, body: Option<&str>) -> Notification {
        let mut data = HashMap::new();
        let _ = data.insert("conversationId".to_string(), "c1".to_string());
        Notification {
            title: title.map(String::from),
            body: body.map(String::from),
            data,
            thread_id: Some("c1".into()),
        }
    }

    #[test]
    fn alert_payload() {
        let payload = build_payload(&notification(Some("Math 101"), Some("hi")));
        assert_eq!(payload["aps"]["alert"]["title"], "Math 101");
        assert_eq!(payload["aps"]["alert"]["body"], "hi");
        assert_eq!(payload["aps"]["thread-id"], "c1");
        assert_eq!(payload["aps"]["mutable-content"], 1);
        assert_eq!(payload["conversationId"], "c1");
    }

    #[test]
    fn silent_payload_has_no_alert() {
        let payload = build_payload(&notification(None, None));
        assert!(payload["aps"]["alert"].is_null());
        assert_eq!(payload["aps"]["content-available"], 1);
        assert_eq!(payload["conversationId"], "c1");
    }

    #[test]
    fn missing_key_file() {
        let settings = ApnsSettings {
            key_path: "/nonexistent/AuthKey.p8".into(),
            ..ApnsSettings::default()
        };
        let err = ApnsGateway::new(settings).unwrap_err();
        assert!(matches!(err, ApnsError::KeyRead { .. }));
    }

    #[test]
    fn garbage_key_rejected() {
        let err = ApnsGateway::from_pem(ApnsSettings::default(), b"not a key").unwrap_err();
        assert!(matches!(err, ApnsError::KeyParse(_)));
    }

    #[test]
    fn provider_token_goes_stale() {
        let token = ProviderToken {
            jwt: "jwt".into(),
            minted: Instant::now(),
        };
        assert_eq!(token.fresh(), Some("jwt"));

        let Some(minted) = Instant::now().checked_sub(REFRESH_AFTER) else {
            return;
        };
        let stale = ProviderToken {
            jwt: "jwt".into(),
            minted,
        };
        assert_eq!(stale.fresh(), None);
    }

    fn failure(token: &str, status: Option<u16>) -> TokenFailure {
        TokenFailure {
            token: token.into(),
            status,
            reason: if status.is_some() { "BadDeviceToken" } else { "connection refused" }.into(),
        }
    }

    #[test]
    fn all_transport_failures_are_direct() {
        let err = summarize(2, vec![failure("t1", None), failure("t2", None)]).unwrap_err();
        assert_matches!(err, NotificationError::Direct { ref reason } if reason == "connection refused");
    }

    #[test]
    fn answered_failures_stay_partial() {
        let err = summarize(2, vec![failure("t1", Some(400)), failure("t2", None)]).unwrap_err();
        assert_matches!(err, NotificationError::Partial { report, .. } if report.failure == 2);

        let err = summarize(3, vec![failure("t1", None)]).unwrap_err();
        assert_matches!(err, NotificationError::Partial { report, .. } if report.success == 2);
    }

    #[test]
    fn clean_batch_is_ok() {
        let report = summarize(2, Vec::new()).unwrap();
        assert_eq!((report.success, report.failure), (2, 0));
    }

    #[test]
    fn token_prefix_is_bounded() {
        assert_eq!(prefix("abcdefghijk"), "abcdefgh");
        assert_eq!(prefix("abc"), "abc");
    }
}
