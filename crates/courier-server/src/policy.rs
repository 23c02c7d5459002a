//! What to do when a cross-node publish fails.
//!
//! - *suppress*: nobody is listening or the bus is gone; log and move on
//! - *retry*: timeouts and connection loss, with exponential backoff; once
//!   attempts run out the failure is logged at error level and suppressed
//! - *escalate*: the payload or topic is wrong, returned to the caller

use courier_core::retry::RetryConfig;
use metrics::counter;
use tracing::{debug, error, warn};

use crate::bus::{BusError, MessageBus, PublishAck};
use crate::metrics::{CROSS_NODE_PUBLISH_TOTAL, PUBLISH_FAILURES_TOTAL};

/// Reaction to a [`BusError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishAction {
    /// Drop the envelope quietly.
    Suppress,
    /// Try again after a backoff.
    Retry,
    /// Return the error to the caller.
    Escalate,
}

impl PublishAction {
    /// Classify a publish error.
    pub fn classify(err: &BusError) -> Self {
        match err {
            BusError::NoSubscribers { .. } | BusError::Closed => Self::Suppress,
            BusError::Timeout { .. } | BusError::Connection(_) => Self::Retry,
            BusError::Serialization(_)
            | BusError::PayloadTooLarge { .. }
            | BusError::InvalidTopic(_) => Self::Escalate,
        }
    }
}

/// Result of a publish that did not escalate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The bus accepted the envelope.
    Delivered(PublishAck),
    /// The envelope was dropped.
    Suppressed {
        /// Attempts made.
        attempts: u32,
        /// Last error.
        reason: String,
    },
}

/// Publishes with classification and bounded retries.
#[derive(Clone, Debug, Default)]
pub struct PublishFailurePolicy {
    retry: RetryConfig,
}

impl PublishFailurePolicy {
    /// Policy with the given retry parameters.
    pub fn new(retry: RetryConfig) -> Self {
        Self { retry }
    }

    /// Publish `payload`, applying the policy to any failure.
    pub async fn publish(
        &self,
        bus: &dyn MessageBus,
        topic: &str,
        payload: Vec<u8>,
    ) -> Result<PublishOutcome, BusError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match bus.publish(topic, payload.clone()).await {
                Ok(ack) => {
                    counter!(CROSS_NODE_PUBLISH_TOTAL).increment(1);
                    return Ok(PublishOutcome::Delivered(ack));
                }
                Err(e) => e,
            };

            match PublishAction::classify(&err) {
                PublishAction::Suppress => {
                    debug!(topic, error = %err, "publish suppressed");
                    counter!(PUBLISH_FAILURES_TOTAL, "action" => "suppress").increment(1);
                    return Ok(PublishOutcome::Suppressed {
                        attempts: attempt,
                        reason: err.to_string(),
                    });
                }
                PublishAction::Escalate => {
                    counter!(PUBLISH_FAILURES_TOTAL, "action" => "escalate").increment(1);
                    return Err(err);
                }
                PublishAction::Retry if attempt < max_attempts => {
                    let delay = self.retry.delay_for(attempt - 1);
                    warn!(
                        topic,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "publish failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                PublishAction::Retry => {
                    error!(topic, attempts = attempt, error = %err, "publish failed, giving up");
                    counter!(PUBLISH_FAILURES_TOTAL, "action" => "retry_exhausted").increment(1);
                    return Ok(PublishOutcome::Suppressed {
                        attempts: attempt,
                        reason: err.to_string(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use assert_matches::assert_matches;
    use courier_core::logging::capture_logs;
    use tracing::Level;

    use crate::testing::ScriptedBus;

    fn timeout() -> BusError {
        BusError::Timeout {
            topic: "t".into(),
        }
    }

    #[test]
    fn classification() {
        assert_eq!(
            PublishAction::classify(&BusError::NoSubscribers { topic: "t".into() }),
            PublishAction::Suppress
        );
        assert_eq!(PublishAction::classify(&timeout()), PublishAction::Retry);
        assert_eq!(
            PublishAction::classify(&BusError::Connection("reset".into())),
            PublishAction::Retry
        );
        assert_eq!(
            PublishAction::classify(&BusError::PayloadTooLarge { size: 2, limit: 1 }),
            PublishAction::Escalate
        );
        assert_eq!(
            PublishAction::classify(&BusError::InvalidTopic(String::new())),
            PublishAction::Escalate
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retries_then_succeeds() {
        let bus = ScriptedBus::new(vec![Err(timeout()), Err(timeout())]);
        let policy = PublishFailurePolicy::default();
        let start = tokio::time::Instant::now();

        let outcome = policy.publish(&bus, "t", b"x".to_vec()).await.unwrap();
        assert_matches!(outcome, PublishOutcome::Delivered(_));
        assert_eq!(bus.attempts(), 3);
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_are_suppressed_with_error_log() {
        let (logs, _guard) = capture_logs();
        let bus = ScriptedBus::new(vec![Err(timeout()), Err(timeout()), Err(timeout())]);
        let policy = PublishFailurePolicy::default();

        let outcome = policy.publish(&bus, "t", b"x".to_vec()).await.unwrap();
        assert_matches!(outcome, PublishOutcome::Suppressed { attempts: 3, .. });
        assert_eq!(bus.attempts(), 3);
        assert!(logs.has_event(Level::ERROR, "giving up"));
    }

    #[tokio::test]
    async fn no_subscribers_is_suppressed_without_retry() {
        let bus = ScriptedBus::new(vec![Err(BusError::NoSubscribers { topic: "t".into() })]);
        let outcome = PublishFailurePolicy::default()
            .publish(&bus, "t", b"x".to_vec())
            .await
            .unwrap();
        assert_matches!(outcome, PublishOutcome::Suppressed { attempts: 1, .. });
        assert_eq!(bus.attempts(), 1);
    }

    #[tokio::test]
    async fn invalid_topic_escalates() {
        let bus = ScriptedBus::new(vec![Err(BusError::InvalidTopic(String::new()))]);
        let err = PublishFailurePolicy::default()
            .publish(&bus, "t", b"x".to_vec())
            .await
            .unwrap_err();
        assert_matches!(err, BusError::InvalidTopic(_));
        assert_eq!(bus.attempts(), 1);
    }
}
