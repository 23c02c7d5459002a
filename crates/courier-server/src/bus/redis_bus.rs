//! Redis `PUBLISH` / `SUBSCRIBE` bus.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use tracing::{debug, info};

use super::{BusError, MessageBus, PublishAck, Subscription, validate_payload, validate_topic};

/// Default deadline for a single `PUBLISH`.
const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(2);

/// [`MessageBus`] over a Redis server.
#[derive(Clone)]
pub struct RedisBus {
    client: redis::Client,
    conn: MultiplexedConnection,
    publish_timeout: Duration,
}

impl std::fmt::Debug for RedisBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBus")
            .field("publish_timeout", &self.publish_timeout)
            .finish_non_exhaustive()
    }
}

fn connection_error(e: &redis::RedisError) -> BusError {
    BusError::Connection(e.to_string())
}

impl RedisBus {
    /// Connect to `url` (`redis://host:port/db`).
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url).map_err(|e| connection_error(&e))?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| connection_error(&e))?;
        info!("redis bus connected");
        Ok(Self {
            client,
            conn,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
        })
    }

    /// Override the publish deadline.
    #[must_use]
    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<PublishAck, BusError> {
        validate_topic(topic)?;
        validate_payload(&payload)?;

        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("PUBLISH");
        let _ = cmd.arg(topic).arg(payload);
        let receivers = tokio::time::timeout(self.publish_timeout, cmd.query_async::<usize>(&mut conn))
            .await
            .map_err(|_| BusError::Timeout {
                topic: topic.to_owned(),
            })?
            .map_err(|e| {
                if e.is_timeout() {
                    BusError::Timeout {
                        topic: topic.to_owned(),
                    }
                } else {
                    connection_error(&e)
                }
            })?;

        if receivers == 0 {
            return Err(BusError::NoSubscribers {
                topic: topic.to_owned(),
            });
        }
        Ok(PublishAck { receivers })
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError> {
        validate_topic(topic)?;
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| connection_error(&e))?;
        pubsub
            .subscribe(topic)
            .await
            .map_err(|e| connection_error(&e))?;
        debug!(topic, "redis subscription established");

        let stream = pubsub
            .into_on_message()
            .map(|msg| msg.get_payload_bytes().to_vec());
        Ok(stream.boxed())
    }
}
