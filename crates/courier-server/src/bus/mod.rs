//! Pub/sub bus carrying [`CrossNodeEnvelope`](courier_core::events::CrossNodeEnvelope)s
//! between nodes.
//!
//! [`LocalBus`] is in-process and always available; `RedisBus` is compiled
//! in with the `redis` feature.

mod local;
#[cfg(feature = "redis")]
mod redis_bus;

pub use local::LocalBus;
#[cfg(feature = "redis")]
pub use redis_bus::RedisBus;

use async_trait::async_trait;
use courier_core::errors::ErrorKind;
use futures::stream::BoxStream;
use thiserror::Error;

/// Largest payload a bus accepts.
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Stream of raw payloads from a subscription.
pub type Subscription = BoxStream<'static, Vec<u8>>;

/// Acknowledgement of a successful publish.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublishAck {
    /// Subscribers that received the payload, when the bus reports it.
    pub receivers: usize,
}

/// Bus failures.
#[derive(Debug, Error)]
pub enum BusError {
    /// Nobody is subscribed to the topic.
    #[error("no subscribers on topic {topic}")]
    NoSubscribers {
        /// Topic published to.
        topic: String,
    },

    /// The broker did not answer in time.
    #[error("publish to {topic} timed out")]
    Timeout {
        /// Topic published to.
        topic: String,
    },

    /// Connection to the broker failed or was lost.
    #[error("bus connection error: {0}")]
    Connection(String),

    /// Payload exceeds [`MAX_PAYLOAD_BYTES`].
    #[error("payload of {size} bytes exceeds limit of {limit}")]
    PayloadTooLarge {
        /// Payload size.
        size: usize,
        /// Accepted maximum.
        limit: usize,
    },

    /// Topic name is empty or malformed.
    #[error("invalid topic {0:?}")]
    InvalidTopic(String),

    /// Envelope could not be encoded.
    #[error("failed to encode envelope: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The bus was shut down.
    #[error("bus closed")]
    Closed,
}

impl BusError {
    /// Classification of this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoSubscribers { .. } | Self::Timeout { .. } | Self::Connection(_) => {
                ErrorKind::Transient
            }
            Self::PayloadTooLarge { .. } | Self::InvalidTopic(_) => ErrorKind::InvalidArgument,
            Self::Serialization(_) => ErrorKind::Internal,
            Self::Closed => ErrorKind::Unavailable,
        }
    }
}

/// A topic-based publish/subscribe transport.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish `payload` on `topic`.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<PublishAck, BusError>;

    /// Subscribe to `topic`. The stream ends when the bus shuts down.
    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError>;
}

/// Reject empty topics and topics containing whitespace.
pub fn validate_topic(topic: &str) -> Result<(), BusError> {
    if topic.is_empty() || topic.chars().any(char::is_whitespace) {
        return Err(BusError::InvalidTopic(topic.to_owned()));
    }
    Ok(())
}

/// Reject payloads over [`MAX_PAYLOAD_BYTES`].
pub fn validate_payload(payload: &[u8]) -> Result<(), BusError> {
    if payload.len() > MAX_PAYLOAD_BYTES {
        return Err(BusError::PayloadTooLarge {
            size: payload.len(),
            limit: MAX_PAYLOAD_BYTES,
        });
    }
    Ok(())
}
