//! In-process bus backed by tokio broadcast channels.
//!
//! One channel per topic. Several routers sharing a `LocalBus` behave like a
//! cluster of nodes, which is how single-node deployments and the tests run.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::warn;

use super::{BusError, MessageBus, PublishAck, Subscription, validate_payload, validate_topic};

/// Default per-topic buffer.
const DEFAULT_CAPACITY: usize = 4096;

/// In-process [`MessageBus`].
#[derive(Clone, Debug)]
pub struct LocalBus {
    topics: Arc<DashMap<String, broadcast::Sender<Arc<[u8]>>>>,
    capacity: usize,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl LocalBus {
    /// Bus buffering up to `capacity` payloads per topic for slow subscribers.
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Drop every topic; open subscriptions end.
    pub fn close(&self) {
        self.topics.clear();
    }

    /// Current subscriber count of `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, |tx| tx.receiver_count())
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<PublishAck, BusError> {
        validate_topic(topic)?;
        validate_payload(&payload)?;
        let no_subscribers = || BusError::NoSubscribers {
            topic: topic.to_owned(),
        };

        let tx = self.topics.get(topic).ok_or_else(no_subscribers)?;
        let receivers = tx.send(Arc::from(payload)).map_err(|_| no_subscribers())?;
        Ok(PublishAck { receivers })
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError> {
        validate_topic(topic)?;
        let rx = self
            .topics
            .entry(topic.to_owned())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        let topic = topic.to_owned();
        let stream = BroadcastStream::new(rx).filter_map(move |item| {
            let topic = topic.clone();
            async move {
                match item {
                    Ok(payload) => Some(payload.to_vec()),
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(topic = %topic, skipped, "bus subscriber lagged, payloads lost");
                        None
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn publish_without_subscribers() {
        let bus = LocalBus::default();
        let err = bus.publish("t", b"x".to_vec()).await.unwrap_err();
        assert_matches!(err, BusError::NoSubscribers { .. });
    }

    #[tokio::test]
    async fn every_subscriber_receives() {
        let bus = LocalBus::default();
        let mut a = bus.subscribe("t").await.unwrap();
        let mut b = bus.subscribe("t").await.unwrap();
        let _other = bus.subscribe("other").await.unwrap();

        let ack = bus.publish("t", b"hello".to_vec()).await.unwrap();
        assert_eq!(ack.receivers, 2);
        assert_eq!(a.next().await.unwrap(), b"hello");
        assert_eq!(b.next().await.unwrap(), b"hello");
        assert_eq!(bus.subscriber_count("t"), 2);
    }

    #[tokio::test]
    async fn dropped_subscribers_leave_topic_empty() {
        let bus = LocalBus::default();
        let sub = bus.subscribe("t").await.unwrap();
        drop(sub);
        assert_matches!(
            bus.publish("t", b"x".to_vec()).await,
            Err(BusError::NoSubscribers { .. })
        );
    }

    #[tokio::test]
    async fn close_ends_subscriptions() {
        let bus = LocalBus::default();
        let mut sub = bus.subscribe("t").await.unwrap();
        bus.close();
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn invalid_topic_rejected() {
        let bus = LocalBus::default();
        assert_matches!(bus.subscribe("").await.err(), Some(BusError::InvalidTopic(_)));
    }
}
