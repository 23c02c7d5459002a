//! Connection registry: a fixed array of shards.
//!
//! A user's sessions always live on the same shard, picked by a stable
//! FNV-1a hash of the user id, so register, unregister and broadcast for
//! one user are totally ordered and never cross shards.

mod shard;

pub use shard::{Broadcast, ProbeSnapshot, Shard, ShardContext, ShardPhase};

use std::sync::Arc;

use courier_core::constants::SHARD_CONTROL_QUEUE_DEPTH;
use courier_core::events::ScopedEvent;
use courier_core::ids::UserId;
use tracing::info;

use crate::errors::ShardError;
use crate::session::ClientSession;
use crate::shutdown::ShutdownCoordinator;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a.
pub fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(FNV_PRIME)
    })
}

/// Hub construction parameters.
#[derive(Clone, Debug)]
pub struct HubConfig {
    /// Number of shards (at least one).
    pub shard_count: usize,
    /// Per-shard broadcast queue depth.
    pub broadcast_queue_depth: usize,
    /// Node name handed to every shard.
    pub node: Arc<str>,
}

/// The shard array.
#[derive(Debug)]
pub struct Hub {
    shards: Vec<Shard>,
}

impl Hub {
    /// Spawn `config.shard_count` shard loops under `shutdown`.
    pub fn start(config: &HubConfig, shutdown: &ShutdownCoordinator) -> Arc<Self> {
        let count = config.shard_count.max(1);
        let ctx = ShardContext {
            node: config.node.clone(),
        };
        let shards = (0..count)
            .map(|id| {
                let (shard, run) = Shard::new(
                    id,
                    ctx.clone(),
                    SHARD_CONTROL_QUEUE_DEPTH,
                    config.broadcast_queue_depth,
                    shutdown.child_token(),
                );
                shutdown.spawn("shard", move |_token| run);
                shard
            })
            .collect();
        info!(
            node = %config.node,
            shards = count,
            queue_depth = config.broadcast_queue_depth,
            "connection hub started"
        );
        Arc::new(Self { shards })
    }

    /// Shard responsible for `user_id`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn shard_for(&self, user_id: &UserId) -> &Shard {
        let slot = fnv1a(user_id.as_bytes()) % self.shards.len() as u64;
        &self.shards[slot as usize]
    }

    /// Index `session` on its shard.
    pub async fn register(&self, session: Arc<ClientSession>) -> Result<(), ShardError> {
        self.shard_for(session.user_id()).register(session).await
    }

    /// Remove `session` from its shard.
    pub async fn unregister(&self, session: Arc<ClientSession>) -> Result<(), ShardError> {
        self.shard_for(session.user_id()).unregister(session).await
    }

    /// Queue `event` for every local session of `user_id`.
    pub async fn broadcast(
        &self,
        user_id: &UserId,
        event: Arc<ScopedEvent>,
    ) -> Result<(), ShardError> {
        self.shard_for(user_id)
            .broadcast(user_id.clone(), event)
            .await
    }

    /// Queue `event` for each of `user_ids`. Stops at the first stopped shard.
    pub async fn broadcast_many(
        &self,
        user_ids: &[UserId],
        event: &Arc<ScopedEvent>,
    ) -> Result<(), ShardError> {
        for user_id in user_ids {
            self.broadcast(user_id, event.clone()).await?;
        }
        Ok(())
    }

    /// Sessions indexed across all shards.
    pub fn connection_count(&self) -> usize {
        self.shards.iter().map(Shard::connection_count).sum()
    }

    /// Number of shards.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// All shards, for the watchdog.
    pub fn shards(&self) -> &[Shard] {
        &self.shards
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use courier_core::events::Event;
    use courier_core::ids::{SessionId, TenantId};

    use crate::testing::{new_message, wait_for};

    fn start(shards: usize) -> (Arc<Hub>, ShutdownCoordinator) {
        let shutdown = ShutdownCoordinator::new();
        let hub = Hub::start(
            &HubConfig {
                shard_count: shards,
                broadcast_queue_depth: 64,
                node: Arc::from("n1"),
            },
            &shutdown,
        );
        (hub, shutdown)
    }

    #[test]
    fn fnv1a_known_vectors() {
        assert_eq!(fnv1a(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a(b"a"), 0xaf63_dc4c_8601_ec8c);
    }

    #[tokio::test]
    async fn same_user_always_same_shard() {
        let (hub, _shutdown) = start(8);
        let user = UserId::from("user-42");
        let first = hub.shard_for(&user).id();
        for _ in 0..10 {
            assert_eq!(hub.shard_for(&user).id(), first);
        }
        assert_eq!(hub.shard_count(), 8);
    }

    #[tokio::test]
    async fn zero_shards_rounds_up_to_one() {
        let (hub, shutdown) = start(0);
        assert_eq!(hub.shard_count(), 1);
        assert_eq!(shutdown.task_count(), 1);
    }

    #[tokio::test]
    async fn broadcast_many_reaches_every_user() {
        let (hub, _shutdown) = start(4);
        let mut queues = Vec::new();
        for user in ["a", "b", "c"] {
            let (s, q) = ClientSession::with_id(
                SessionId::from(format!("s-{user}")),
                UserId::from(user),
                TenantId::from("t"),
                4,
            );
            hub.register(s).await.unwrap();
            queues.push(q);
        }
        wait_for(|| hub.connection_count() == 3).await;

        let event = Arc::new(ScopedEvent::new(TenantId::from("t"), new_message("c", "m")));
        let users = [UserId::from("a"), UserId::from("b"), UserId::from("c")];
        hub.broadcast_many(&users, &event).await.unwrap();

        for q in &mut queues {
            let got = q.recv().await.unwrap();
            assert!(matches!(got.event, Event::NewMessage(_)));
        }
    }

    #[tokio::test]
    async fn shutdown_stops_every_shard() {
        let (hub, shutdown) = start(3);
        shutdown.drain(Duration::from_secs(5)).await;
        assert!(hub.shards().iter().all(Shard::is_stopped));
        let event = Arc::new(ScopedEvent::new(
            TenantId::from("t"),
            Event::ping(SessionId::from("s")),
        ));
        let err = hub.broadcast(&UserId::from("a"), event).await.unwrap_err();
        assert!(matches!(err, ShardError::Stopped { .. }));
    }
}
