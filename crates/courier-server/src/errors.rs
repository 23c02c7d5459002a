//! Error types for the fan-out core.

use courier_core::errors::ErrorKind;
use courier_core::ids::UserId;
use courier_store::StoreError;
use thiserror::Error;

use crate::bus::BusError;
use crate::notify::NotificationError;

/// A shard refused work.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ShardError {
    /// The shard loop has exited.
    #[error("shard {shard} stopped")]
    Stopped {
        /// Shard index.
        shard: usize,
    },
}

impl ShardError {
    /// Classification of this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Stopped { .. } => ErrorKind::Unavailable,
        }
    }
}

/// Errors surfaced by the dispatch router.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Caller input was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The user has no recent session anywhere.
    #[error("user {0} is not online")]
    NotOnline(UserId),

    /// Presence store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Publish failure the policy chose to escalate.
    #[error(transparent)]
    Bus(#[from] BusError),

    /// Notification gateway rejected the whole batch.
    #[error(transparent)]
    Notification(#[from] NotificationError),

    /// Local delivery could not be queued.
    #[error(transparent)]
    Shard(#[from] ShardError),

    /// An inbound envelope could not be decoded.
    #[error("malformed envelope: {0}")]
    Decode(#[from] serde_json::Error),
}

impl DispatchError {
    /// Classification of this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::NotOnline(_) => ErrorKind::NotFound,
            Self::Store(e) => e.kind(),
            Self::Bus(e) => e.kind(),
            Self::Notification(e) => e.kind(),
            Self::Shard(e) => e.kind(),
            Self::Decode(_) => ErrorKind::ProtocolViolation,
        }
    }
}
