//! # courier-server
//!
//! Real-time fan-out of chat events to connected clients across a cluster.
//!
//! - Connection registry ([`hub`]): sharded single-writer loops indexing live
//!   sessions by user
//! - Client sessions ([`session`]): bounded outbound queue, write pump,
//!   liveness timer and idempotent teardown
//! - Dispatch router ([`dispatch`]): presence lookup, local delivery,
//!   cross-node envelopes over a [`bus::MessageBus`] and offline
//!   notifications through a [`notify::PushGateway`]
//! - Deadlock watchdog ([`watchdog`]) and Prometheus [`metrics`]
//! - Axum HTTP + `WebSocket` transport ([`server`]) with graceful shutdown via
//!   `CancellationToken`

#![deny(unsafe_code)]

pub mod bus;
pub mod dispatch;
pub mod errors;
pub mod health;
pub mod hub;
pub mod metrics;
pub mod notify;
pub mod policy;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod transport;
pub mod watchdog;

#[cfg(test)]
pub(crate) mod testing;

pub use dispatch::{Dispatcher, DispatcherConfig, DispatcherDeps, PushReport};
pub use errors::{DispatchError, ShardError};
pub use server::{CourierServer, ServerDeps, ServerError, ServerHandle};
