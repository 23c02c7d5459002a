//! # courier-store
//!
//! Persistence for the fan-out core:
//!
//! - **`SQLite` layer** ([`sqlite`]): r2d2 pool, versioned migrations, and
//!   stateless repositories for presence rows and device tokens
//! - **Presence** ([`presence`]): [`PresenceStore`], a TTL read cache in front
//!   of any [`PresenceBackend`], answering "which node holds this user?"
//! - **Device tokens** ([`tokens`]): the [`DeviceTokenSource`] consulted for
//!   offline push notifications

#![deny(unsafe_code)]

pub mod errors;
pub mod presence;
pub mod sqlite;
pub mod tokens;

pub use errors::{Result, StoreError};
pub use presence::{
    NodeMap, OnlineEntry, PresenceBackend, PresenceRecord, PresenceStore, SqlitePresenceBackend,
};
pub use tokens::{DeviceToken, DeviceTokenSource, SqliteDeviceTokens};
