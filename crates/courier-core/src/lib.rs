//! # courier-core
//!
//! Foundation types shared by every Courier crate:
//!
//! - **Branded IDs**: `SessionId`, `UserId`, `TenantId`, `ConversationId`, `MessageId`
//! - **Events**: the closed [`Event`](events::Event) union pushed to clients, plus
//!   [`ScopedEvent`](events::ScopedEvent) and the [`CrossNodeEnvelope`](events::CrossNodeEnvelope)
//!   carried on the pub/sub bus
//! - **Options**: [`PushOptions`](options::PushOptions) controlling notification fallback
//! - **Errors**: [`ErrorKind`](errors::ErrorKind) classification shared by all error enums
//! - **Logging**: subscriber bootstrap and log capture for tests

#![deny(unsafe_code)]

pub mod constants;
pub mod errors;
pub mod events;
pub mod ids;
pub mod logging;
pub mod options;
pub mod retry;
