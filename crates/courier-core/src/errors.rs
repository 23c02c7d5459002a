//! Error classification shared by every Courier error type.
//!
//! Each crate defines its own `thiserror` enum; all of them map onto
//! [`ErrorKind`] so callers can decide how to react without matching on
//! crate-specific variants.

use serde::{Deserialize, Serialize};

/// Broad class of a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad caller input (missing session id, missing tenant). Never retried.
    InvalidArgument,
    /// Referenced entity does not exist (user not online).
    NotFound,
    /// Infrastructure hiccup (store timeout, bus failure). May be retried.
    Transient,
    /// A bounded local resource is full.
    ResourceExhausted,
    /// An invariant was violated (tenant mismatch).
    ProtocolViolation,
    /// Component is shutting down or already stopped.
    Unavailable,
    /// Anything else.
    Internal,
}

impl ErrorKind {
    /// Whether retrying the same operation can succeed.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::Unavailable)
    }

    /// Stable snake_case name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidArgument => "invalid_argument",
            Self::NotFound => "not_found",
            Self::Transient => "transient",
            Self::ResourceExhausted => "resource_exhausted",
            Self::ProtocolViolation => "protocol_violation",
            Self::Unavailable => "unavailable",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
