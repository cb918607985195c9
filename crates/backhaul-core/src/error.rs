//! Control-plane error taxonomy
//!
//! None of these are connection-fatal: duplicate keys are resolved by
//! rejecting the candidate, unknown contexts degrade to a warning, and
//! release failures are isolated per resource.

use std::net::IpAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    /// A candidate's route key collides with an existing or same-batch entry
    #[error("duplicate route key: {0}")]
    DuplicateRouteKey(String),

    /// An event referenced a connection context that is not registered
    #[error("unknown connection context: {0}")]
    UnknownContext(String),

    /// A mutating operation reached a context that was already closed
    #[error("connection context is closed")]
    ContextClosed,

    /// The IP gate refused the peer
    #[error("peer denied by ip gate: {0}")]
    PeerDenied(IpAddr),
}

/// Failure reported by a data-plane release hook
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ReleaseFailure(pub String);
