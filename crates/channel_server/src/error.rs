//! Error types for the channel server core.

use std::net::SocketAddr;

/// Errors surfaced by server, stage, and semaphore operations.
///
/// Only [`ServerError::Bind`] is fatal to a shard. Contract violations
/// (`StageFull`, `DuplicateStage`, ...) are reported back to the requesting
/// session as a failure acknowledgment and mutate no shared state.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The listener could not be bound at startup. Fatal to the shard.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// A non-fatal network-level failure
    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    /// The destination stage is at capacity
    #[error("Stage {0} is full")]
    StageFull(String),

    /// The stage is locked against new reservations
    #[error("Stage {0} is locked")]
    StageLocked(String),

    /// The supplied stage password did not match
    #[error("Bad password for stage {0}")]
    BadPassword(String),

    /// A stage with this id already exists
    #[error("Stage {0} already exists")]
    DuplicateStage(String),

    /// The reservation request violated the one-reservation-per-session rule
    /// or targeted a stage the session cannot reserve
    #[error("Invalid reservation: {0}")]
    InvalidReservation(String),

    /// A repository call failed; logged and surfaced as a failure ack
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// The session's connection is no longer usable
    #[error("Session {0} closed")]
    SessionClosed(u64),
}
