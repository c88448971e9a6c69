//! # Channel Server - Shard Concurrency Core
//!
//! The concurrency and session-management core of a multiplayer game shard
//! ("channel"): a long-lived TCP service that accepts many concurrent client
//! connections, tracks each as a stateful session, groups sessions into
//! shared stages and semaphores, and exposes cross-shard operations through
//! a registry abstraction so a single logical world can later span multiple
//! processes.
//!
//! ## Core Components
//!
//! * **[`Server`]** - One shard: listener, session set, stage table,
//!   semaphore set, and the accept/registration/reaper workers
//! * **[`session::Session`]** - One accepted connection with its send queue
//!   and per-player state, panics isolated to itself
//! * **[`stage::Stage`]** - A named shared room guarded by a read-write lock
//! * **[`semaphore::SemaphoreSet`]** - Named coordination groups plus the
//!   shared raid counters
//! * **[`registry::ChannelRegistry`]** - Snapshot-based cross-shard queries
//!
//! ## Failure Containment
//!
//! A malformed packet or handler panic is recovered at the session boundary
//! and never reaches the server or other sessions. Contract violations
//! (stage full, duplicate stage) surface as failure acknowledgments without
//! mutating shared state. Only bind failure at startup is fatal to a shard.
//!
//! ## Lock Ordering
//!
//! Server-level state, then a stage lock, then the semaphore set. Stage
//! mutation and cross-session broadcast are two explicitly sequenced steps:
//! mutations return the notifications to send as data, and the caller sends
//! them only after the stage lock is released.

pub use config::{Args, Config, ShardConfig};
pub use error::ServerError;
pub use server::{core_dispatch_table, HandlerContext, Server};

pub mod config;
pub mod error;
pub mod logging;
pub mod registry;
pub mod repository;
pub mod semaphore;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod stage;
pub mod stage_map;
