//! Shard server: accept loop, session registration, stage transfer, and the
//! idle reaper.

pub mod connection;
pub mod core;
pub mod packets;
pub mod transfer;

pub use connection::HandlerContext;
pub use core::{core_dispatch_table, Server};
