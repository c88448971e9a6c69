//! Immutable value copies used for cross-shard search and display.
//!
//! Snapshots are built under the source session/stage lock, then used
//! lock-free by the caller. They carry no ownership back to the live
//! objects; mutating a snapshot has no effect on the source.

use crate::server::Server;
use crate::session::Session;
use crate::stage::Stage;
use std::collections::HashMap;

/// Copied view of one session for cross-shard queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Character bound to the session
    pub char_id: u32,
    /// Display name
    pub name: String,
    /// Stage the session was in when the snapshot was taken
    pub stage_id: Option<String>,
    /// Public address of the shard the session lives on
    pub server_addr: String,
}

impl SessionSnapshot {
    /// Builds a snapshot under the session's lock. Returns `None` for a
    /// session with no character bound yet.
    pub fn capture(server: &Server, session: &Session) -> Option<Self> {
        let state = session.state();
        let char_id = state.char_id?;
        Some(Self {
            char_id,
            name: state.name.clone(),
            stage_id: state.stage_id.as_ref().map(|id| id.0.clone()),
            server_addr: server.config().public_addr.clone(),
        })
    }
}

/// Copied view of one stage for cross-shard queries.
#[derive(Debug, Clone)]
pub struct StageSnapshot {
    /// Stage id
    pub id: String,
    /// Public address of the owning shard
    pub server_addr: String,
    /// Characters inside the stage when the snapshot was taken
    pub char_ids: Vec<u32>,
    /// Raw binary copies of the stage's keyed blobs
    pub binaries: HashMap<(u8, u8), Vec<u8>>,
}

impl StageSnapshot {
    /// Builds a snapshot; each field is copied under the stage's lock, which
    /// is released before this returns.
    pub fn capture(server: &Server, stage: &Stage) -> Self {
        Self {
            id: stage.id.0.clone(),
            server_addr: server.config().public_addr.clone(),
            char_ids: stage.clients().into_iter().map(|(_, char_id)| char_id).collect(),
            binaries: stage.binaries(),
        }
    }
}
