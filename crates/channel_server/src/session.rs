//! Session: the server's record of one accepted connection.
//!
//! A session owns a bounded send queue and the per-player identity fields the
//! packet loop mutates (character id, current stage, reservation, stage-move
//! history). Identity fields are guarded by the session's own lock and are
//! written only by the owning packet loop; other sessions reach a session
//! exclusively through its send queue or through registry snapshots.

use crate::error::ServerError;
use crate::stage::StageId;
use channel_protocol::{encode_frame, ClientContext, PacketBuild};
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tracing::trace;

/// Unique identifier of a session within its shard.
pub type SessionId = u64;

/// Mutable per-player fields, guarded by the session's own lock.
///
/// Only the owning packet loop mutates these; broadcast paths touch the send
/// queue only, never identity fields.
#[derive(Debug)]
pub struct SessionState {
    /// Character bound to this session at login
    pub char_id: Option<u32>,
    /// Display name
    pub name: String,
    /// Stage the session currently belongs to
    pub stage_id: Option<StageId>,
    /// Stage the session holds a reservation on, at most one at a time
    pub reservation_stage_id: Option<StageId>,
    /// Previously-visited stage ids, for "return to previous stage"
    pub stage_history: Vec<StageId>,
    /// Last time the packet loop saw traffic from this connection
    pub last_activity: Instant,
    /// Per-connection encoding context for outbound packets
    pub client_ctx: ClientContext,
    /// Data accumulated during play, persisted at logout
    pub save_data: Vec<u8>,
}

/// One accepted connection.
pub struct Session {
    /// Shard-unique session id
    pub id: SessionId,
    /// Remote network address
    pub remote_addr: SocketAddr,
    send_tx: mpsc::Sender<Vec<u8>>,
    state: Mutex<SessionState>,
    close: Notify,
}

impl Session {
    /// Creates a session and its send-queue receiver. The caller hands the
    /// receiver to the connection writer task.
    pub fn new(
        id: SessionId,
        remote_addr: SocketAddr,
        queue_capacity: usize,
    ) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (send_tx, send_rx) = mpsc::channel(queue_capacity);
        let session = Self {
            id,
            remote_addr,
            send_tx,
            state: Mutex::new(SessionState {
                char_id: None,
                name: String::new(),
                stage_id: None,
                reservation_stage_id: None,
                stage_history: Vec::new(),
                last_activity: Instant::now(),
                client_ctx: ClientContext::default(),
                save_data: Vec::new(),
            }),
            close: Notify::new(),
        };
        (session, send_rx)
    }

    /// Locks the identity fields.
    pub fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocking enqueue for protocol-critical packets.
    ///
    /// Waits for queue space; blocks only this sender, never the server.
    /// Fails only if the connection writer is gone.
    pub async fn queue_send(&self, packet: &dyn PacketBuild) -> Result<(), ServerError> {
        let frame = self.encode_for_self(packet);
        self.send_tx
            .send(frame)
            .await
            .map_err(|_| ServerError::SessionClosed(self.id))
    }

    /// Non-blocking enqueue for best-effort broadcasts.
    ///
    /// Drops the packet instead of stalling the sender when the queue is full
    /// or the connection is gone. Returns whether the frame was enqueued.
    pub fn queue_send_nonblock(&self, packet: &dyn PacketBuild) -> bool {
        let frame = self.encode_for_self(packet);
        match self.send_tx.try_send(frame) {
            Ok(()) => true,
            Err(e) => {
                trace!("Dropping packet for session {}: {}", self.id, e);
                false
            }
        }
    }

    fn encode_for_self(&self, packet: &dyn PacketBuild) -> Vec<u8> {
        let ctx = self.state().client_ctx.clone();
        encode_frame(packet.opcode(), &packet.build(&ctx))
    }

    /// Records inbound traffic for the idle reaper.
    pub fn touch(&self) {
        self.state().last_activity = Instant::now();
    }

    /// Time since the last inbound traffic.
    pub fn idle_for(&self) -> Duration {
        self.state().last_activity.elapsed()
    }

    /// Character id bound at login, if any.
    pub fn char_id(&self) -> Option<u32> {
        self.state().char_id
    }

    /// Binds the session to a character. Called once by the login flow.
    pub fn bind_character(&self, char_id: u32, name: String) {
        let mut state = self.state();
        state.char_id = Some(char_id);
        state.name = name;
    }

    /// Stage the session currently belongs to.
    pub fn stage_id(&self) -> Option<StageId> {
        self.state().stage_id.clone()
    }

    /// Asks the packet loop to stop servicing this connection. Used by the
    /// idle reaper and by registry-driven disconnects; a stored permit means
    /// the request is not lost if it races loop startup.
    pub fn close(&self) {
        self.close.notify_one();
    }

    /// Resolves when [`Session::close`] has been called.
    pub async fn closed(&self) {
        self.close.notified().await;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}
