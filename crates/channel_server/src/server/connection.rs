//! Per-connection tasks: the packet loop and the outbound writer.
//!
//! Each accepted connection gets two tasks. The writer drains the session's
//! send queue onto the socket. The packet loop reads frames and dispatches
//! them through the shard's dispatch table under a recovered-panic boundary,
//! so a decode failure or handler bug is contained to the one packet that
//! caused it and never reaches the server or other sessions.

use crate::server::Server;
use crate::session::Session;
use channel_protocol::{read_frame, HandlerError};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, trace};

/// Context handed to every dispatched handler.
#[derive(Clone)]
pub struct HandlerContext {
    /// The shard the frame arrived on
    pub server: Arc<Server>,
    /// The session that sent the frame
    pub session: Arc<Session>,
}

/// Spawns the writer task and the packet loop for a freshly registered
/// session. Called by the registrar after the session is in the session set.
pub fn spawn_session_tasks(
    server: Arc<Server>,
    session: Arc<Session>,
    stream: TcpStream,
    send_rx: mpsc::Receiver<Vec<u8>>,
) {
    let (read_half, write_half) = stream.into_split();

    // The writer must not hold the session: the send queue only closes once
    // the session (which owns the sender) is dropped.
    tokio::spawn(run_writer(session.id, write_half, send_rx));
    tokio::spawn(run_packet_loop(server, session, read_half));
}

/// Drains the send queue onto the socket until the queue closes or the
/// socket dies.
async fn run_writer(
    session_id: u64,
    mut write_half: OwnedWriteHalf,
    mut send_rx: mpsc::Receiver<Vec<u8>>,
) {
    while let Some(frame) = send_rx.recv().await {
        if let Err(e) = write_half.write_all(&frame).await {
            debug!("Write to session {} failed: {}", session_id, e);
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

/// Pumps inbound frames through the dispatch table.
///
/// Runs until the connection closes, then deregisters the session from the
/// shard. Shutdown does not interrupt this loop; sessions drain naturally.
async fn run_packet_loop(server: Arc<Server>, session: Arc<Session>, mut read_half: OwnedReadHalf) {
    loop {
        let frame = tokio::select! {
            frame = read_frame(&mut read_half) => frame,
            _ = session.closed() => {
                debug!("Session {} closed by server", session.id);
                break;
            }
        };
        let (opcode, payload) = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                trace!("Session {} disconnected", session.id);
                break;
            }
            Err(e) => {
                debug!("Read error on session {}: {}", session.id, e);
                break;
            }
        };

        session.touch();

        let ctx = HandlerContext { server: server.clone(), session: session.clone() };
        let Some(fut) = server.dispatch_table().dispatch(ctx, opcode, payload) else {
            debug!("Session {} sent unhandled opcode {}", session.id, opcode);
            continue;
        };

        // The panic boundary: a handler failure is logged and the session
        // continues with the next frame.
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(HandlerError::SessionClosed)) => {
                debug!("Handler closed session {}", session.id);
                break;
            }
            Ok(Err(e)) => {
                error!("Handler for opcode {} on session {} failed: {}", opcode, session.id, e);
            }
            Err(panic) => {
                let msg = panic_message(&panic);
                error!(
                    "Recovered panic in handler for opcode {} on session {}: {}",
                    opcode, session.id, msg
                );
            }
        }
    }

    server.deregister_session(session).await;
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
