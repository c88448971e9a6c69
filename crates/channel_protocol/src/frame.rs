//! Wire framing for channel traffic.
//!
//! Each unit on the wire is a four-byte header (big-endian opcode, big-endian
//! payload length) followed by the payload bytes. Payloads are opaque to this
//! layer; interpreting them belongs to the handlers registered in the
//! dispatch table.

use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Identifies the type of an inbound or outbound unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Opcode(pub u16);

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

/// Opcodes the core itself emits. Game-logic opcodes live with their handlers.
pub mod opcodes {
    use super::Opcode;

    /// Reply to a numbered ack handle
    pub const ACK: Opcode = Opcode(0x0001);
    /// Keepalive request from the client
    pub const PING: Opcode = Opcode(0x0002);
    /// Keepalive reply
    pub const PONG: Opcode = Opcode(0x0003);
    /// Stage-transfer completion notification; always sent, even when empty
    pub const TRANSFER_COMPLETE: Opcode = Opcode(0x0010);
    /// A stage-owned object was deleted (owner left the stage)
    pub const OBJECT_DELETED: Opcode = Opcode(0x0011);
    /// The client must tear down its local view of a stage it had reserved
    pub const STAGE_DESTRUCT: Opcode = Opcode(0x0012);
    /// New mail is waiting for the recipient
    pub const MAIL_NOTICE: Opcode = Opcode(0x0020);
}

/// Maximum payload size a single frame may carry.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// Encodes a complete frame into a fresh buffer.
pub fn encode_frame(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    debug_assert!(payload.len() <= MAX_PAYLOAD);
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&opcode.0.to_be_bytes());
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Reads one frame from the stream.
///
/// Returns `Ok(None)` on a clean end-of-stream at a frame boundary; an EOF in
/// the middle of a frame is an error.
pub async fn read_frame<R>(reader: &mut R) -> std::io::Result<Option<(Opcode, Vec<u8>)>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let opcode = Opcode(u16::from_be_bytes([header[0], header[1]]));
    let len = u16::from_be_bytes([header[2], header[3]]) as usize;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some((opcode, payload)))
}

/// Writes one frame to the stream and flushes it.
pub async fn write_frame<W>(writer: &mut W, opcode: Opcode, payload: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_frame(opcode, payload)).await?;
    writer.flush().await
}
