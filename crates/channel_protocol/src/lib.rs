//! # Channel Protocol - Framing Boundary
//!
//! Shared protocol primitives consumed by the channel server core. This crate
//! owns the opcode/frame boundary between the network and the session layer:
//!
//! * **Frame codec** - Length-prefixed opcode + payload units on the wire
//! * **Dispatch table** - Static opcode-to-handler routing, built exactly once
//!   during server construction and shared read-only thereafter
//! * **Ack convention** - Numbered acknowledgment handles used to correlate
//!   asynchronous replies with their originating requests
//!
//! The full per-message game codec lives outside this crate; the core only
//! treats a payload as an opaque buildable/encodable unit dispatched by opcode.

pub mod dispatch;
pub mod frame;

pub use dispatch::{DispatchTable, DispatchTableBuilder, HandlerError};
pub use frame::{encode_frame, read_frame, write_frame, Opcode};

/// Caller-supplied correlation id used to match an asynchronous reply to its
/// originating request.
pub type AckHandle = u32;

/// Per-connection encoding context.
///
/// Different sessions may need different per-connection encoding (e.g. a
/// rolling obfuscation key negotiated at connect time), so outbound packets
/// are serialized once per recipient against that recipient's context.
#[derive(Debug, Clone, Default)]
pub struct ClientContext {
    /// Per-connection obfuscation key applied to outbound payloads
    pub key: u8,
}

/// An outbound unit the core can serialize for a specific recipient.
///
/// Handlers hand the core values implementing this trait; the core picks the
/// recipients and calls [`PacketBuild::build`] once per recipient with that
/// recipient's [`ClientContext`].
pub trait PacketBuild: Send + Sync {
    /// The opcode identifying this packet on the wire
    fn opcode(&self) -> Opcode;

    /// Serializes the payload for one recipient.
    fn build(&self, ctx: &ClientContext) -> Vec<u8>;
}

/// Reply to a numbered request: success or failure plus an opaque payload.
///
/// The core's only job is to route the encoded response to the correct
/// session's send queue; it never interprets the payload.
#[derive(Debug, Clone)]
pub struct AckResponse {
    /// The correlation handle supplied by the requester
    pub handle: AckHandle,
    /// Whether the request was honored
    pub succeeded: bool,
    /// Opaque response payload
    pub payload: Vec<u8>,
}

impl AckResponse {
    /// Builds a success response carrying the given payload.
    pub fn success(handle: AckHandle, payload: Vec<u8>) -> Self {
        Self { handle, succeeded: true, payload }
    }

    /// Builds a failure response with an empty payload.
    pub fn failure(handle: AckHandle) -> Self {
        Self { handle, succeeded: false, payload: Vec::new() }
    }
}

impl PacketBuild for AckResponse {
    fn opcode(&self) -> Opcode {
        frame::opcodes::ACK
    }

    fn build(&self, _ctx: &ClientContext) -> Vec<u8> {
        let mut out = Vec::with_capacity(5 + self.payload.len());
        out.extend_from_slice(&self.handle.to_be_bytes());
        out.push(u8::from(self.succeeded));
        out.extend_from_slice(&self.payload);
        out
    }
}
