//! Outbound packets the core itself emits.
//!
//! Everything else on the wire belongs to the handlers registered in the
//! dispatch table; the core only owns lifecycle notifications.

use crate::stage::Object;
use channel_protocol::frame::opcodes;
use channel_protocol::{ClientContext, Opcode, PacketBuild};

/// Keepalive reply.
pub struct Pong;

impl PacketBuild for Pong {
    fn opcode(&self) -> Opcode {
        opcodes::PONG
    }

    fn build(&self, _ctx: &ClientContext) -> Vec<u8> {
        Vec::new()
    }
}

/// Stage-transfer completion notification.
///
/// Always sent to the transferring session, even with nothing to describe;
/// clients stall waiting for the zone-change acknowledgment otherwise.
#[derive(Default)]
pub struct TransferComplete {
    /// Character ids already present in the destination stage
    pub present_chars: Vec<u32>,
}

impl PacketBuild for TransferComplete {
    fn opcode(&self) -> Opcode {
        opcodes::TRANSFER_COMPLETE
    }

    fn build(&self, _ctx: &ClientContext) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.present_chars.len() * 4);
        out.extend_from_slice(&(self.present_chars.len() as u16).to_be_bytes());
        for char_id in &self.present_chars {
            out.extend_from_slice(&char_id.to_be_bytes());
        }
        out
    }
}

/// A stage-owned object was deleted because its owner left.
pub struct ObjectDeleted {
    pub object: Object,
}

impl PacketBuild for ObjectDeleted {
    fn opcode(&self) -> Opcode {
        opcodes::OBJECT_DELETED
    }

    fn build(&self, _ctx: &ClientContext) -> Vec<u8> {
        self.object.id.to_be_bytes().to_vec()
    }
}

/// Tells a reserved member to tear down its local view of a stage.
pub struct StageDestruct {
    pub stage_id: String,
}

impl PacketBuild for StageDestruct {
    fn opcode(&self) -> Opcode {
        opcodes::STAGE_DESTRUCT
    }

    fn build(&self, _ctx: &ClientContext) -> Vec<u8> {
        self.stage_id.as_bytes().to_vec()
    }
}

/// New mail is waiting for the recipient.
pub struct MailNotice;

impl PacketBuild for MailNotice {
    fn opcode(&self) -> Opcode {
        opcodes::MAIL_NOTICE
    }

    fn build(&self, _ctx: &ClientContext) -> Vec<u8> {
        Vec::new()
    }
}
