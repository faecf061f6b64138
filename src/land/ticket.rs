//! Chunk tickets: client-held claims keeping terrain areas loaded.

use glam::IVec3;

use super::chunk_key::ChunkKey;
use super::consts as Consts;
use crate::core::Uid;
use crate::svc::{Message, MessageSender};

/// Axis-aligned box of chunk keys, `begin` inclusive, `end` exclusive.
/// Both keys must share one scale; iteration steps by that scale.
#[derive(Clone, Copy, Debug)]
pub struct ChunkTicketBoxArea {
    pub begin: ChunkKey,
    pub end: ChunkKey,
}

/// Concentric-octahedra area around a pivot key, radius in scaled units
#[derive(Clone, Copy, Debug)]
pub struct ChunkTicketOctahedronArea {
    pub pivot: ChunkKey,
    pub scaled_radius: u32,
}

#[derive(Clone, Copy, Debug)]
pub enum ChunkTicketArea {
    Box(ChunkTicketBoxArea),
    Octahedron(ChunkTicketOctahedronArea),
}

impl ChunkTicketArea {
    /// Scale of the area's keys, used as the base loading priority
    pub(crate) fn priority(&self) -> i32 {
        match self {
            ChunkTicketArea::Box(area) => area.begin.scale_log2 as i32,
            ChunkTicketArea::Octahedron(area) => area.pivot.scale_log2 as i32,
        }
    }

    pub(crate) fn validate(&self) -> bool {
        match self {
            ChunkTicketArea::Box(area) => {
                if area.begin.scale_log2 != area.end.scale_log2
                    || area.begin.scale_log2 >= Consts::NUM_LOD_SCALES
                {
                    return false;
                }

                let step = area.begin.scale_multiplier();
                let size: IVec3 = (area.end.base() - area.begin.base()) / step;
                size.cmpgt(IVec3::ZERO).all()
                    && size.cmple(IVec3::splat(Consts::MAX_TICKET_BOX_AREA_SIZE)).all()
            }
            ChunkTicketArea::Octahedron(area) => {
                if area.scaled_radius == 0
                    || area.scaled_radius > Consts::MAX_TICKET_OCTA_AREA_RADIUS
                {
                    return false;
                }
                area.pivot.scale_log2 < Consts::NUM_LOD_SCALES
            }
        }
    }
}

/// Movable handle of a registered ticket. Dropping it asynchronously
/// releases the claimed area.
#[derive(Debug)]
pub struct ChunkTicket {
    ticket_id: u64,
    sender: Option<MessageSender>,
}

impl ChunkTicket {
    pub const INVALID_TICKET_ID: u64 = u64::MAX;

    pub(crate) fn new(ticket_id: u64, sender: MessageSender) -> Self {
        Self {
            ticket_id,
            sender: Some(sender),
        }
    }

    pub fn ticket_id(&self) -> u64 {
        self.ticket_id
    }

    /// Replaces the ticket's area; takes effect on a later tick
    pub fn adjust_async(&self, new_area: ChunkTicketArea) {
        if let Some(sender) = &self.sender {
            sender.send(
                crate::land::LandService::SERVICE_UID,
                ChunkTicketAdjustMessage {
                    ticket_id: self.ticket_id,
                    new_area,
                },
            );
        }
    }
}

impl Drop for ChunkTicket {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            if self.ticket_id != Self::INVALID_TICKET_ID {
                sender.send(
                    crate::land::LandService::SERVICE_UID,
                    ChunkTicketRemoveMessage {
                        ticket_id: self.ticket_id,
                    },
                );
            }
        }
    }
}

/// Request a new chunk ticket from the land service. Sent as a request
/// message; the service stores the handle into `ticket` before
/// completing it. A `None` ticket on completion means the area was
/// rejected.
pub struct ChunkTicketRequestMessage {
    pub area: ChunkTicketArea,
    pub ticket: Option<ChunkTicket>,
}

impl Message for ChunkTicketRequestMessage {
    const MESSAGE_UID: Uid = Uid::parse("f17b5cbe-07ad4ccf-aca34680-87cd18f6");
}

/// Sent by a ticket handle when its owner adjusts it
pub(crate) struct ChunkTicketAdjustMessage {
    pub(crate) ticket_id: u64,
    pub(crate) new_area: ChunkTicketArea,
}

impl Message for ChunkTicketAdjustMessage {
    const MESSAGE_UID: Uid = Uid::parse("2398d8ff-c3af7864-544755df-adfd2173");
}

/// Sent automatically by a dropping ticket handle
pub(crate) struct ChunkTicketRemoveMessage {
    pub(crate) ticket_id: u64,
}

impl Message for ChunkTicketRemoveMessage {
    const MESSAGE_UID: Uid = Uid::parse("a2e6579d-c07cbb78-58031ca9-37bae862");
}
