use bytes::{Buf, BufMut};

use super::{need, WireError, WireHeader};

/// Well-known UDP destination port for RoCEv2.
pub const ROCE_UDP_PORT: u16 = 4791;

const FLAG_ACK: u8 = 1 << 0;
const FLAG_NACK: u8 = 1 << 1;
const FLAG_CNP: u8 = 1 << 2;

/// RDMA base transport header: flow id, byte-granular sequence cursor,
/// segment size and the ACK/NACK/CNP flag bits.
///
/// On data packets `seq` is the cursor *after* this segment
/// (`bytesSent + size`); on ACKs it is the receiver's cumulative
/// cursor, on NACKs the byte the sender should resume from.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct BthHeader {
    pub id: u32,
    pub seq: u32,
    pub size: u32,
    flags: u8,
}

impl BthHeader {
    pub const WIRE_SIZE: usize = 13;

    pub fn data(id: u32, seq: u32, size: u32) -> Self {
        BthHeader {
            id,
            seq,
            size,
            flags: 0,
        }
    }

    pub fn is_ack(&self) -> bool {
        self.flags & FLAG_ACK != 0
    }

    pub fn is_nack(&self) -> bool {
        self.flags & FLAG_NACK != 0
    }

    pub fn is_cnp(&self) -> bool {
        self.flags & FLAG_CNP != 0
    }

    pub fn set_ack(&mut self) {
        self.flags |= FLAG_ACK;
    }

    pub fn set_nack(&mut self) {
        self.flags |= FLAG_NACK;
    }

    pub fn set_cnp(&mut self) {
        self.flags |= FLAG_CNP;
    }
}

impl WireHeader for BthHeader {
    fn wire_size(&self) -> usize {
        Self::WIRE_SIZE
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32(self.id);
        buf.put_u32(self.seq);
        buf.put_u32(self.size);
        buf.put_u8(self.flags);
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        need(buf, "bth", Self::WIRE_SIZE)?;
        Ok(BthHeader {
            id: buf.get_u32(),
            seq: buf.get_u32(),
            size: buf.get_u32(),
            flags: buf.get_u8(),
        })
    }
}
