use bytes::{Buf, BufMut};

use super::{need, WireError, WireHeader};

/// Explicit congestion notification codepoints (RFC 3168).
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Ecn {
    NotEct = 0b00,
    Ect1 = 0b01,
    Ect0 = 0b10,
    Ce = 0b11,
}

impl Ecn {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => Ecn::NotEct,
            0b01 => Ecn::Ect1,
            0b10 => Ecn::Ect0,
            _ => Ecn::Ce,
        }
    }
}

/// The subset of IPv4 this fabric uses: addressing, TTL, protocol and
/// the ECN codepoint. Server index n is addressed as the u32 `n`; no
/// options, no fragmentation, checksum transmitted as zero.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Ipv4Header {
    pub ecn: Ecn,
    pub payload_len: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub src: u32,
    pub dst: u32,
}

impl Ipv4Header {
    pub const WIRE_SIZE: usize = 20;
    pub const PROTO_UDP: u8 = 17;
}

impl WireHeader for Ipv4Header {
    fn wire_size(&self) -> usize {
        Self::WIRE_SIZE
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(0x45); // version 4, 5-word header
        buf.put_u8(self.ecn as u8); // DSCP 0
        buf.put_u16(self.payload_len + Self::WIRE_SIZE as u16);
        buf.put_u16(0); // identification
        buf.put_u16(0); // flags + fragment offset
        buf.put_u8(self.ttl);
        buf.put_u8(self.protocol);
        buf.put_u16(0); // checksum not modelled
        buf.put_u32(self.src);
        buf.put_u32(self.dst);
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        need(buf, "ipv4", Self::WIRE_SIZE)?;
        let _ver_ihl = buf.get_u8();
        let tos = buf.get_u8();
        let total_len = buf.get_u16();
        let _id = buf.get_u16();
        let _frag = buf.get_u16();
        let ttl = buf.get_u8();
        let protocol = buf.get_u8();
        let _checksum = buf.get_u16();
        let src = buf.get_u32();
        let dst = buf.get_u32();
        Ok(Ipv4Header {
            ecn: Ecn::from_bits(tos),
            payload_len: total_len.saturating_sub(Self::WIRE_SIZE as u16),
            ttl,
            protocol,
            src,
            dst,
        })
    }
}
