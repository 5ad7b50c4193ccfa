use bytes::{Buf, BufMut};

use super::{need, WireError, WireHeader};

/// Eight-byte UDP header. Length covers header plus payload; the
/// checksum is transmitted as zero.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload_len: u16,
}

impl UdpHeader {
    pub const WIRE_SIZE: usize = 8;
}

impl WireHeader for UdpHeader {
    fn wire_size(&self) -> usize {
        Self::WIRE_SIZE
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16(self.src_port);
        buf.put_u16(self.dst_port);
        buf.put_u16(self.payload_len + Self::WIRE_SIZE as u16);
        buf.put_u16(0); // checksum not modelled
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        need(buf, "udp", Self::WIRE_SIZE)?;
        let src_port = buf.get_u16();
        let dst_port = buf.get_u16();
        let length = buf.get_u16();
        let _checksum = buf.get_u16();
        Ok(UdpHeader {
            src_port,
            dst_port,
            payload_len: length.saturating_sub(Self::WIRE_SIZE as u16),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::round_trip;
    use super::*;

    #[test]
    fn udp_round_trip() {
        let bytes = round_trip(&UdpHeader {
            src_port: 1000,
            dst_port: 4791,
            payload_len: 13,
        });
        assert_eq!(bytes.len(), 8);
        assert_eq!(u16::from_be_bytes([bytes[2], bytes[3]]), 4791);
        assert_eq!(u16::from_be_bytes([bytes[4], bytes[5]]), 21);
    }
}
