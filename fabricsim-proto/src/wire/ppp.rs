use bytes::{Buf, BufMut};

use super::{need, WireError, WireHeader, ETHER_BUBBLE, ETHER_IPV4, ETHER_IPV6, ETHER_PFC};

/// Two-byte point-to-point framing: just the RFC 3818 protocol number
/// of the payload, so a capture of the link is parseable.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct PppHeader {
    pub protocol: u16,
}

impl PppHeader {
    pub fn for_ether(ether: u16) -> Result<Self, WireError> {
        Ok(PppHeader {
            protocol: ether_to_ppp(ether)?,
        })
    }
}

impl WireHeader for PppHeader {
    fn wire_size(&self) -> usize {
        2
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16(self.protocol);
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        need(buf, "ppp", 2)?;
        Ok(PppHeader {
            protocol: buf.get_u16(),
        })
    }
}

/// Map a PPP protocol number to the EtherType it stands for.
pub fn ppp_to_ether(proto: u16) -> Result<u16, WireError> {
    match proto {
        0x0021 => Ok(ETHER_IPV4),
        0x0057 => Ok(ETHER_IPV6),
        0x8808 => Ok(ETHER_PFC),
        0x4321 => Ok(ETHER_BUBBLE),
        other => Err(WireError::UnknownProtocol(other)),
    }
}

/// Map an EtherType to its PPP protocol number.
pub fn ether_to_ppp(proto: u16) -> Result<u16, WireError> {
    match proto {
        ETHER_IPV4 => Ok(0x0021),
        ETHER_IPV6 => Ok(0x0057),
        ETHER_PFC => Ok(0x8808),
        ETHER_BUBBLE => Ok(0x4321),
        other => Err(WireError::UnknownProtocol(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::super::round_trip;
    use super::*;

    #[test]
    fn ppp_wire_form() {
        let bytes = round_trip(&PppHeader { protocol: 0x0021 });
        assert_eq!(bytes, [0x00, 0x21]);
    }

    #[test]
    fn protocol_mapping() {
        assert_eq!(ether_to_ppp(ETHER_IPV4), Ok(0x0021));
        assert_eq!(ppp_to_ether(0x0021), Ok(ETHER_IPV4));
        assert_eq!(ether_to_ppp(ETHER_PFC), Ok(0x8808));
        assert_eq!(ether_to_ppp(ETHER_BUBBLE), Ok(0x4321));
        assert_eq!(
            ppp_to_ether(0x1234),
            Err(WireError::UnknownProtocol(0x1234))
        );
    }

    #[test]
    fn truncated() {
        let mut buf = &[0u8; 1][..];
        assert!(matches!(
            PppHeader::decode(&mut buf),
            Err(WireError::UnexpectedEnd("ppp", 1))
        ));
    }
}
