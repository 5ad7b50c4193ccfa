use crate::wire::{WireError, WireHeader};
use crate::DeviceId;

/// Buffer-accounting metadata attached to a packet at switch ingress
/// and consumed at switch egress. Carrying the admitted size and the
/// ingress device id guarantees every byte admitted at ingress is
/// returned to the correct pools on egress, even if the packet grows
/// (INT records) in between.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct PacketTag {
    pub size: u32,
    pub ingress: DeviceId,
}

/// A simulated frame: real serialized header bytes in front of a
/// virtual payload. Payload content is never materialized, only its
/// length; headers are bit-exact so the codecs are exercised on every
/// hop.
///
/// Headers nest outermost-first, so pushing prepends and pulling
/// parses from the front, mirroring how a device would prepend framing
/// on transmit and strip it on receive.
#[derive(Debug, Default)]
pub struct Packet {
    header: Vec<u8>,
    payload: u32,
    /// Priority class tag; selects the port sub-queue. Rides the packet
    /// end to end like a socket priority mark, not a wire field.
    pub priority: u8,
    /// Switch-local accounting tag; present only between ingress
    /// admission and egress transmission.
    pub tag: Option<PacketTag>,
}

impl Packet {
    /// A packet carrying `payload` virtual bytes and no headers yet.
    pub fn data(payload: u32) -> Self {
        Packet {
            payload,
            ..Packet::default()
        }
    }

    /// An empty control packet.
    pub fn empty() -> Self {
        Packet::default()
    }

    /// Total on-wire size: serialized headers plus virtual payload.
    pub fn size(&self) -> u32 {
        self.header.len() as u32 + self.payload
    }

    pub fn payload_len(&self) -> u32 {
        self.payload
    }

    /// Prepend a header, making it the new outermost one.
    pub fn push<H: WireHeader>(&mut self, hdr: &H) {
        let mut buf = Vec::with_capacity(hdr.wire_size() + self.header.len());
        hdr.encode(&mut buf);
        buf.extend_from_slice(&self.header);
        self.header = buf;
    }

    /// Strip and parse the outermost header.
    pub fn pull<H: WireHeader>(&mut self) -> Result<H, WireError> {
        let mut slice = &self.header[..];
        let hdr = H::decode(&mut slice)?;
        let consumed = self.header.len() - slice.len();
        self.header.drain(..consumed);
        Ok(hdr)
    }

    /// Parse the outermost header without stripping it.
    pub fn peek<H: WireHeader>(&self) -> Result<H, WireError> {
        let mut slice = &self.header[..];
        H::decode(&mut slice)
    }
}
