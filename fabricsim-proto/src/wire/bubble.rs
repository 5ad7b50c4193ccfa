use bytes::{Buf, BufMut};

use super::{need, WireError, WireHeader};

/// One-byte Bubble backpressure frame carrying a discrete rate code.
/// 0 means no pressure, 8 means stop; intermediate codes scale the
/// upstream sender proportionally.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct BubbleHeader {
    pub rate: u8,
}

impl BubbleHeader {
    pub const WIRE_SIZE: usize = 1;
    pub const MAX_RATE: u8 = 8;
}

impl WireHeader for BubbleHeader {
    fn wire_size(&self) -> usize {
        Self::WIRE_SIZE
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.rate);
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        need(buf, "bubble", Self::WIRE_SIZE)?;
        Ok(BubbleHeader { rate: buf.get_u8() })
    }
}

#[cfg(test)]
mod tests {
    use super::super::round_trip;
    use super::*;

    #[test]
    fn bubble_round_trip() {
        assert_eq!(round_trip(&BubbleHeader { rate: 8 }), [8]);
    }
}
