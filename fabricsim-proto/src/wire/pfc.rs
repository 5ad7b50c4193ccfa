use bytes::{Buf, BufMut};

use super::{need, WireError, WireHeader};

/// Priority flow control frame. `time == 0` resumes the named class;
/// any other value pauses it. The pause quanta and queue size are
/// carried for fidelity but the receiver only tests `time > 0`.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct PfcHeader {
    pub time: u32,
    pub queue_size: u32,
    pub queue_index: u32,
}

impl PfcHeader {
    pub const WIRE_SIZE: usize = 12;

    pub fn pause(queue_index: u32) -> Self {
        PfcHeader {
            time: 1,
            queue_size: 0,
            queue_index,
        }
    }

    pub fn resume(queue_index: u32) -> Self {
        PfcHeader {
            time: 0,
            queue_size: 0,
            queue_index,
        }
    }

    pub fn is_pause(&self) -> bool {
        self.time > 0
    }
}

impl WireHeader for PfcHeader {
    fn wire_size(&self) -> usize {
        Self::WIRE_SIZE
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32(self.time);
        buf.put_u32(self.queue_size);
        buf.put_u32(self.queue_index);
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        need(buf, "pfc", Self::WIRE_SIZE)?;
        Ok(PfcHeader {
            time: buf.get_u32(),
            queue_size: buf.get_u32(),
            queue_index: buf.get_u32(),
        })
    }
}
