use bytes::{Buf, BufMut};
use tracing::warn;

use super::{need, WireError, WireHeader};
use crate::{Nanos, Rate};

const TIME_WRAP: u64 = (1 << 24) * 16; // 24-bit field of 16ns units
const BYTES_WRAP: u64 = (1 << 20) * 512; // 20-bit field of 512B units

/// One hop's worth of in-band telemetry, packed into eight bytes:
///
/// ```text
/// bits  0..4    rate      (units of 100 Gb/s)
/// bits  4..28   time      (units of 16 ns, wraps)
/// bits 28..48   bytes     (units of 512 B, wraps)
/// bits 48..64   queueLen  (units of 64 B)
/// ```
///
/// The wire form is the low 32-bit word big-endian, then the high word.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct IntHeader {
    bits: u64,
}

impl IntHeader {
    pub const WIRE_SIZE: usize = 8;

    pub fn new(rate: Rate, now: Nanos, bytes: u64, queue_len: u64) -> Self {
        let mut hdr = IntHeader::default();
        hdr.set_rate(rate);
        hdr.set_time(now);
        hdr.set_bytes(bytes);
        hdr.set_queue_len(queue_len);
        hdr
    }

    pub fn set_rate(&mut self, rate: Rate) {
        let units = (rate.bit_rate() / 100_000_000_000) & 0xF;
        self.bits = (self.bits & !0xF) | units;
    }

    pub fn rate(&self) -> Rate {
        Rate::from_bps((self.bits & 0xF) * 100_000_000_000)
    }

    pub fn set_time(&mut self, now: Nanos) {
        let units = (now as u64 / 16) & 0xFF_FFFF;
        self.bits = (self.bits & !(0xFF_FFFF << 4)) | (units << 4);
    }

    pub fn time(&self) -> u64 {
        ((self.bits >> 4) & 0xFF_FFFF) * 16
    }

    pub fn set_bytes(&mut self, bytes: u64) {
        let units = (bytes / 512) & 0xF_FFFF;
        self.bits = (self.bits & !(0xF_FFFF << 28)) | (units << 28);
    }

    pub fn bytes(&self) -> u64 {
        ((self.bits >> 28) & 0xF_FFFF) * 512
    }

    pub fn set_queue_len(&mut self, queue_len: u64) {
        let units = (queue_len / 64) & 0xFFFF;
        self.bits = (self.bits & !(0xFFFF << 48)) | (units << 48);
    }

    pub fn queue_len(&self) -> u64 {
        ((self.bits >> 48) & 0xFFFF) * 64
    }

    /// Bytes transmitted since `old`, correcting for one wrap of the
    /// 20-bit counter. A gap larger than the modulus cannot be
    /// represented and is reported as a protocol error.
    pub fn bytes_delta(&self, old: &IntHeader) -> u64 {
        let (new, old) = (self.bytes(), old.bytes());
        if new < old {
            if new + BYTES_WRAP < old {
                warn!(new, old, "INT byte counter wrapped more than once");
            }
            new + BYTES_WRAP - old
        } else {
            new - old
        }
    }

    /// Nanoseconds elapsed since `old`, correcting for one wrap of the
    /// 24-bit timestamp.
    pub fn time_delta(&self, old: &IntHeader) -> u64 {
        let (new, old) = (self.time(), old.time());
        if new < old {
            if new + TIME_WRAP < old {
                warn!(new, old, "INT timestamp wrapped more than once");
            }
            new + TIME_WRAP - old
        } else {
            new - old
        }
    }
}

impl WireHeader for IntHeader {
    fn wire_size(&self) -> usize {
        Self::WIRE_SIZE
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32((self.bits & 0xFFFF_FFFF) as u32);
        buf.put_u32((self.bits >> 32) as u32);
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        need(buf, "int", Self::WIRE_SIZE)?;
        let low = buf.get_u32() as u64;
        let high = buf.get_u32() as u64;
        Ok(IntHeader {
            bits: low | (high << 32),
        })
    }
}

/// The HPCC telemetry stack: a signed hop count followed by that many
/// [`IntHeader`] records. Senders emit it empty; each switch appends
/// one record. A negative hop count marks the stack closed (the
/// receiver echoes it on the ACK and nothing may append further); the
/// magnitude still gives the record count.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct HpccHeader {
    hops: i8,
    records: Vec<IntHeader>,
}

impl HpccHeader {
    /// Most records a stack can describe: |i8::MIN| does not fit in an
    /// i8, so the count saturates one below it.
    pub const MAX_HOPS: usize = 127;

    pub fn hops(&self) -> i8 {
        self.hops
    }

    pub fn records(&self) -> &[IntHeader] {
        &self.records
    }

    pub fn can_push(&self) -> bool {
        self.hops >= 0 && (self.hops as usize) < Self::MAX_HOPS
    }

    /// Append one hop's telemetry. Ignored (with a log) on a closed or
    /// full stack.
    pub fn push(&mut self, record: IntHeader) {
        if !self.can_push() {
            warn!(hops = self.hops, "cannot append INT record");
            return;
        }
        self.records.push(record);
        self.hops += 1;
    }

    /// Close the stack: negate the hop count so downstream devices stop
    /// appending while the record count stays recoverable.
    pub fn stop_push(&mut self) {
        self.hops = -self.hops;
    }
}

impl WireHeader for HpccHeader {
    fn wire_size(&self) -> usize {
        1 + self.records.len() * IntHeader::WIRE_SIZE
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        need(buf, "hpcc", 1)?;
        let hops = buf.get_i8();
        // i8::MIN would overflow plain abs(); saturate to the cap.
        let count = (hops.unsigned_abs() as usize).min(Self::MAX_HOPS);
        let mut records = Vec::with_capacity(count);
        for _ in 0..count {
            records.push(IntHeader::decode(buf)?);
        }
        Ok(HpccHeader { hops, records })
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_i8(self.hops);
        for record in &self.records {
            record.encode(buf);
        }
    }
}
