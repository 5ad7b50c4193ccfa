//! Bit-exact codecs for the headers exchanged between devices.
//!
//! Every header implements [`WireHeader`]: a self-describing size, a
//! big-endian encode into any [`BufMut`], and a checked decode from any
//! [`Buf`]. Decoding never panics; malformed input surfaces as a
//! [`WireError`] which receivers log and drop per the protocol rules.

use bytes::{Buf, BufMut};
use thiserror::Error;

mod bth;
mod bubble;
mod hpcc;
mod ipv4;
mod pfc;
mod ppp;
mod udp;

pub use bth::{BthHeader, ROCE_UDP_PORT};
pub use bubble::BubbleHeader;
pub use hpcc::{HpccHeader, IntHeader};
pub use ipv4::{Ecn, Ipv4Header};
pub use pfc::PfcHeader;
pub use ppp::{ether_to_ppp, ppp_to_ether, PppHeader};
pub use udp::UdpHeader;

/// EtherType carried (in PPP-mapped form) on every frame.
pub const ETHER_IPV4: u16 = 0x0800;
pub const ETHER_IPV6: u16 = 0x86DD;
/// Ethernet flow control (PFC pause/resume).
pub const ETHER_PFC: u16 = 0x8808;
/// Bubble rate update (local to this fabric).
pub const ETHER_BUBBLE: u16 = 0x4321;

/// Errors raised while decoding a header from the wire.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Fewer bytes remain than the header requires
    #[error("truncated header: {0} needs {1} more bytes")]
    UnexpectedEnd(&'static str, usize),
    /// A protocol number that no codec understands
    #[error("unknown protocol number {0:#06x}")]
    UnknownProtocol(u16),
}

/// A fixed- or self-describing-size header with a big-endian wire form.
pub trait WireHeader: Sized {
    /// Serialized size of this value in bytes.
    fn wire_size(&self) -> usize;

    /// Append the wire form to `buf`.
    fn encode<B: BufMut>(&self, buf: &mut B);

    /// Parse one header from the front of `buf`, consuming exactly
    /// [`wire_size`](WireHeader::wire_size) bytes on success.
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError>;
}

pub(crate) fn need<B: Buf>(buf: &B, name: &'static str, n: usize) -> Result<(), WireError> {
    if buf.remaining() < n {
        Err(WireError::UnexpectedEnd(name, n - buf.remaining()))
    } else {
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn round_trip<H: WireHeader + PartialEq + std::fmt::Debug>(h: &H) -> Vec<u8> {
    let mut buf = Vec::new();
    h.encode(&mut buf);
    assert_eq!(buf.len(), h.wire_size());
    let mut slice = &buf[..];
    let back = H::decode(&mut slice).expect("decode");
    assert_eq!(&back, h);
    assert!(slice.is_empty(), "decode must consume the full header");
    buf
}
