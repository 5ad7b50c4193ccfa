//! Discrete-event core for a lossless RDMA datacenter fabric.
//!
//! This crate contains the protocol state machines only: shared-buffer
//! switches with PFC pause/resume and ECN marking, end-host RDMA queue
//! pairs with DCQCN rate control, per-NIC pacing/retransmission
//! scheduling, and the bit-exact wire codecs they exchange. Everything is
//! single-threaded and driven by an explicit simulated clock; no I/O
//! happens here. Topology construction, trace parsing and log writing
//! live in the driver crate.

mod config;
mod device;
mod event;
mod packet;
mod qp;
mod queue;
mod sim;
mod switch;
pub mod wire;

pub use config::{CcMode, ConfigError, PfcMode, SimConfig};
pub use event::{Event, Timeline};
pub use packet::{Packet, PacketTag};
pub use qp::{FlowInfo, RdmaQueuePair};
pub use queue::PortQueue;
pub use sim::{FctRecord, Simulator};
pub use switch::Switch;

/// Simulated time in nanoseconds. Signed so that scheduling arithmetic
/// (deadline minus now) can go negative before clamping.
pub type Nanos = i64;

/// Number of priority classes per port.
pub const NUM_QUEUE: usize = 4;

/// Priority class for RDMA data packets.
pub const DATA_PRIORITY: u8 = 2;
/// Priority class for ACK/NACK packets.
pub const ACK_PRIORITY: u8 = 2;
/// Priority class for Bubble rate-update frames.
pub const BUBBLE_PRIORITY: u8 = 1;

/// Index of a net device (host NIC or switch port) in the simulation
/// arena. Devices are allocated flat and never removed, so an id is valid
/// for the lifetime of the simulation; packet tags and routing tables
/// store these instead of references.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct DeviceId(pub u32);

/// Index of a switch in the simulation arena.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct SwitchId(pub u32);

/// A link rate in bits per second.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Rate(u64);

impl Rate {
    pub const fn from_bps(bps: u64) -> Self {
        Rate(bps)
    }

    pub const fn from_gbps(gbps: u64) -> Self {
        Rate(gbps * 1_000_000_000)
    }

    pub const fn bit_rate(self) -> u64 {
        self.0
    }

    /// Serialization time of `bytes` octets at this rate.
    pub fn tx_time(self, bytes: u32) -> Nanos {
        (bytes as f64 * 8.0 * 1e9 / self.0 as f64) as Nanos
    }

    /// Multiply by a dimensionless factor, e.g. a DCQCN alpha term.
    pub fn scale(self, factor: f64) -> Self {
        Rate((self.0 as f64 * factor) as u64)
    }

    /// Midpoint of two rates, used by the DCQCN additive-increase step.
    pub fn average(self, other: Rate) -> Self {
        Rate((self.0 + other.0) / 2)
    }

    pub fn saturating_add(self, other: Rate) -> Self {
        Rate(self.0.saturating_add(other.0))
    }
}

impl std::fmt::Display for Rate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0 >= 1_000_000_000 {
            write!(f, "{:.1}Gbps", self.0 as f64 / 1e9)
        } else {
            write!(f, "{:.1}Mbps", self.0 as f64 / 1e6)
        }
    }
}
