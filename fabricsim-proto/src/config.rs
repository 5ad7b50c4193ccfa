use std::fmt;

use thiserror::Error;

use crate::{Nanos, Rate};

/// Congestion-control variant run by every queue pair in the simulation.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum CcMode {
    /// No end-host rate control; flows pace at line rate.
    None,
    /// MLX/DCQCN: CNP-driven multiplicative decrease with periodic
    /// alpha updates and additive increase.
    Dcqcn,
    /// HPCC: in-band telemetry is collected per hop and echoed on ACKs.
    Hpcc,
}

impl TryFrom<u32> for CcMode {
    type Error = ConfigError;

    fn try_from(value: u32) -> Result<Self, ConfigError> {
        match value {
            0 => Ok(CcMode::None),
            1 => Ok(CcMode::Dcqcn),
            2 => Ok(CcMode::Hpcc),
            _ => Err(ConfigError::UnknownMode),
        }
    }
}

/// Backpressure variant run by every switch in the simulation.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum PfcMode {
    /// No link-level flow control; overcommitted buffers drop.
    Off,
    /// Priority Flow Control pause/resume on the data class.
    Pfc,
    /// Experimental Bubble rate-code backpressure.
    Bubble,
}

impl TryFrom<u32> for PfcMode {
    type Error = ConfigError;

    fn try_from(value: u32) -> Result<Self, ConfigError> {
        match value {
            0 => Ok(PfcMode::Off),
            1 => Ok(PfcMode::Pfc),
            2 => Ok(PfcMode::Bubble),
            _ => Err(ConfigError::UnknownMode),
        }
    }
}

/// Parameters governing the simulation core.
///
/// Defaults reproduce the reference fabric: 1400-byte segments, a 2 ms
/// retransmission timeout, a 200 µs pipe for the in-flight window, and
/// the shared-buffer geometry of a commodity datacenter switch (10 KB
/// per-port reserve, 5 KB of buffer per Gb/s of port speed, 3 RTTs of
/// PFC headroom).
#[derive(Clone)]
pub struct SimConfig {
    pub(crate) cc: CcMode,
    pub(crate) pfc: PfcMode,

    pub(crate) send_size: u32,
    pub(crate) timeout: Nanos,
    pub(crate) window_floor_bits: u64,
    pub(crate) window_delay: Nanos,
    pub(crate) min_rate: Rate,
    pub(crate) interframe_gap: Nanos,

    pub(crate) reserved_size: i64,
    pub(crate) resume_offset: i64,
    pub(crate) buffer_per_gbps: i64,
    pub(crate) headroom_rtts: f64,
    pub(crate) kmin_frac: f64,
    pub(crate) kmax_frac: f64,
    pub(crate) ecn_prob_max: f64,
}

impl SimConfig {
    /// Congestion-control variant for all flows.
    pub fn cc(&mut self, value: CcMode) -> &mut Self {
        self.cc = value;
        self
    }

    /// Backpressure variant for all switches.
    pub fn pfc(&mut self, value: PfcMode) -> &mut Self {
        self.pfc = value;
        self
    }

    /// Bytes of payload per generated data packet.
    ///
    /// Bounded below by a minimum sensible segment and above by the
    /// 16 MiB class FIFO so a single packet can always be queued.
    pub fn send_size(&mut self, value: u32) -> Result<&mut Self, ConfigError> {
        if !(256..=9000).contains(&value) {
            return Err(ConfigError::OutOfBounds);
        }
        self.send_size = value;
        Ok(self)
    }

    /// Retransmission timeout: how long a queue pair waits for ACK
    /// progress before rewinding to the acknowledged cursor.
    pub fn timeout(&mut self, value: Nanos) -> Result<&mut Self, ConfigError> {
        if value <= 0 {
            return Err(ConfigError::OutOfBounds);
        }
        self.timeout = value;
        Ok(self)
    }

    /// Floor rate below which DCQCN never decreases a flow.
    pub fn min_rate(&mut self, value: Rate) -> &mut Self {
        self.min_rate = value;
        self
    }

    /// Idle time inserted between frame transmissions.
    pub fn interframe_gap(&mut self, value: Nanos) -> Result<&mut Self, ConfigError> {
        if value < 0 {
            return Err(ConfigError::OutOfBounds);
        }
        self.interframe_gap = value;
        Ok(self)
    }

    /// Per-ingress guaranteed buffer, charged before the shared pool.
    pub fn reserved_size(&mut self, value: i64) -> Result<&mut Self, ConfigError> {
        if value < 0 {
            return Err(ConfigError::OutOfBounds);
        }
        self.reserved_size = value;
        Ok(self)
    }

    /// Hysteresis gap below the shared threshold required before a
    /// paused ingress is resumed.
    pub fn resume_offset(&mut self, value: i64) -> Result<&mut Self, ConfigError> {
        if value < 0 {
            return Err(ConfigError::OutOfBounds);
        }
        self.resume_offset = value;
        Ok(self)
    }

    /// Bytes of switch buffer per Gb/s of port speed. Scales every
    /// derived pool: the shared allowance and the ECN kmin/kmax marks.
    /// Small fabrics under test shrink this to reach buffer pressure
    /// with short flows.
    pub fn buffer_per_gbps(&mut self, value: i64) -> Result<&mut Self, ConfigError> {
        if value <= 0 {
            return Err(ConfigError::OutOfBounds);
        }
        self.buffer_per_gbps = value;
        Ok(self)
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            cc: CcMode::None,
            pfc: PfcMode::Off,

            send_size: 1400,
            timeout: 2_000_000,           // 2 ms
            window_floor_bits: 800_000,   // never window below 100KB in flight
            window_delay: 200_000,        // 200 us pipe
            min_rate: Rate::from_bps(100_000_000),
            interframe_gap: 0,

            reserved_size: 10_000,
            resume_offset: 10_000,
            buffer_per_gbps: 5_000,
            headroom_rtts: 3.0,
            kmin_frac: 0.1,
            kmax_frac: 0.4,
            ecn_prob_max: 0.2,
        }
    }
}

impl fmt::Debug for SimConfig {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("SimConfig")
            .field("cc", &self.cc)
            .field("pfc", &self.pfc)
            .field("send_size", &self.send_size)
            .field("timeout", &self.timeout)
            .field("window_floor_bits", &self.window_floor_bits)
            .field("window_delay", &self.window_delay)
            .field("min_rate", &self.min_rate)
            .field("interframe_gap", &self.interframe_gap)
            .field("reserved_size", &self.reserved_size)
            .field("resume_offset", &self.resume_offset)
            .field("buffer_per_gbps", &self.buffer_per_gbps)
            .field("headroom_rtts", &self.headroom_rtts)
            .field("kmin_frac", &self.kmin_frac)
            .field("kmax_frac", &self.kmax_frac)
            .field("ecn_prob_max", &self.ecn_prob_max)
            .finish()
    }
}

/// Errors in the configuration of a simulation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// Value exceeds supported bounds
    #[error("value exceeds supported bounds")]
    OutOfBounds,
    /// Numeric mode selector does not name a known variant
    #[error("unknown mode selector")]
    UnknownMode,
}
