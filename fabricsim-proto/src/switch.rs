use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, error, warn};

use crate::config::{CcMode, PfcMode, SimConfig};
use crate::packet::{Packet, PacketTag};
use crate::sim::Simulator;
use crate::wire::{
    BubbleHeader, Ecn, HpccHeader, IntHeader, Ipv4Header, PfcHeader, PppHeader, UdpHeader,
    WireError, ETHER_IPV4, ETHER_PFC,
};
use crate::{DeviceId, Nanos, Rate, SwitchId, BUBBLE_PRIORITY, DATA_PRIORITY};

const BUBBLE_MIN_INTERVAL: Nanos = 10_000; // 10 us between rate recomputations
const BUBBLE_TARGET_FRAC: f64 = 0.1;

/// The 5-tuple (minus protocol) a switch hashes for ECMP next-hop
/// selection.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) struct FlowV4Id {
    pub src_ip: u32,
    pub dst_ip: u32,
    pub src_port: u16,
    pub dst_port: u16,
}

const PRIME32: [u32; 5] = [2654435761, 246822519, 3266489917, 668265263, 374761393];

const HASH_SEED: [u32; 16] = [
    181, 5197, 1151, 137, 5569, 7699, 2887, 8753, 9323, 8963, 6053, 8893, 9377, 6577, 733, 3527,
];

impl FlowV4Id {
    /// Rotate-and-multiply hash over the 5-tuple, xxHash-style. The
    /// per-switch seed (0..15) decorrelates hash decisions between
    /// tiers so one flow does not collapse onto the same index at
    /// every stage.
    pub(crate) fn hash(&self, seed: u32) -> u32 {
        let mut h = HASH_SEED[seed as usize & 0xF];
        h = h
            .wrapping_add((self.src_port as u32).wrapping_mul(PRIME32[2]))
            .rotate_left(17)
            .wrapping_mul(PRIME32[3]);
        h = h
            .wrapping_add((self.dst_port as u32).wrapping_mul(PRIME32[4]))
            .rotate_left(11)
            .wrapping_mul(PRIME32[0]);
        h = h
            .wrapping_add(self.src_ip.wrapping_mul(PRIME32[3]))
            .rotate_left(17)
            .wrapping_mul(PRIME32[1]);
        h = h
            .wrapping_add(self.dst_ip.wrapping_mul(PRIME32[0]))
            .rotate_left(11)
            .wrapping_mul(PRIME32[4]);
        h
    }
}

/// Buffer state a switch keeps for each of its ports. Ingress fields
/// account packets admitted through the port; egress fields account
/// packets destined to leave through it.
struct PortBuf {
    hdrm_buffer: i64,
    kmin: i64,
    kmax: i64,
    used_hdrm: i64,
    used_ingress: i64,
    used_egress: i64,
    pause: bool,
    bubble_rate: u8,
    bubble_time: Nanos,
    prev_buffer: i64,
    /// Cumulative bytes transmitted out of this port; sampled into INT
    /// telemetry records.
    tx_bytes: u64,
}

/// A shared-buffer switch: routing table, per-port buffer accounting
/// against switch-wide pools, and the PFC/ECN/Bubble policy state.
///
/// The pools obey, after every pipeline event, the conservation rule
/// that every admitted byte sits in exactly one ingress-side slot
/// (reserve, shared or headroom) and exactly one egress count until it
/// is transmitted.
pub struct Switch {
    nid: u32,
    seed: u32,
    cc: CcMode,
    pfc: PfcMode,

    ports: Vec<DeviceId>,
    route: HashMap<u32, Vec<u32>>,
    bufs: HashMap<DeviceId, PortBuf>,

    reserved_size: i64,
    resume_offset: i64,
    buffer_per_gbps: i64,
    headroom_rtts: f64,
    kmin_frac: f64,
    kmax_frac: f64,
    ecn_prob_max: f64,

    buffer_total: i64,
    shared_total: i64,
    used_shared: i64,
    reserved_total: i64,
    hdrm_total: i64,

    drops: u64,
    ecn_count: u64,
    violations: u64,
    pauses_sent: u64,

    rng: StdRng,
}

impl Switch {
    pub(crate) fn new(nid: u32, seed: u32, cfg: &SimConfig) -> Self {
        Switch {
            nid,
            seed,
            cc: cfg.cc,
            pfc: cfg.pfc,
            ports: Vec::new(),
            route: HashMap::new(),
            bufs: HashMap::new(),
            reserved_size: cfg.reserved_size,
            resume_offset: cfg.resume_offset,
            buffer_per_gbps: cfg.buffer_per_gbps,
            headroom_rtts: cfg.headroom_rtts,
            kmin_frac: cfg.kmin_frac,
            kmax_frac: cfg.kmax_frac,
            ecn_prob_max: cfg.ecn_prob_max,
            buffer_total: 0,
            shared_total: 0,
            used_shared: 0,
            reserved_total: 0,
            hdrm_total: 0,
            drops: 0,
            ecn_count: 0,
            violations: 0,
            pauses_sent: 0,
            rng: StdRng::seed_from_u64(nid as u64),
        }
    }

    /// Account a newly attached port into the switch-wide pools:
    /// 5 KB of buffer per Gb/s of port speed, of which a fixed reserve
    /// and 3 bandwidth-delay products of PFC headroom are carved out.
    pub(crate) fn register_port(&mut self, dev: DeviceId, rate: Rate, delay: Nanos) {
        let budget =
            (rate.bit_rate() as f64 / 1e9 * self.buffer_per_gbps as f64) as i64;
        let hdrm = (rate.bit_rate() as f64 * (delay as f64 / 1e9) / 8.0 * self.headroom_rtts)
            as i64;

        self.buffer_total += budget;
        self.hdrm_total += hdrm;
        self.reserved_total += self.reserved_size;
        self.shared_total += budget - self.reserved_size - hdrm;
        if budget - self.reserved_size - hdrm < 0 {
            warn!(switch = self.nid, "negative shared buffer contribution");
        }

        self.ports.push(dev);
        self.bufs.insert(
            dev,
            PortBuf {
                hdrm_buffer: hdrm,
                kmin: (self.kmin_frac * budget as f64) as i64,
                kmax: (self.kmax_frac * budget as f64) as i64,
                used_hdrm: 0,
                used_ingress: 0,
                used_egress: 0,
                pause: false,
                bubble_rate: 0,
                bubble_time: 0,
                prev_buffer: 0,
                tx_bytes: 0,
            },
        );
    }

    pub(crate) fn add_route(&mut self, dst: u32, port: u32) {
        assert!(
            (port as usize) < self.ports.len(),
            "route through unknown port {port} on switch {}",
            self.nid
        );
        self.route.entry(dst).or_default().push(port);
    }

    pub fn id(&self) -> u32 {
        self.nid
    }

    pub fn drops(&self) -> u64 {
        self.drops
    }

    pub fn ecn_count(&self) -> u64 {
        self.ecn_count
    }

    pub fn violations(&self) -> u64 {
        self.violations
    }

    pub fn pauses_sent(&self) -> u64 {
        self.pauses_sent
    }

    /// Configured shared-pool capacity (the buffer total minus every
    /// port's reserve and headroom carve-outs).
    pub fn shared_capacity(&self) -> i64 {
        self.shared_total
    }

    fn buf(&self, dev: DeviceId) -> &PortBuf {
        self.bufs.get(&dev).expect("port not registered")
    }

    fn buf_mut(&mut self, dev: DeviceId) -> &mut PortBuf {
        self.bufs.get_mut(&dev).expect("port not registered")
    }

    /// Remaining shared allowance across the whole switch. Signed: can
    /// transiently go negative under heavy concurrent ingress.
    fn shared_threshold(&self) -> i64 {
        self.buffer_total - self.reserved_total - self.hdrm_total - self.used_shared
    }

    /// Shared-pool bytes attributed to one ingress port (its usage
    /// above the reserve).
    fn shared_used(&self, dev: DeviceId) -> i64 {
        (self.buf(dev).used_ingress - self.reserved_size).max(0)
    }

    /// Admission test: a packet fits if it can go to headroom or to the
    /// shared pool.
    fn would_drop(&self, dev: DeviceId, size: i64) -> bool {
        let pb = self.buf(dev);
        size + pb.used_hdrm > pb.hdrm_buffer
            && size + self.shared_used(dev) > self.shared_threshold()
    }

    /// Charge an admitted packet to the pools: reserve first, then the
    /// shared pool, spilling to headroom when shared is exhausted.
    fn admit(&mut self, ingress: DeviceId, egress: DeviceId, size: i64) {
        self.buf_mut(egress).used_egress += size;

        let new_ingress = self.buf(ingress).used_ingress + size;
        if new_ingress <= self.reserved_size {
            self.buf_mut(ingress).used_ingress = new_ingress;
        } else if new_ingress - self.reserved_size > self.shared_threshold() {
            self.buf_mut(ingress).used_hdrm += size;
        } else {
            let to_shared = size.min(new_ingress - self.reserved_size);
            self.buf_mut(ingress).used_ingress = new_ingress;
            self.used_shared += to_shared;
        }
    }

    /// Return a transmitted packet's bytes to the pools, draining
    /// headroom before the shared/reserved charge. Any counter going
    /// negative is an accounting bug, logged and tallied.
    fn release(&mut self, egress: DeviceId, tag: PacketTag) {
        let size = tag.size as i64;
        let nid = self.nid;

        let pb = self.buf_mut(egress);
        pb.used_egress -= size;
        if pb.used_egress < 0 {
            error!(switch = nid, egress = ?egress, value = pb.used_egress, "usedEgress negative");
            self.violations += 1;
        }

        let ingress = tag.ingress;
        let from_hdrm = size.min(self.buf(ingress).used_hdrm);
        let remain = size - from_hdrm;
        let from_shared = remain.min(self.shared_used(ingress));

        let pb = self.buf_mut(ingress);
        pb.used_hdrm -= from_hdrm;
        if pb.used_hdrm < 0 {
            error!(switch = nid, ingress = ?ingress, value = pb.used_hdrm, "usedHdrm negative");
            self.violations += 1;
        }

        self.used_shared -= from_shared;
        if self.used_shared < 0 {
            error!(switch = nid, value = self.used_shared, "usedShared negative");
            self.violations += 1;
        }

        let pb = self.buf_mut(ingress);
        pb.used_ingress -= remain;
        if pb.used_ingress < 0 {
            error!(switch = nid, ingress = ?ingress, value = pb.used_ingress, "usedIngress negative");
            self.violations += 1;
        }
    }

    /// Whether the data class arriving on `dev` must be paused, setting
    /// the pause latch when so.
    fn should_pause(&mut self, dev: DeviceId) -> bool {
        if self.pfc != PfcMode::Pfc || self.buf(dev).pause {
            return false;
        }
        if self.buf(dev).used_hdrm > 0 || self.shared_used(dev) >= self.shared_threshold() {
            self.buf_mut(dev).pause = true;
            self.pauses_sent += 1;
            return true;
        }
        false
    }

    /// Whether a paused ingress has drained enough (headroom empty,
    /// shared usage a hysteresis gap under the threshold) to resume.
    fn should_resume(&mut self, dev: DeviceId) -> bool {
        if !self.buf(dev).pause {
            return false;
        }
        let shared_used = self.shared_used(dev);
        if self.buf(dev).used_hdrm == 0
            && (shared_used == 0 || shared_used + self.resume_offset <= self.shared_threshold())
        {
            self.buf_mut(dev).pause = false;
            return true;
        }
        false
    }

    /// RED-style marking over the egress count: never below kmin,
    /// always above kmax, linear ramp up to the max probability in
    /// between.
    fn should_ecn(&mut self, dev: DeviceId) -> bool {
        let pb = self.bufs.get(&dev).expect("port not registered");
        if pb.used_egress < pb.kmin {
            return false;
        }
        if pb.used_egress > pb.kmax {
            return true;
        }
        let prob = self.ecn_prob_max * (pb.used_egress - pb.kmin) as f64
            / (pb.kmax - pb.kmin) as f64;
        self.rng.gen::<f64>() < prob
    }

    /// Sum of ingress-side pools; equals the egress sum whenever no
    /// pipeline event is mid-flight.
    pub fn ingress_bytes(&self) -> i64 {
        self.bufs
            .values()
            .map(|pb| pb.used_ingress + pb.used_hdrm)
            .sum()
    }

    pub fn egress_bytes(&self) -> i64 {
        self.bufs.values().map(|pb| pb.used_egress).sum()
    }

    pub(crate) fn check_quiesced(&self, problems: &mut Vec<String>) {
        if self.used_shared != 0 {
            problems.push(format!(
                "switch {}: usedShared = {} at quiesce",
                self.nid, self.used_shared
            ));
        }
        for (dev, pb) in &self.bufs {
            if pb.used_ingress != 0 || pb.used_hdrm != 0 || pb.used_egress != 0 {
                problems.push(format!(
                    "switch {} port {:?}: pools not drained ({}/{}/{})",
                    self.nid, dev, pb.used_ingress, pb.used_hdrm, pb.used_egress
                ));
            }
            if pb.pause {
                problems.push(format!("switch {} port {:?}: still paused", self.nid, dev));
            }
        }
    }
}

impl Simulator {
    /// Forward one frame arriving at a switch: admission, routing with
    /// ECMP, buffer accounting, backpressure checks and ECN marking,
    /// ending with a send on the chosen egress port.
    pub(crate) fn ingress_pipeline(
        &mut self,
        sw: SwitchId,
        dev: DeviceId,
        ether: u16,
        mut pkt: Packet,
    ) {
        if ether != ETHER_IPV4 {
            debug!(ether, "switch dropping non-IPv4 frame");
            return;
        }

        let now = self.timeline.now();
        let size = pkt.size() as i64;

        let (egress, pause) = {
            let switch = &mut self.switches[sw.0 as usize];

            if switch.would_drop(dev, size) {
                switch.drops += 1;
                if switch.pfc != PfcMode::Off {
                    warn!(
                        switch = switch.nid,
                        drops = switch.drops,
                        "admission drop under lossless mode"
                    );
                } else if switch.drops % 10_000 == 0 {
                    debug!(switch = switch.nid, drops = switch.drops, "drop count");
                }
                return;
            }

            let parsed = (|| -> Result<_, WireError> {
                let ipv4: Ipv4Header = pkt.pull()?;
                let udp: UdpHeader = pkt.pull()?;
                Ok((ipv4, udp))
            })();
            let (mut ipv4, udp) = match parsed {
                Ok(parts) => parts,
                Err(e) => {
                    warn!(switch = switch.nid, %e, "dropping malformed packet");
                    return;
                }
            };

            if ipv4.ttl == 0 {
                warn!(switch = switch.nid, "TTL exhausted, dropping");
                return;
            }
            ipv4.ttl -= 1;

            let Some(next_hops) = switch.route.get(&ipv4.dst) else {
                warn!(switch = switch.nid, dst = ipv4.dst, "no route, dropping");
                return;
            };
            let choice = if next_hops.len() > 1 {
                let id = FlowV4Id {
                    src_ip: ipv4.src,
                    dst_ip: ipv4.dst,
                    src_port: udp.src_port,
                    dst_port: udp.dst_port,
                };
                id.hash(switch.seed) as usize % next_hops.len()
            } else {
                0
            };
            let port = next_hops[choice] as usize;
            let Some(&egress) = switch.ports.get(port) else {
                error!(switch = switch.nid, port, "route names an unknown port");
                return;
            };

            pkt.push(&udp);
            pkt.push(&ipv4);

            switch.admit(dev, egress, size);
            pkt.tag = Some(PacketTag {
                size: size as u32,
                ingress: dev,
            });

            let pause = switch.should_pause(dev);

            if switch.should_ecn(egress) {
                switch.ecn_count += 1;
                let mut ipv4: Ipv4Header = pkt.pull().expect("just pushed");
                ipv4.ecn = Ecn::Ce;
                pkt.push(&ipv4);
            }

            (egress, pause)
        };

        if pause {
            self.send_pfc(dev, true);
        }
        if self.switches[sw.0 as usize].pfc == PfcMode::Bubble {
            self.check_bubble(sw, dev);
        }

        if !self.send(egress, pkt, ETHER_IPV4) {
            warn!(egress = ?egress, "switch failed to forward packet");
        }
    }

    /// Runs as a frame is about to serialize out of a switch port:
    /// return its bytes to the pools, append telemetry under HPCC, and
    /// resume the ingress if it has drained past the hysteresis gap.
    pub(crate) fn egress_pipeline(
        &mut self,
        sw: SwitchId,
        dev: DeviceId,
        mut pkt: Packet,
    ) -> Option<Packet> {
        let proto = match pkt.peek::<PppHeader>().map(|p| crate::wire::ppp_to_ether(p.protocol))
        {
            Ok(Ok(proto)) => proto,
            Ok(Err(e)) | Err(e) => {
                warn!(dev = ?dev, %e, "unparseable frame at egress, dropping");
                return None;
            }
        };
        if proto != ETHER_IPV4 {
            return Some(pkt);
        }

        let ppp: PppHeader = pkt.pull().expect("peeked above");
        let Some(tag) = pkt.tag.take() else {
            error!(dev = ?dev, "packet reached egress without an accounting tag");
            pkt.push(&ppp);
            return Some(pkt);
        };

        let (cc, pfc) = {
            let switch = &mut self.switches[sw.0 as usize];
            switch.release(dev, tag);
            switch.buf_mut(dev).tx_bytes += tag.size as u64;
            (switch.cc, switch.pfc)
        };

        if cc == CcMode::Hpcc {
            self.append_int(sw, dev, &mut pkt);
        }
        pkt.push(&ppp);

        let ingress = tag.ingress;
        let resume = self.switches[sw.0 as usize].should_resume(ingress);
        if resume {
            self.send_pfc(ingress, false);
        }
        if pfc == PfcMode::Bubble {
            self.check_bubble(sw, ingress);
        }

        Some(pkt)
    }

    /// Append this hop's INT record: egress link rate, cumulative bytes
    /// transmitted out of the port, and the data-class queue length.
    fn append_int(&mut self, sw: SwitchId, dev: DeviceId, pkt: &mut Packet) {
        let (rate, queue_len) = {
            let d = &self.devices[dev.0 as usize];
            (d.rate, d.queue.bytes(DATA_PRIORITY as usize) as u64)
        };
        let tx_bytes = self.switches[sw.0 as usize].buf(dev).tx_bytes;
        let now = self.timeline.now();

        let parsed = (|| -> Result<_, WireError> {
            let ipv4: Ipv4Header = pkt.pull()?;
            let udp: UdpHeader = pkt.pull()?;
            let hpcc: HpccHeader = pkt.pull()?;
            Ok((ipv4, udp, hpcc))
        })();
        let (mut ipv4, mut udp, mut hpcc) = match parsed {
            Ok(parts) => parts,
            Err(e) => {
                warn!(dev = ?dev, %e, "no INT stack where one was expected");
                return;
            }
        };

        if hpcc.can_push() {
            hpcc.push(IntHeader::new(rate, now, tx_bytes, queue_len));
        }

        pkt.push(&hpcc);
        udp.payload_len = pkt.size() as u16;
        pkt.push(&udp);
        ipv4.payload_len = pkt.size() as u16;
        pkt.push(&ipv4);
    }

    /// Emit a pause or resume frame for the data class out of `dev`.
    fn send_pfc(&mut self, dev: DeviceId, pause: bool) {
        let hdr = if pause {
            PfcHeader::pause(DATA_PRIORITY as u32)
        } else {
            PfcHeader::resume(DATA_PRIORITY as u32)
        };
        let mut pkt = Packet::empty();
        pkt.push(&hdr);
        if !self.send(dev, pkt, ETHER_PFC) {
            warn!(dev = ?dev, pause, "PFC frame dropped");
        }
    }

    /// Recompute the Bubble rate code for one ingress port and emit an
    /// update frame if it changed. Saturated ports report 8, idle ones
    /// 0; in between the code follows the buffer growth rate plus the
    /// offset from a 10% occupancy target, recomputed at most once per
    /// 10 µs.
    fn check_bubble(&mut self, sw: SwitchId, dev: DeviceId) {
        let bps = self.devices[dev.0 as usize].rate.bit_rate();
        let now = self.timeline.now();

        let emit = {
            let switch = &mut self.switches[sw.0 as usize];
            let thresh = switch.shared_threshold();
            let shared_used = switch.shared_used(dev);
            let buffer_per_gbps = switch.buffer_per_gbps;
            let pb = switch.buf_mut(dev);

            let new_rate = if pb.used_hdrm > 0 || shared_used >= thresh {
                BubbleHeader::MAX_RATE
            } else if shared_used == 0 {
                0
            } else if now - pb.bubble_time < BUBBLE_MIN_INTERVAL {
                return;
            } else {
                let total = bps as f64 / 1e9 * buffer_per_gbps as f64 - pb.hdrm_buffer as f64;
                let target = total * BUBBLE_TARGET_FRAC;
                let growth = (pb.used_ingress - pb.prev_buffer) as f64 * 8.0 / 1e-5;
                let offset = (pb.used_ingress as f64 - target) * 8.0 / 1e-4;
                let ratio = (growth + offset) * 8.0 / bps as f64;
                ratio.clamp(0.0, 7.0) as u8
            };

            pb.prev_buffer = pb.used_ingress;
            pb.bubble_time = now;

            if new_rate != pb.bubble_rate {
                pb.bubble_rate = new_rate;
                Some(new_rate)
            } else {
                None
            }
        };

        if let Some(rate) = emit {
            let mut pkt = Packet::empty();
            pkt.push(&BubbleHeader { rate });
            pkt.priority = BUBBLE_PRIORITY;
            if !self.send(dev, pkt, crate::wire::ETHER_BUBBLE) {
                warn!(dev = ?dev, rate, "bubble rate update dropped");
            }
        }
    }
}
