use tracing::{error, info, warn};

use crate::config::SimConfig;
use crate::device::{Device, DeviceKind, HostState, TxState};
use crate::event::{Event, Timeline};
use crate::qp::FlowInfo;
use crate::switch::Switch;
use crate::{DeviceId, Nanos, Rate, SwitchId};

/// One completed flow, as written to the FCT log.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct FctRecord {
    pub id: u32,
    pub src: u32,
    pub dst: u32,
    pub size: u32,
    pub start_time: Nanos,
    pub end_time: Nanos,
}

impl FctRecord {
    pub fn duration(&self) -> Nanos {
        self.end_time - self.start_time
    }
}

/// The simulation arena: every device and switch lives in a flat,
/// append-only vector and is referred to by index, so packet tags and
/// routing tables never hold references. All state mutation happens in
/// event dispatch on the single simulated thread.
pub struct Simulator {
    pub(crate) cfg: SimConfig,
    pub(crate) timeline: Timeline<Event>,
    pub(crate) devices: Vec<Device>,
    pub(crate) switches: Vec<Switch>,
    /// Server index -> that server's NIC.
    nics: std::collections::HashMap<u32, DeviceId>,
    completed: Vec<FctRecord>,
    fct_sink: Option<Box<dyn FnMut(&FctRecord)>>,
}

impl Simulator {
    pub fn new(cfg: SimConfig) -> Self {
        Simulator {
            cfg,
            timeline: Timeline::new(),
            devices: Vec::new(),
            switches: Vec::new(),
            nics: std::collections::HashMap::new(),
            completed: Vec::new(),
            fct_sink: None,
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.cfg
    }

    pub fn now(&self) -> Nanos {
        self.timeline.now()
    }

    /// Stream completed-flow records somewhere (an open FCT log file,
    /// usually) as they happen. Records are retained internally either
    /// way; see [`completed_flows`](Self::completed_flows).
    pub fn set_fct_sink(&mut self, sink: impl FnMut(&FctRecord) + 'static) {
        self.fct_sink = Some(Box::new(sink));
    }

    // --- topology ---------------------------------------------------------

    /// Create a server and its NIC. The NIC's rate and delay are set
    /// when it is linked to a switch.
    pub fn add_host(&mut self, server: u32) -> DeviceId {
        let id = DeviceId(self.devices.len() as u32);
        self.devices.push(Device::host(id, server));
        let prev = self.nics.insert(server, id);
        assert!(prev.is_none(), "server {server} already has a NIC");
        id
    }

    pub fn add_switch(&mut self, nid: u32, ecmp_seed: u32) -> SwitchId {
        let id = SwitchId(self.switches.len() as u32);
        self.switches.push(Switch::new(nid, ecmp_seed, &self.cfg));
        id
    }

    /// Attach a host NIC to a new port on `sw` over a link of the given
    /// rate and propagation delay. Returns the switch-side port.
    pub fn link_host(
        &mut self,
        nic: DeviceId,
        sw: SwitchId,
        rate: Rate,
        delay: Nanos,
    ) -> DeviceId {
        let port = DeviceId(self.devices.len() as u32);
        self.devices.push(Device::switch_port(port, sw));
        self.attach(nic, port, rate, delay);
        self.attach(port, nic, rate, delay);
        self.switches[sw.0 as usize].register_port(port, rate, delay);
        port
    }

    /// Create a link between two switches; returns the new port on each
    /// (`a`'s side first).
    pub fn link_switches(
        &mut self,
        a: SwitchId,
        b: SwitchId,
        rate: Rate,
        delay: Nanos,
    ) -> (DeviceId, DeviceId) {
        let pa = DeviceId(self.devices.len() as u32);
        self.devices.push(Device::switch_port(pa, a));
        let pb = DeviceId(self.devices.len() as u32);
        self.devices.push(Device::switch_port(pb, b));
        self.attach(pa, pb, rate, delay);
        self.attach(pb, pa, rate, delay);
        self.switches[a.0 as usize].register_port(pa, rate, delay);
        self.switches[b.0 as usize].register_port(pb, rate, delay);
        (pa, pb)
    }

    fn attach(&mut self, dev: DeviceId, peer: DeviceId, rate: Rate, delay: Nanos) {
        let d = &mut self.devices[dev.0 as usize];
        d.peer = Some(peer);
        d.rate = rate;
        d.delay = delay;
    }

    /// Install a next hop for `dst` on `sw`. `port` indexes the
    /// switch's ports in attach order; multiple entries for one
    /// destination are ECMP alternatives.
    pub fn add_route(&mut self, sw: SwitchId, dst: u32, port: u32) {
        self.switches[sw.0 as usize].add_route(dst, port);
    }

    pub fn nic_of(&self, server: u32) -> Option<DeviceId> {
        self.nics.get(&server).copied()
    }

    // --- flows ------------------------------------------------------------

    /// Admit a flow at its start time.
    pub fn install_flow(&mut self, flow: FlowInfo) {
        self.timeline
            .schedule_at(flow.start_time, Event::StartFlow(flow));
    }

    /// Admit a flow on its source NIC immediately.
    pub fn start_flow(&mut self, flow: FlowInfo) {
        let Some(&nic) = self.nics.get(&flow.src) else {
            error!(src = flow.src, "flow names a server with no NIC");
            return;
        };
        self.set_flow(nic, flow);
    }

    // --- event loop -------------------------------------------------------

    /// Run every event scheduled at or before `deadline`.
    pub fn run_until(&mut self, deadline: Nanos) {
        while let Some(at) = self.timeline.peek_time() {
            if at > deadline {
                break;
            }
            let (_, event) = self.timeline.pop().expect("peeked event");
            self.dispatch(event);
        }
    }

    /// Run until no events remain. Terminates because stale
    /// generation-checked timers never re-arm.
    pub fn run(&mut self) {
        while let Some((_, event)) = self.timeline.pop() {
            self.dispatch(event);
        }
    }

    fn dispatch(&mut self, event: Event) {
        match event {
            Event::TransmitComplete(dev) => self.transmit_complete(dev),
            Event::Deliver { to, pkt } => self.receive(to, pkt),
            Event::CheckSendQueue { dev, gen } => {
                if self.host_state(dev).map_or(false, |h| h.send_gen == gen) {
                    self.check_send_queue(dev);
                }
            }
            Event::CheckRetransmit { dev, gen } => {
                if self.host_state(dev).map_or(false, |h| h.retx_gen == gen) {
                    self.check_retransmit_queue(dev);
                }
            }
            Event::QpAlphaTick { dev, flow, gen } => {
                let Simulator {
                    devices, timeline, ..
                } = self;
                if let DeviceKind::Host(host) = &mut devices[dev.0 as usize].kind {
                    if let Some(qp) = host.flows.get_mut(&flow) {
                        if qp.alpha_tick_is_current(gen) {
                            qp.update_alpha(timeline);
                        }
                    }
                }
            }
            Event::QpRateTick { dev, flow, gen } => {
                let Simulator {
                    devices, timeline, ..
                } = self;
                if let DeviceKind::Host(host) = &mut devices[dev.0 as usize].kind {
                    if let Some(qp) = host.flows.get_mut(&flow) {
                        if qp.rate_tick_is_current(gen) {
                            qp.increase_rate(timeline);
                        }
                    }
                }
            }
            Event::StartFlow(flow) => self.start_flow(flow),
        }
    }

    pub(crate) fn host_state(&self, dev: DeviceId) -> Option<&HostState> {
        match &self.devices[dev.0 as usize].kind {
            DeviceKind::Host(h) => Some(h),
            DeviceKind::SwitchPort(_) => None,
        }
    }

    pub(crate) fn record_fct(&mut self, rec: FctRecord) {
        info!(
            flow = rec.id,
            duration = rec.duration(),
            "flow completed"
        );
        if let Some(sink) = &mut self.fct_sink {
            sink(&rec);
        }
        self.completed.push(rec);
    }

    // --- observability ----------------------------------------------------

    pub fn completed_flows(&self) -> &[FctRecord] {
        &self.completed
    }

    /// Admission drops summed over every switch.
    pub fn total_drops(&self) -> u64 {
        self.switches.iter().map(|s| s.drops()).sum()
    }

    /// ECN CE marks summed over every switch.
    pub fn total_ecn_marks(&self) -> u64 {
        self.switches.iter().map(|s| s.ecn_count()).sum()
    }

    /// Accounting invariant violations summed over every switch. Always
    /// zero in a correct run; tests fail on anything else.
    pub fn total_violations(&self) -> u64 {
        self.switches.iter().map(|s| s.violations()).sum()
    }

    /// PFC pause frames emitted, summed over every switch.
    pub fn total_pauses_sent(&self) -> u64 {
        self.switches.iter().map(|s| s.pauses_sent()).sum()
    }

    /// Verify the global quiescent-state invariants: every buffer pool
    /// drained, no class paused anywhere, every admitted flow terminal.
    /// Returns the list of violations (empty means quiesced).
    pub fn check_quiesced(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for sw in &self.switches {
            sw.check_quiesced(&mut problems);
        }
        for dev in &self.devices {
            if !dev.queue.is_empty() {
                problems.push(format!("device {:?} still has queued packets", dev.id));
            }
            if !matches!(dev.tx, TxState::Ready) {
                problems.push(format!("device {:?} still transmitting", dev.id));
            }
            if let DeviceKind::Host(host) = &dev.kind {
                for (id, qp) in &host.flows {
                    problems.push(format!(
                        "flow {id} not terminal: {}/{} acked",
                        qp.bytes_acked(),
                        qp.flow().size
                    ));
                }
            }
        }
        if !problems.is_empty() {
            warn!(count = problems.len(), "quiesce check failed");
        }
        problems
    }

    /// Byte conservation across every switch: admitted bytes sit in an
    /// ingress-side pool and an egress count exactly once.
    pub fn all_conserved(&self) -> bool {
        self.switches
            .iter()
            .all(|sw| sw.ingress_bytes() == sw.egress_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CcMode, PfcMode};
    use crate::device::DeviceKind;
    use crate::packet::Packet;
    use crate::qp::RdmaQueuePair;
    use crate::wire::{
        BthHeader, Ecn, Ipv4Header, PppHeader, UdpHeader, ETHER_IPV4, ROCE_UDP_PORT,
    };

    const GBPS100: Rate = Rate::from_gbps(100);
    const US: Nanos = 1_000;

    /// Two servers hanging off one switch, symmetric routes.
    fn pair_through_switch(cfg: SimConfig) -> Simulator {
        let mut sim = Simulator::new(cfg);
        let h0 = sim.add_host(0);
        let h1 = sim.add_host(1);
        let sw = sim.add_switch(2000, 1);
        sim.link_host(h0, sw, GBPS100, US);
        sim.link_host(h1, sw, GBPS100, US);
        sim.add_route(sw, 0, 0);
        sim.add_route(sw, 1, 1);
        sim
    }

    /// Three servers off one switch; 0 and 1 send toward 2.
    fn incast_through_switch(cfg: SimConfig) -> Simulator {
        let mut sim = Simulator::new(cfg);
        let sw = sim.add_switch(2000, 1);
        for server in 0..3 {
            let nic = sim.add_host(server);
            sim.link_host(nic, sw, GBPS100, US);
            sim.add_route(sw, server, server);
        }
        sim
    }

    fn flow(id: u32, src: u32, dst: u32, size: u32, start_time: Nanos) -> FlowInfo {
        FlowInfo {
            id,
            src,
            dst,
            size,
            start_time,
            end_time: 0,
        }
    }

    fn with_qp<R>(sim: &Simulator, server: u32, id: u32, f: impl FnOnce(&RdmaQueuePair) -> R) -> R {
        let nic = sim.nic_of(server).unwrap();
        let DeviceKind::Host(host) = &sim.devices[nic.0 as usize].kind else {
            panic!("not a host");
        };
        f(host.flows.get(&id).expect("flow exists"))
    }

    fn data_frame(id: u32, seq: u32, size: u32, src: u32, dst: u32) -> Packet {
        let mut pkt = Packet::data(size);
        pkt.push(&BthHeader::data(id, seq, size));
        pkt.push(&UdpHeader {
            src_port: 1,
            dst_port: ROCE_UDP_PORT,
            payload_len: pkt.size() as u16,
        });
        pkt.push(&Ipv4Header {
            ecn: Ecn::Ect0,
            payload_len: pkt.size() as u16,
            ttl: 64,
            protocol: Ipv4Header::PROTO_UDP,
            src,
            dst,
        });
        pkt.push(&PppHeader::for_ether(ETHER_IPV4).unwrap());
        pkt.priority = crate::DATA_PRIORITY;
        pkt
    }

    #[test]
    fn one_flow_completes_with_sane_fct() {
        let mut sim = pair_through_switch(SimConfig::default());
        // 100 segments of 1400B at 100Gbps through two 1us links
        sim.install_flow(flow(1, 0, 1, 140_000, 1_000));
        sim.run();

        assert_eq!(sim.completed_flows().len(), 1);
        let rec = sim.completed_flows()[0];
        assert_eq!(rec.size, 140_000);
        // serialization-dominated: ~100 * 115ns, plus two hops of
        // propagation and store-and-forward each way
        assert!(
            (15_000..18_000).contains(&rec.duration()),
            "unexpected FCT {}",
            rec.duration()
        );
        assert!(sim.check_quiesced().is_empty());
        assert!(sim.all_conserved());
        assert_eq!(sim.total_drops(), 0);
    }

    #[test]
    fn receive_cursor_reaches_flow_size() {
        let mut sim = pair_through_switch(SimConfig::default());
        sim.install_flow(flow(1, 0, 1, 99_400, 1_000));
        sim.run();
        let nic = sim.nic_of(1).unwrap();
        let DeviceKind::Host(host) = &sim.devices[nic.0 as usize].kind else {
            panic!()
        };
        assert_eq!(host.receivers[&1], 99_400);
    }

    #[test]
    fn incast_under_pfc_pauses_without_drops() {
        let mut cfg = SimConfig::default();
        cfg.pfc(PfcMode::Pfc);
        // shrink the shared pool so two 100KB flows overcommit it
        cfg.buffer_per_gbps(500).unwrap();
        let mut sim = incast_through_switch(cfg);
        sim.install_flow(flow(1, 0, 2, 100_000, 1_000));
        sim.install_flow(flow(2, 1, 2, 100_000, 1_000));
        sim.run();

        assert_eq!(sim.completed_flows().len(), 2);
        assert_eq!(sim.total_drops(), 0, "PFC must keep the fabric lossless");
        assert!(sim.total_pauses_sent() >= 1, "expected at least one PAUSE");
        assert!(sim.check_quiesced().is_empty());

        // symmetric flows should finish close together
        let d1 = sim.completed_flows()[0].duration() as f64;
        let d2 = sim.completed_flows()[1].duration() as f64;
        assert!((d1 / d2 - 1.0).abs() < 0.1, "FCTs diverged: {d1} vs {d2}");
    }

    #[test]
    fn overload_without_pfc_drops_then_recovers() {
        let mut cfg = SimConfig::default();
        cfg.buffer_per_gbps(500).unwrap();
        let mut sim = incast_through_switch(cfg);
        sim.install_flow(flow(1, 0, 2, 200_000, 1_000));
        sim.install_flow(flow(2, 1, 2, 200_000, 1_000));
        sim.run();

        assert!(sim.total_drops() > 0, "expected admission drops");
        // NACK-driven go-back-N still finishes both flows
        assert_eq!(sim.completed_flows().len(), 2);
        assert!(sim.check_quiesced().is_empty());
    }

    #[test]
    fn injected_gap_is_nacked_and_flow_recovers() {
        let mut sim = pair_through_switch(SimConfig::default());
        sim.install_flow(flow(1, 0, 1, 1_000_000, 1_000));
        // run deep into the transfer
        sim.run_until(10_000);
        let sent_before = with_qp(&sim, 0, 1, |qp| qp.bytes_sent());
        let acked_before = with_qp(&sim, 0, 1, |qp| qp.bytes_acked());
        assert!(sent_before > acked_before);

        // a segment far ahead of the cursor arrives at the receiver,
        // as if everything in between was lost
        let rx = sim.nic_of(1).unwrap();
        sim.receive(rx, data_frame(1, sent_before + 280_000, 1400, 0, 1));
        // the NACK needs two link flights to reach the sender
        sim.run_until(sim.now() + 3 * US);

        let sent_after = with_qp(&sim, 0, 1, |qp| qp.bytes_sent());
        assert!(
            sent_after < sent_before,
            "go-back-N rewind: {sent_after} !< {sent_before}"
        );

        sim.run();
        assert_eq!(sim.completed_flows().len(), 1);
        assert!(sim.check_quiesced().is_empty());
    }

    #[test]
    fn injected_cnp_halves_dcqcn_rate() {
        let mut cfg = SimConfig::default();
        cfg.cc(CcMode::Dcqcn);
        let mut sim = pair_through_switch(cfg);
        sim.install_flow(flow(1, 0, 1, 10_000_000, 1_000));
        sim.run_until(100_000);
        assert_eq!(with_qp(&sim, 0, 1, |qp| qp.current_rate()), GBPS100);

        // forge a CNP-bearing ACK and hand it straight to the sender NIC
        let acked = with_qp(&sim, 0, 1, |qp| qp.bytes_acked());
        let mut bth = BthHeader::data(1, acked, 0);
        bth.set_ack();
        bth.set_cnp();
        let mut pkt = Packet::empty();
        pkt.push(&bth);
        pkt.push(&UdpHeader {
            src_port: 9,
            dst_port: ROCE_UDP_PORT,
            payload_len: pkt.size() as u16,
        });
        pkt.push(&Ipv4Header {
            ecn: Ecn::Ect0,
            payload_len: pkt.size() as u16,
            ttl: 64,
            protocol: Ipv4Header::PROTO_UDP,
            src: 1,
            dst: 0,
        });
        pkt.push(&PppHeader::for_ether(ETHER_IPV4).unwrap());
        let tx = sim.nic_of(0).unwrap();
        sim.receive(tx, pkt);

        // alpha starts at 1.0, so the multiplicative decrease halves
        assert_eq!(with_qp(&sim, 0, 1, |qp| qp.current_rate()), Rate::from_gbps(50));

        sim.run();
        assert_eq!(sim.completed_flows().len(), 1);
        assert!(sim.check_quiesced().is_empty());
    }

    #[test]
    fn hpcc_records_one_int_sample_per_switch_hop() {
        let mut cfg = SimConfig::default();
        cfg.cc(CcMode::Hpcc);
        let mut sim = pair_through_switch(cfg);
        sim.install_flow(flow(1, 0, 1, 1_000_000, 1_000));
        sim.run_until(20_000);

        // one switch between the hosts: the echoed stack carries one
        // record, stamped with the egress link rate
        let (hops, rate) = with_qp(&sim, 0, 1, |qp| {
            let ints = qp.last_telemetry();
            (ints.len(), ints.first().map(|r| r.rate()))
        });
        assert_eq!(hops, 1);
        assert_eq!(rate, Some(GBPS100));

        sim.run();
        assert_eq!(sim.completed_flows().len(), 1);
        assert!(sim.check_quiesced().is_empty());
    }

    #[test]
    fn bubble_signal_raises_under_pressure_and_clears() {
        let mut cfg = SimConfig::default();
        cfg.pfc(PfcMode::Bubble);
        cfg.buffer_per_gbps(500).unwrap();
        let mut sim = incast_through_switch(cfg);
        sim.install_flow(flow(1, 0, 2, 100_000, 1_000));
        sim.install_flow(flow(2, 1, 2, 100_000, 1_000));

        sim.run_until(9_000);
        let mid_rate = |sim: &Simulator, server: u32| {
            let nic = sim.nic_of(server).unwrap();
            match &sim.devices[nic.0 as usize].kind {
                DeviceKind::Host(h) => h.peer_bubble_rate,
                _ => unreachable!(),
            }
        };
        assert!(
            mid_rate(&sim, 0) > 0 || mid_rate(&sim, 1) > 0,
            "no bubble backpressure seen under sustained incast"
        );

        sim.run();
        assert_eq!(sim.completed_flows().len(), 2);
        // pressure gone: the last update returned the code to zero
        assert_eq!(mid_rate(&sim, 0), 0);
        assert_eq!(mid_rate(&sim, 1), 0);
        assert!(sim.check_quiesced().is_empty());
    }

    #[test]
    fn duplicate_flow_id_is_discarded() {
        let mut sim = pair_through_switch(SimConfig::default());
        sim.install_flow(flow(1, 0, 1, 14_000, 1_000));
        sim.install_flow(flow(1, 0, 1, 28_000, 1_000));
        sim.run();
        // only the first admission survives
        assert_eq!(sim.completed_flows().len(), 1);
        assert_eq!(sim.completed_flows()[0].size, 14_000);
    }

    #[test]
    fn conservation_holds_at_event_boundaries() {
        let mut cfg = SimConfig::default();
        cfg.buffer_per_gbps(500).unwrap();
        let mut sim = incast_through_switch(cfg);
        sim.install_flow(flow(1, 0, 2, 50_000, 1_000));
        sim.install_flow(flow(2, 1, 2, 50_000, 1_000));
        // step through the busiest window, checking between events
        for deadline in (1_000..20_000).step_by(500) {
            sim.run_until(deadline);
            assert!(sim.all_conserved(), "conservation broke by t={deadline}");
            assert_eq!(sim.total_violations(), 0);
        }
        sim.run();
        assert!(sim.check_quiesced().is_empty());
    }
}
