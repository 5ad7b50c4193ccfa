use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, error, warn};

use crate::config::CcMode;
use crate::event::Event;
use crate::packet::Packet;
use crate::qp::{FlowInfo, RdmaQueuePair};
use crate::queue::PortQueue;
use crate::sim::{FctRecord, Simulator};
use crate::wire::{
    ppp_to_ether, BthHeader, BubbleHeader, Ecn, HpccHeader, Ipv4Header, PfcHeader, PppHeader,
    UdpHeader, ETHER_BUBBLE, ETHER_IPV4, ETHER_PFC, ROCE_UDP_PORT,
};
use crate::{DeviceId, Nanos, Rate, SwitchId, ACK_PRIORITY, DATA_PRIORITY};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum TxState {
    Ready,
    Busy,
}

/// Sender- and receiver-side state of a server NIC.
///
/// The two heaps drive all host-side scheduling: `send_queue` holds
/// `(next send time, flow)` pacing deadlines, `retransmit_queue` holds
/// `(timeout, flow)` deadlines for draining flows. Entries are never
/// updated in place; stale ones are left as tombstones and validated
/// against the flow's current state when popped.
pub(crate) struct HostState {
    pub(crate) server: u32,
    pub(crate) flows: HashMap<u32, RdmaQueuePair>,
    /// Flows that have generated all their data and now wait on the
    /// retransmission heap for the final ACK.
    pub(crate) send_completed: HashSet<u32>,
    pub(crate) send_queue: BinaryHeap<Reverse<(Nanos, u32)>>,
    pub(crate) retransmit_queue: BinaryHeap<Reverse<(Nanos, u32)>>,
    /// Per-flow receive cursor: highest byte contiguously received.
    pub(crate) receivers: HashMap<u32, u32>,
    /// Generation counters for the pending wake-up events; bumping one
    /// cancels whatever wake was scheduled.
    pub(crate) send_gen: u64,
    pub(crate) retx_gen: u64,
    /// Latest Bubble rate code heard from the attached switch.
    pub(crate) peer_bubble_rate: u8,
    rng: StdRng,
}

impl HostState {
    fn new(server: u32) -> Self {
        HostState {
            server,
            flows: HashMap::new(),
            send_completed: HashSet::new(),
            send_queue: BinaryHeap::new(),
            retransmit_queue: BinaryHeap::new(),
            receivers: HashMap::new(),
            send_gen: 0,
            retx_gen: 0,
            peer_bubble_rate: 0,
            rng: StdRng::seed_from_u64(0x4e1c_0000 | server as u64),
        }
    }
}

pub(crate) enum DeviceKind {
    Host(HostState),
    SwitchPort(SwitchId),
}

/// One end of a point-to-point link: a host NIC or a switch port. Owns
/// its egress queue and transmit state machine; the ingress side of a
/// frame is dispatched to host RDMA logic or the switch pipeline by
/// kind.
pub(crate) struct Device {
    pub(crate) id: DeviceId,
    pub(crate) peer: Option<DeviceId>,
    pub(crate) rate: Rate,
    pub(crate) delay: Nanos,
    pub(crate) queue: PortQueue,
    pub(crate) tx: TxState,
    pub(crate) kind: DeviceKind,
}

impl Device {
    pub(crate) fn host(id: DeviceId, server: u32) -> Self {
        Device {
            id,
            peer: None,
            rate: Rate::from_bps(0),
            delay: 0,
            queue: PortQueue::new(),
            tx: TxState::Ready,
            kind: DeviceKind::Host(HostState::new(server)),
        }
    }

    pub(crate) fn switch_port(id: DeviceId, sw: SwitchId) -> Self {
        Device {
            id,
            peer: None,
            rate: Rate::from_bps(0),
            delay: 0,
            queue: PortQueue::new(),
            tx: TxState::Ready,
            kind: DeviceKind::SwitchPort(sw),
        }
    }
}

/// Build the ACK or NACK answering one received data packet. `bth`
/// arrives with `seq` already set to the value the sender should learn
/// (the receive cursor).
fn generate_ack(
    cc: CcMode,
    rng: &mut StdRng,
    ipv4: &Ipv4Header,
    hpcc: Option<HpccHeader>,
    mut bth: BthHeader,
    is_ack: bool,
) -> Packet {
    if is_ack {
        bth.set_ack();
    } else {
        bth.set_nack();
    }
    if ipv4.ecn == Ecn::Ce || !is_ack {
        bth.set_cnp();
    }
    bth.size = 0;

    let mut pkt = Packet::empty();
    pkt.push(&bth);
    if cc == CcMode::Hpcc {
        // Echo the recorded stack, closed so no switch appends to it.
        let mut hpcc = hpcc.unwrap_or_default();
        hpcc.stop_push();
        pkt.push(&hpcc);
    }
    pkt.push(&UdpHeader {
        src_port: rng.gen_range(0..65535),
        dst_port: ROCE_UDP_PORT,
        payload_len: pkt.size() as u16,
    });
    pkt.push(&Ipv4Header {
        ecn: Ecn::Ect0,
        payload_len: pkt.size() as u16,
        ttl: 64,
        protocol: Ipv4Header::PROTO_UDP,
        src: ipv4.dst,
        dst: ipv4.src,
    });
    pkt.priority = ACK_PRIORITY;
    pkt
}

impl Simulator {
    /// Queue a frame for transmission, framing it with PPP. Starts the
    /// transmitter immediately if the line is idle.
    pub(crate) fn send(&mut self, dev: DeviceId, mut pkt: Packet, ether: u16) -> bool {
        let ppp = match PppHeader::for_ether(ether) {
            Ok(ppp) => ppp,
            Err(e) => {
                error!(ether, %e, "refusing to frame packet");
                return false;
            }
        };
        pkt.push(&ppp);

        let d = &mut self.devices[dev.0 as usize];
        if !d.queue.enqueue(pkt) {
            debug!(dev = ?dev, "egress queue rejected frame");
            return false;
        }
        if d.tx == TxState::Ready {
            if let Some(next) = d.queue.dequeue() {
                self.transmit_start(dev, next);
            } else {
                self.check_send_queue(dev);
            }
        }
        true
    }

    /// Begin serializing `pkt` onto the link. On a switch port the
    /// egress pipeline runs first and may consume the packet, in which
    /// case the port turns around immediately.
    pub(crate) fn transmit_start(&mut self, dev: DeviceId, pkt: Packet) {
        let pkt = match self.devices[dev.0 as usize].kind {
            DeviceKind::SwitchPort(sw) => self.egress_pipeline(sw, dev, pkt),
            DeviceKind::Host(_) => Some(pkt),
        };

        let d = &mut self.devices[dev.0 as usize];
        assert!(d.tx == TxState::Ready, "must be READY to transmit");
        d.tx = TxState::Busy;
        let (rate, delay, peer) = (d.rate, d.delay, d.peer);

        let Some(pkt) = pkt else {
            self.transmit_complete(dev);
            return;
        };

        let tx_time = rate.tx_time(pkt.size());
        let peer = peer.expect("transmit on an unlinked device");
        self.timeline.schedule(
            tx_time + self.cfg.interframe_gap,
            Event::TransmitComplete(dev),
        );
        self.timeline.schedule(tx_time + delay, Event::Deliver { to: peer, pkt });
    }

    /// The frame has fully left the device: go READY and pull the next
    /// one, or hand control to the host scheduler if the queue is dry.
    pub(crate) fn transmit_complete(&mut self, dev: DeviceId) {
        let d = &mut self.devices[dev.0 as usize];
        assert!(d.tx == TxState::Busy, "must be BUSY if transmitting");
        d.tx = TxState::Ready;

        if let Some(pkt) = d.queue.dequeue() {
            self.transmit_start(dev, pkt);
        } else {
            self.check_send_queue(dev);
        }
    }

    /// A frame arrived from the link.
    pub(crate) fn receive(&mut self, dev: DeviceId, mut pkt: Packet) {
        let ether = match pkt.pull::<PppHeader>().map(|p| ppp_to_ether(p.protocol)) {
            Ok(Ok(ether)) => ether,
            Ok(Err(e)) | Err(e) => {
                warn!(dev = ?dev, %e, "dropping unparseable frame");
                return;
            }
        };

        if ether == ETHER_PFC {
            self.receive_pfc(dev, pkt);
            return;
        }

        match self.devices[dev.0 as usize].kind {
            DeviceKind::SwitchPort(sw) => self.ingress_pipeline(sw, dev, ether, pkt),
            DeviceKind::Host(_) => self.host_receive(dev, ether, pkt),
        }
    }

    fn receive_pfc(&mut self, dev: DeviceId, mut pkt: Packet) {
        let pfc = match pkt.pull::<PfcHeader>() {
            Ok(pfc) => pfc,
            Err(e) => {
                warn!(dev = ?dev, %e, "dropping malformed PFC frame");
                return;
            }
        };
        let d = &mut self.devices[dev.0 as usize];
        d.queue.set_pause(pfc.queue_index as usize, pfc.is_pause());

        // A resume may unblock traffic that was parked while paused.
        if !pfc.is_pause() && d.tx == TxState::Ready {
            if let Some(next) = d.queue.dequeue() {
                self.transmit_start(dev, next);
            } else {
                self.check_send_queue(dev);
            }
        }
    }

    fn host_receive(&mut self, dev: DeviceId, ether: u16, mut pkt: Packet) {
        if ether == ETHER_BUBBLE {
            match pkt.pull::<BubbleHeader>() {
                Ok(bubble) => {
                    let DeviceKind::Host(host) = &mut self.devices[dev.0 as usize].kind else {
                        return;
                    };
                    debug!(server = host.server, rate = bubble.rate, "bubble rate update");
                    host.peer_bubble_rate = bubble.rate;
                }
                Err(e) => warn!(%e, "dropping malformed bubble frame"),
            }
            return;
        }
        if ether != ETHER_IPV4 {
            warn!(ether, "host dropping frame of unknown type");
            return;
        }

        let parsed = (|| -> Result<_, crate::wire::WireError> {
            let ipv4: Ipv4Header = pkt.pull()?;
            let _udp: UdpHeader = pkt.pull()?;
            let hpcc = if self.cfg.cc == CcMode::Hpcc {
                Some(pkt.pull::<HpccHeader>()?)
            } else {
                None
            };
            let bth: BthHeader = pkt.pull()?;
            Ok((ipv4, hpcc, bth))
        })();
        let (ipv4, hpcc, bth) = match parsed {
            Ok(parts) => parts,
            Err(e) => {
                warn!(dev = ?dev, %e, "dropping malformed RDMA packet");
                return;
            }
        };

        if bth.is_ack() || bth.is_nack() {
            self.host_receive_ack(dev, bth, hpcc);
        } else {
            self.host_receive_data(dev, ipv4, hpcc, bth);
        }
    }

    fn host_receive_ack(&mut self, dev: DeviceId, bth: BthHeader, hpcc: Option<HpccHeader>) {
        let (completed, need_wake) = {
            let Simulator {
                devices, timeline, ..
            } = self;
            let DeviceKind::Host(host) = &mut devices[dev.0 as usize].kind else {
                return;
            };
            let id = bth.id;
            let Some(qp) = host.flows.get_mut(&id) else {
                warn!(flow = id, "ACK for unknown flow, discarding");
                return;
            };
            let now = timeline.now();
            if qp.process_ack(now, &bth, hpcc.as_ref(), timeline) {
                let flow = *qp.flow();
                host.flows.remove(&id);
                host.send_completed.remove(&id);
                (
                    Some(FctRecord {
                        id: flow.id,
                        src: flow.src,
                        dst: flow.dst,
                        size: flow.size,
                        start_time: flow.start_time,
                        end_time: flow.end_time,
                    }),
                    false,
                )
            } else if host.send_completed.contains(&id) {
                // A NACK pulled a draining flow back into the send
                // path; hand it to the pacing heap again.
                let qp = &host.flows[&id];
                if !qp.is_send_completed() {
                    host.send_queue.push(Reverse((qp.next_send_time(), id)));
                    host.send_completed.remove(&id);
                    (None, true)
                } else {
                    (None, false)
                }
            } else {
                (None, false)
            }
        };

        if let Some(rec) = completed {
            self.record_fct(rec);
        }
        if need_wake {
            // The NIC may be fully idle in drain state; restart pacing.
            self.check_send_queue(dev);
        }
    }

    fn host_receive_data(
        &mut self,
        dev: DeviceId,
        ipv4: Ipv4Header,
        hpcc: Option<HpccHeader>,
        bth: BthHeader,
    ) {
        let cc = self.cfg.cc;
        let ack = {
            let DeviceKind::Host(host) = &mut self.devices[dev.0 as usize].kind else {
                return;
            };
            let cursor = host.receivers.entry(bth.id).or_insert(0);
            if bth.seq <= *cursor + bth.size {
                // In order (or a duplicate): advance monotonically and
                // acknowledge the cursor.
                *cursor = (*cursor).max(bth.seq);
                let answer = BthHeader::data(bth.id, *cursor, 0);
                generate_ack(cc, &mut host.rng, &ipv4, hpcc, answer, true)
            } else {
                // A gap: ask the sender to resume from the cursor.
                debug!(
                    flow = bth.id,
                    got = bth.seq,
                    expected = *cursor + bth.size,
                    "sequence gap, NACKing"
                );
                let answer = BthHeader::data(bth.id, *cursor, 0);
                generate_ack(cc, &mut host.rng, &ipv4, hpcc, answer, false)
            }
        };
        self.send(dev, ack, ETHER_IPV4);
    }

    /// Drive paced generation for every flow whose deadline has
    /// arrived, transmitting at most one packet (the transmitter
    /// re-enters here from `transmit_complete`).
    pub(crate) fn check_send_queue(&mut self, dev: DeviceId) {
        {
            let d = &self.devices[dev.0 as usize];
            let DeviceKind::Host(host) = &d.kind else {
                return;
            };
            if host.send_queue.is_empty()
                || d.tx != TxState::Ready
                || d.queue.is_paused(DATA_PRIORITY as usize)
            {
                return;
            }
        }
        if self.devices[dev.0 as usize].queue.dequeue().is_some() {
            error!(dev = ?dev, "port queue should be empty when checking send queue");
            return;
        }

        loop {
            let pkt = {
                let Simulator {
                    devices, timeline, ..
                } = self;
                let DeviceKind::Host(host) = &mut devices[dev.0 as usize].kind else {
                    return;
                };
                let now = timeline.now();
                let Some(&Reverse((deadline, id))) = host.send_queue.peek() else {
                    break;
                };
                if now < deadline {
                    break;
                }
                host.send_queue.pop();
                if !host.flows.contains_key(&id) {
                    continue;
                }
                let qp = host.flows.get_mut(&id).expect("checked above");
                let pkt = qp.generate_next_packet(now, timeline);

                if qp.is_send_completed() {
                    // Drain state: park on the retransmission heap and
                    // make sure its wake-up is armed promptly.
                    let timeout = qp.time_out();
                    host.send_completed.insert(id);
                    host.retransmit_queue.push(Reverse((timeout, id)));
                    let top = host.retransmit_queue.peek().expect("just pushed").0 .0;
                    host.retx_gen += 1;
                    let gen = host.retx_gen;
                    timeline.schedule((top - now).min(1), Event::CheckRetransmit { dev, gen });
                } else {
                    host.send_queue.push(Reverse((qp.next_send_time(), id)));
                }
                pkt
            };

            if let Some(pkt) = pkt {
                self.send(dev, pkt, ETHER_IPV4);
                return;
            }
        }

        // Nothing ready: re-arm a single wake at the new head deadline.
        let Simulator {
            devices, timeline, ..
        } = self;
        let DeviceKind::Host(host) = &mut devices[dev.0 as usize].kind else {
            return;
        };
        host.send_gen += 1;
        if let Some(&Reverse((deadline, _))) = host.send_queue.peek() {
            let now = timeline.now();
            let gen = host.send_gen;
            timeline.schedule(deadline - now, Event::CheckSendQueue { dev, gen });
        }
    }

    /// Fire retransmission timeouts for draining flows. Tombstone
    /// entries whose stored deadline no longer matches the flow's
    /// current one are skipped, so a flow is never reset twice for the
    /// same timeout.
    pub(crate) fn check_retransmit_queue(&mut self, dev: DeviceId) {
        let mut moved = false;
        {
            let Simulator {
                devices, timeline, ..
            } = self;
            let DeviceKind::Host(host) = &mut devices[dev.0 as usize].kind else {
                return;
            };
            let now = timeline.now();
            while let Some(&Reverse((deadline, id))) = host.retransmit_queue.peek() {
                if now < deadline {
                    break;
                }
                host.retransmit_queue.pop();
                if !host.send_completed.contains(&id) {
                    continue;
                }
                let qp = host.flows.get_mut(&id).expect("draining flow is live");
                if qp.time_out() != deadline {
                    // Stale: the flow was reset since this was queued.
                    continue;
                }
                qp.time_out_reset(now, timeline);
                host.send_queue.push(Reverse((qp.next_send_time(), id)));
                host.send_completed.remove(&id);
                moved = true;
            }

            host.retx_gen += 1;
            if let Some(&Reverse((deadline, _))) = host.retransmit_queue.peek() {
                let gen = host.retx_gen;
                timeline.schedule(deadline - now, Event::CheckRetransmit { dev, gen });
            }
        }
        if moved {
            self.check_send_queue(dev);
        }
    }

    /// Admit a flow on a NIC and start pacing it.
    pub(crate) fn set_flow(&mut self, nic: DeviceId, flow: FlowInfo) {
        {
            let Simulator { devices, cfg, .. } = self;
            let rate = devices[nic.0 as usize].rate;
            let DeviceKind::Host(host) = &mut devices[nic.0 as usize].kind else {
                error!(nic = ?nic, "flow admitted on a switch port");
                return;
            };
            if host.flows.contains_key(&flow.id) {
                error!(flow = flow.id, "duplicate flow id on admission, discarding");
                return;
            }
            let qp = RdmaQueuePair::new(flow, nic, rate, cfg);
            host.send_queue.push(Reverse((qp.next_send_time(), flow.id)));
            host.flows.insert(flow.id, qp);
        }
        self.check_send_queue(nic);
    }
}
