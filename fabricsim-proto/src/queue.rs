use std::collections::VecDeque;

use tracing::warn;

use crate::packet::Packet;
use crate::{BUBBLE_PRIORITY, NUM_QUEUE};

const CLASS_CAPACITY: u32 = 16 * 1024 * 1024; // 16 MiB drop-tail per class
const BUBBLE_CLASS_PKTS: usize = 2;

struct ClassFifo {
    packets: VecDeque<Packet>,
    bytes: u32,
}

/// Per-device egress queue: one bounded FIFO per priority class with a
/// pause flag each. Dequeue is strict priority, skipping paused
/// classes, which is the minimum structure PFC needs to pause the
/// lossless data class without stalling control traffic.
pub struct PortQueue {
    classes: Vec<ClassFifo>,
    paused: Vec<bool>,
}

impl PortQueue {
    pub fn new() -> Self {
        PortQueue {
            classes: (0..NUM_QUEUE)
                .map(|_| ClassFifo {
                    packets: VecDeque::new(),
                    bytes: 0,
                })
                .collect(),
            paused: vec![false; NUM_QUEUE],
        }
    }

    /// Queue a packet on the class named by its priority tag.
    ///
    /// Returns false on a soft drop: the Bubble control class is capped
    /// at two frames, and each class FIFO is drop-tail bounded. An
    /// out-of-range priority is a configuration error and aborts.
    pub fn enqueue(&mut self, pkt: Packet) -> bool {
        let class = pkt.priority as usize;
        assert!(class < NUM_QUEUE, "invalid priority class {class}");

        if class == BUBBLE_PRIORITY as usize
            && self.classes[class].packets.len() >= BUBBLE_CLASS_PKTS
        {
            return false;
        }

        let fifo = &mut self.classes[class];
        if fifo.bytes + pkt.size() > CLASS_CAPACITY {
            warn!(class, bytes = fifo.bytes, "class FIFO overflow, tail-dropping");
            return false;
        }
        fifo.bytes += pkt.size();
        fifo.packets.push_back(pkt);
        true
    }

    /// Head of the first non-paused, non-empty class in priority order.
    pub fn dequeue(&mut self) -> Option<Packet> {
        for (class, fifo) in self.classes.iter_mut().enumerate() {
            if self.paused[class] {
                continue;
            }
            if let Some(pkt) = fifo.packets.pop_front() {
                fifo.bytes -= pkt.size();
                return Some(pkt);
            }
        }
        None
    }

    pub fn set_pause(&mut self, class: usize, flag: bool) {
        assert!(class < NUM_QUEUE, "invalid priority class {class}");
        self.paused[class] = flag;
    }

    pub fn is_paused(&self, class: usize) -> bool {
        assert!(class < NUM_QUEUE, "invalid priority class {class}");
        self.paused[class]
    }

    /// Queued bytes in one class.
    pub fn bytes(&self, class: usize) -> u32 {
        assert!(class < NUM_QUEUE, "invalid priority class {class}");
        self.classes[class].bytes
    }

    /// Queued bytes across all classes.
    pub fn total_bytes(&self) -> u32 {
        self.classes.iter().map(|c| c.bytes).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.iter().all(|c| c.packets.is_empty())
    }
}

impl Default for PortQueue {
    fn default() -> Self {
        Self::new()
    }
}
