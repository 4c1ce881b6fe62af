//! Ring node: FIFO-ordered forwarding of coherence messages around a ring
//! (§4.5 "Ring Node"). A [`LocalDirectory`](crate::LocalDirectory) sits on
//! a sub-ring with its cluster's caches as the other stops; the top-level
//! ring connects every local directory to one or more
//! [`RootDirectory`](crate::RootDirectory)s. Both levels share this one
//! implementation: a ring is a fixed ordering of participant ids, and a
//! message hops from one id to the next each step until it reaches its
//! destination, never overtaking a message that entered the ring earlier
//! for the same address (§4.7 "token messages for a single address
//! traverse the ring in hop order (no overtake within a ring)").

use std::collections::VecDeque;

use abi::message::CoherenceMessage;

/// One stop on a ring: an inbox fed by the previous stop, an outbox drained
/// by the next. A participant (a directory, a root) pulls from `inbox` and
/// pushes into `outbox` on its own schedule; [`Ring::step`] only moves
/// messages already queued in `outbox` to the next stop's `inbox`.
#[derive(Debug, Default)]
pub struct RingNode {
    pub inbox: VecDeque<CoherenceMessage>,
    pub outbox: VecDeque<CoherenceMessage>,
}

impl RingNode {
    pub fn new() -> Self {
        Self { inbox: VecDeque::new(), outbox: VecDeque::new() }
    }

    pub fn send(&mut self, msg: CoherenceMessage) {
        self.outbox.push_back(msg);
    }

    pub fn recv(&mut self) -> Option<CoherenceMessage> {
        self.inbox.pop_front()
    }
}

/// A fixed ring of [`RingNode`]s. `step` advances every queued message
/// exactly one hop, in node order, so a message that left node `i`'s
/// outbox this cycle arrives at node `(i+1) % n`'s inbox next cycle — it
/// is never possible for a message entering the ring later to arrive
/// before one that entered earlier for the same destination, since each
/// node's inbox is itself FIFO (§4.7).
pub struct Ring {
    nodes: Vec<RingNode>,
    incoming_capacity: usize,
}

impl Ring {
    pub fn new(len: usize, incoming_capacity: usize) -> Self {
        assert!(len > 0, "a ring must have at least one stop");
        Self { nodes: (0..len).map(|_| RingNode::new()).collect(), incoming_capacity }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, id: usize) -> &RingNode {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: usize) -> &mut RingNode {
        &mut self.nodes[id]
    }

    /// Moves one hop's worth of traffic: every node's queued outbox
    /// messages move to the next node's inbox, unless that inbox is at
    /// capacity, in which case the message stays queued (ordinary
    /// backpressure, not a drop). Returns whether anything moved.
    pub fn step(&mut self) -> bool {
        let len = self.nodes.len();
        let mut moved = false;
        let mut hops: Vec<(usize, CoherenceMessage)> = Vec::new();
        for (id, node) in self.nodes.iter_mut().enumerate() {
            if let Some(msg) = node.outbox.pop_front() {
                hops.push(((id + 1) % len, msg));
            }
        }
        for (dest, msg) in hops {
            let node = &mut self.nodes[dest];
            if self.incoming_capacity == 0 || node.inbox.len() < self.incoming_capacity {
                node.inbox.push_back(msg);
                moved = true;
            } else {
                // Destination is full: put it back at the front of the
                // sender's outbox so FIFO order is preserved next step.
                let sender = (dest + len - 1) % len;
                self.nodes[sender].outbox.push_front(msg);
            }
        }
        moved
    }
}
