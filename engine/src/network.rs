//! The link and delegate planes that carry allocation, create, sync and
//! detach traffic around a place's ring, separate from the coherence
//! traffic `coma` carries (§4.7, grounded on `Network.cpp`).
//!
//! A link message visits every core in a place exactly once, in ring
//! order, decrementing `remaining` each hop; a delegate message is a
//! direct point-to-point send to an arbitrary core, used for the
//! operations that are inherently all-to-all rather than ring-local
//! (§4.7 "DelegateSetProperty et al.").

use std::cell::{Ref, RefCell, RefMut};
use std::collections::VecDeque;
use std::rc::Rc;

use abi::ids::Pid;
use abi::message::{CoherenceMessage, DelegatePayload, LinkPayload, MessagePayload};

use crate::sched::{ProcResult, Process};

/// One core's outgoing and incoming link/delegate queues. `Network` itself
/// just moves messages between neighboring cores' queues; interpreting a
/// message once it arrives (e.g. turning a `LinkCreate` into a queued
/// `CreateRequest`) is the allocator's job.
pub struct NetworkPorts {
    pub pid: Pid,
    pub ring_size: u32,
    pub outgoing: VecDeque<CoherenceMessage>,
    pub incoming: VecDeque<CoherenceMessage>,
    pub delegate_out: VecDeque<CoherenceMessage>,
    pub delegate_in: VecDeque<CoherenceMessage>,
}

impl NetworkPorts {
    pub fn new(pid: Pid, ring_size: u32) -> Self {
        Self {
            pid,
            ring_size,
            outgoing: VecDeque::new(),
            incoming: VecDeque::new(),
            delegate_out: VecDeque::new(),
            delegate_in: VecDeque::new(),
        }
    }

    fn next_pid(&self) -> Pid {
        (self.pid + 1) % self.ring_size.max(1)
    }
}

/// A handle one core's allocator shares with the grid's [`Network`], so a
/// process running inside that core's own `Kernel` can push onto its
/// outgoing queues directly rather than routing through `Grid::step`
/// (§4.7). `Network::step` holds the very same `Rc` in `ports`, so a push
/// made during a core's `tick`/`commit` is visible the next time the grid
/// forwards a hop.
pub type SharedNetworkPort = Rc<RefCell<NetworkPorts>>;

/// Delivers one hop of outgoing ring/delegate traffic per cycle into the
/// neighboring core's inbox. In the full grid, `Grid::step` calls this
/// once per core per cycle after every core's own processes have run, the
/// network itself being a `Process` like any other so that a full
/// incoming buffer produces ordinary backpressure rather than a silent
/// drop (§5 "Arbitration", §4.7).
pub struct Network {
    ports: Vec<SharedNetworkPort>,
}

impl Network {
    pub fn new(ring_size: u32) -> Self {
        let ports = (0..ring_size)
            .map(|pid| Rc::new(RefCell::new(NetworkPorts::new(pid, ring_size))))
            .collect();
        Self { ports }
    }

    pub fn port(&self, pid: Pid) -> Ref<'_, NetworkPorts> {
        self.ports[pid as usize].borrow()
    }

    pub fn port_mut(&self, pid: Pid) -> RefMut<'_, NetworkPorts> {
        self.ports[pid as usize].borrow_mut()
    }

    /// Returns the shared handle for `pid`'s port, so `Core::new` can hand
    /// it to the allocator processes that live inside that core's own
    /// `Kernel` (§4.1 "DoFamilyAllocate"'s `LinkAllocate` forward, §4.7).
    pub fn port_handle(&self, pid: Pid) -> SharedNetworkPort {
        self.ports[pid as usize].clone()
    }

    /// Advances every link message one hop around its ring, and every
    /// delegate message directly to its destination, respecting a
    /// bounded incoming buffer (§6 "IncomingBufferSize").
    pub fn step(&mut self, incoming_capacity: usize) -> bool {
        let mut moved = false;
        let mut link_sends: Vec<(Pid, CoherenceMessage)> = Vec::new();
        for port in &self.ports {
            let mut port = port.borrow_mut();
            if port.outgoing.is_empty() {
                continue;
            }
            let next = port.next_pid();
            let msg = port.outgoing.pop_front().unwrap();
            link_sends.push((next, msg));
            moved = true;
        }
        for (dest, msg) in link_sends {
            let mut port = self.ports[dest as usize].borrow_mut();
            if port.incoming.len() < incoming_capacity {
                port.incoming.push_back(msg);
            } else {
                drop(port);
                self.ports[dest as usize].borrow_mut().outgoing.push_front(msg);
                moved = false;
            }
        }

        let mut delegate_sends: Vec<(Pid, CoherenceMessage)> = Vec::new();
        for port in &self.ports {
            let mut port = port.borrow_mut();
            if let Some(msg) = port.delegate_out.pop_front() {
                if let MessagePayload::Delegate(DelegatePayload { dest, .. }) = &msg.extra {
                    delegate_sends.push((*dest, msg));
                    moved = true;
                }
            }
        }
        for (dest, msg) in delegate_sends {
            self.ports[dest as usize].borrow_mut().delegate_in.push_back(msg);
        }

        moved
    }
}

/// Wraps one core's view of [`Network`] as a `Process` so it participates
/// in deadlock detection like everything else in the kernel.
pub struct LinkForwarder {
    pid: Pid,
    ring_size: u32,
}

impl LinkForwarder {
    pub fn new(pid: Pid, ring_size: u32) -> Self {
        Self { pid, ring_size }
    }
}

impl Process for LinkForwarder {
    fn name(&self) -> &str {
        "LinkForwarder"
    }

    fn tick(&mut self) -> ProcResult {
        // The actual hop is driven centrally by `Network::step` from
        // `Grid::step`, since forwarding crosses core boundaries and no
        // single core's process can safely mutate a neighbor's incoming
        // queue during its own `tick`. This process exists so a core with
        // no pending link traffic still reports `Failed` honestly for
        // deadlock accounting rather than silently succeeding.
        ProcResult::Delayed
    }

    fn stall_reason(&self) -> String {
        format!("ring forwarder for core {} of {}", self.pid, self.ring_size)
    }
}

/// Builds an outbound link message addressed to the next core in a
/// place's ring (§4.7).
pub fn make_link_message(
    kind: abi::message::MessageKind,
    address: abi::message::Address,
    source: Pid,
    payload: LinkPayload,
) -> CoherenceMessage {
    let mut msg = CoherenceMessage::new(kind, address, source);
    msg.extra = MessagePayload::Link(payload);
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::ids::{Capability, Fid};
    use abi::message::MessageKind;

    #[test]
    fn link_message_hops_around_the_ring() {
        let mut net = Network::new(3);
        let payload = LinkPayload {
            first_fid: Fid::INVALID,
            prev_fid: Fid::INVALID,
            remaining: 2,
            exact: true,
            completion_reg: None,
            capability: Capability::INVALID,
            total_size: 3,
            allocated_count: 0,
            outcome: None,
            create: None,
        };
        net.port_mut(0).outgoing.push_back(make_link_message(MessageKind::LinkCreate, 0, 0, payload));
        assert!(net.step(4));
        assert_eq!(net.port(1).incoming.len(), 1);
    }

    #[test]
    fn delegate_message_goes_directly_to_destination() {
        let mut net = Network::new(4);
        let mut msg = CoherenceMessage::new(MessageKind::DelegateSetProperty, 0, 0);
        msg.extra = MessagePayload::Delegate(DelegatePayload { dest: 3, reg: None, value: 9 });
        net.port_mut(0).delegate_out.push_back(msg);
        assert!(net.step(4));
        assert_eq!(net.port(3).delegate_in.len(), 1);
    }
}
