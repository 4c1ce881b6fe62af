//! The local directory: one per cluster, sitting on the sub-ring whose
//! leaves are that cluster's D/I-caches, and on the global ring above it
//! (§4.5, §3 "Directory line").
//!
//! A local directory is a set-associative array of [`LineEntry`] exactly
//! like `engine::cache::CacheSets`, but tracking token counts and
//! outstanding-request counters instead of cache-line contents, since a
//! directory never stores the data itself — only who currently has
//! permission to (§GLOSSARY "Token").

use std::collections::VecDeque;

use abi::message::{Address, CoherenceMessage, MessageKind};
use ringbuf::Ringbuf;

use crate::evicted::EvictedLineBuffer;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Trace {
    AllocatedFresh(Address),
    MergedEvicted(Address),
    ForwardedAbove(Address),
    KeptLocal(Address),
    ParkedTokens(Address),
    TransientUpgraded(Address),
    SkippedForeignCluster(Address),
    DivertedForeignRequest(Address),
    NoTraffic,
}

/// One directory entry (§3 "Directory line" + the local-only
/// `ntokenline`/`ntokenrem`/`nrequestin`/`nrequestout` fields).
#[derive(Clone, Debug)]
struct LineEntry {
    valid: bool,
    tag: Address,
    /// Tokens held at the directory itself.
    tokens: u32,
    /// Whether this line's single priority token currently sits here.
    priority: bool,
    /// True while an off-ring fetch or write-back is outstanding.
    reserved: bool,
    /// Tokens held by caches below this directory.
    ntokenline: i64,
    /// Tokens currently in transit between below and above.
    ntokenrem: i64,
    /// Requests currently below this directory.
    nrequestin: i64,
    /// Requests currently above this directory (i.e. we forwarded them
    /// up and are waiting on a response).
    nrequestout: i64,
    last_access: u64,
    deferred: VecDeque<CoherenceMessage>,
}

impl LineEntry {
    fn empty() -> Self {
        Self {
            valid: false,
            tag: 0,
            tokens: 0,
            priority: false,
            reserved: false,
            ntokenline: 0,
            ntokenrem: 0,
            nrequestin: 0,
            nrequestout: 0,
            last_access: 0,
            deferred: VecDeque::new(),
        }
    }

    /// "a line becomes evictable when `ntokenline = 0 ∧ nrequestout = 0`"
    /// (§4.5).
    fn evictable(&self) -> bool {
        self.valid && self.ntokenline == 0 && self.nrequestout == 0 && !self.reserved
    }

    /// Folds negative book-keeping the other way, as §4.5 specifies:
    /// "if `ntokenrem < 0`, it is folded into `ntokenline`; if
    /// `ntokenline < 0` after a deposit, it is folded the other way."
    fn normalize(&mut self) {
        if self.ntokenrem < 0 {
            self.ntokenline += self.ntokenrem;
            self.ntokenrem = 0;
        }
        if self.ntokenline < 0 {
            self.ntokenrem += self.ntokenline;
            self.ntokenline = 0;
        }
    }
}

pub struct LocalDirectory {
    id: usize,
    /// Cores whose D/I-caches sit below this directory (§2 "Local
    /// Directory (per cluster)"). A message arriving from Above whose
    /// `source` is one of these is the return leg of a request this
    /// cluster itself issued; anything else is foreign traffic merely
    /// passing the cluster on the global ring.
    members: Vec<abi::ids::Pid>,
    line_size: u32,
    associativity: u32,
    num_sets: u32,
    total_tokens: u32,
    lines: Vec<LineEntry>,
    clock: u64,
    below_in: VecDeque<CoherenceMessage>,
    below_out: VecDeque<CoherenceMessage>,
    above_in: VecDeque<CoherenceMessage>,
    above_out: VecDeque<CoherenceMessage>,
    trace: Ringbuf<Trace, 32>,
}

impl LocalDirectory {
    pub fn new(
        id: usize,
        members: Vec<abi::ids::Pid>,
        line_size: u32,
        associativity: u32,
        num_sets: u32,
        total_tokens: u32,
    ) -> Self {
        let slots = (associativity * num_sets).max(1);
        Self {
            id,
            members,
            line_size,
            associativity,
            num_sets,
            total_tokens,
            lines: (0..slots).map(|_| LineEntry::empty()).collect(),
            clock: 0,
            below_in: VecDeque::new(),
            below_out: VecDeque::new(),
            above_in: VecDeque::new(),
            above_out: VecDeque::new(),
            trace: Ringbuf::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    fn set_of(&self, address: Address) -> u32 {
        ((address / self.line_size.max(1) as u64) % self.num_sets.max(1) as u64) as u32
    }

    fn tag_of(&self, address: Address) -> Address {
        let line_size = self.line_size.max(1) as u64;
        address - (address % line_size)
    }

    fn ways(&self, set: u32) -> std::ops::Range<usize> {
        let base = (set * self.associativity) as usize;
        base..base + self.associativity as usize
    }

    fn find(&self, address: Address) -> Option<usize> {
        let tag = self.tag_of(address);
        self.ways(self.set_of(address)).find(|&w| self.lines[w].valid && self.lines[w].tag == tag)
    }

    /// Finds or allocates a line for `address`, merging in any matching
    /// evicted-line-buffer entry for a freshly allocated line (§4.5
    /// "AcquireTokenData from Below, line absent").
    fn find_or_allocate(&mut self, address: Address, evicted: &mut EvictedLineBuffer) -> (usize, bool) {
        if let Some(way) = self.find(address) {
            return (way, false);
        }
        let tag = self.tag_of(address);
        let set = self.set_of(address);
        let way = self
            .ways(set)
            .find(|&w| !self.lines[w].valid)
            .or_else(|| self.ways(set).find(|&w| self.lines[w].evictable()))
            .unwrap_or_else(|| self.ways(set).min_by_key(|&w| self.lines[w].last_access).unwrap());

        if self.lines[way].valid {
            let old = &self.lines[way];
            evicted.record(old.tag, old.ntokenrem, old.nrequestin);
        }

        self.lines[way] = LineEntry { valid: true, tag, last_access: self.clock, ..LineEntry::empty() };
        if let Some(merge) = evicted.take(address) {
            self.lines[way].ntokenrem = merge.ntokenrem;
            self.lines[way].nrequestin = merge.nrequestin;
            self.trace.entry(Trace::MergedEvicted(address));
        } else {
            self.trace.entry(Trace::AllocatedFresh(address));
        }
        (way, true)
    }

    pub fn submit_from_below(&mut self, msg: CoherenceMessage) {
        self.below_in.push_back(msg);
    }

    pub fn deliver_from_above(&mut self, msg: CoherenceMessage) {
        self.above_in.push_back(msg);
    }

    pub fn drain_above_out(&mut self) -> Vec<CoherenceMessage> {
        self.below_drain(false)
    }

    pub fn drain_below_out(&mut self) -> Vec<CoherenceMessage> {
        self.below_drain(true)
    }

    fn below_drain(&mut self, below: bool) -> Vec<CoherenceMessage> {
        let queue = if below { &mut self.below_out } else { &mut self.above_out };
        queue.drain(..).collect()
    }

    /// Processes at most one message arriving from below and one from
    /// above this cycle. A cluster with multiple caches below it would
    /// call this once per cycle regardless of how many caches are
    /// attached, since only one below-message and one above-message can
    /// be serviced per cycle per §4.5's per-side dispatch.
    pub fn step(&mut self, evicted: &mut EvictedLineBuffer) {
        self.clock += 1;
        let mut did_something = false;
        if let Some(msg) = self.below_in.pop_front() {
            did_something = true;
            self.handle_from_below(msg, evicted);
        }
        if let Some(msg) = self.above_in.pop_front() {
            did_something = true;
            self.handle_from_above(msg, evicted);
        }
        if !did_something {
            self.trace.entry(Trace::NoTraffic);
        }
    }

    fn handle_from_below(&mut self, mut msg: CoherenceMessage, evicted: &mut EvictedLineBuffer) {
        match msg.kind {
            MessageKind::AcquireTokenData | MessageKind::AcquireToken => {
                let (way, fresh) = self.find_or_allocate(msg.address, evicted);
                if fresh {
                    self.lines[way].reserved = true;
                    self.lines[way].nrequestout += 1;
                    msg.local_ring_hops = 0;
                    self.above_out.push_back(msg);
                    self.trace.entry(Trace::ForwardedAbove(self.lines[way].tag));
                    return;
                }

                if self.lines[way].reserved {
                    // An off-ring fetch or write-back for this line is
                    // already outstanding; queue behind it rather than
                    // racing a second request above for the same line
                    // (§4.5's per-line serialization, mirrored at the root
                    // for memory fills).
                    self.lines[way].deferred.push_back(msg);
                    return;
                }

                self.line_present_acquire(way, &mut msg);
            }
            MessageKind::DisseminateTokenData => {
                self.dissemination_from_below(msg, evicted);
            }
            _ => {
                // Non-token traffic (allocation/link/delegate messages)
                // does not pass through the coherence directories.
                self.below_out.push_back(msg);
            }
        }
    }

    /// §4.5 "AcquireTokenData from Below, line present" and "AcquireToken
    /// from Below" (the write-intent variant, which additionally resolves
    /// a transient-vs-priority race deterministically).
    fn line_present_acquire(&mut self, way: usize, msg: &mut CoherenceMessage) {
        let is_write_intent = msg.kind == MessageKind::AcquireToken;

        if is_write_intent && msg.transient && self.lines[way].priority {
            // Open Question (a): clear the line's priority bit *before*
            // copying it onto the message, so there is never a cycle in
            // which both the line and the in-flight message report
            // holding the priority token (§8 property 3).
            self.lines[way].priority = false;
            msg.transient = false;
            msg.priority = true;
            self.trace.entry(Trace::TransientUpgraded(self.lines[way].tag));
        } else if !msg.transient {
            msg.tokens_acquired += self.lines[way].tokens;
            self.lines[way].tokens = 0;
            if self.lines[way].priority {
                msg.priority = true;
                self.lines[way].priority = false;
            }
        }

        let keep_local = self.lines[way].ntokenline + self.lines[way].ntokenrem > 0 || msg.local_ring_hops < 1;
        if keep_local {
            msg.local_ring_hops += 1;
            self.trace.entry(Trace::KeptLocal(self.lines[way].tag));
            self.below_out.push_back(msg.clone());
        } else {
            if self.lines[way].nrequestin > 0 {
                self.lines[way].nrequestin -= 1;
            }
            self.lines[way].nrequestout += 1;
            self.lines[way].reserved = true;
            msg.local_ring_hops = 0;
            self.trace.entry(Trace::ForwardedAbove(self.lines[way].tag));
            self.above_out.push_back(msg.clone());
        }
    }

    /// §4.5 "DisseminateTokenData (eviction/write-back) from Below."
    fn dissemination_from_below(&mut self, msg: CoherenceMessage, evicted: &mut EvictedLineBuffer) {
        let (way, _) = self.find_or_allocate(msg.address, evicted);
        let line = &mut self.lines[way];

        // The tokens coming back were on loan to a cache below us, so they
        // leave `ntokenline` as they arrive; `normalize()` folds the result
        // back in if this pushes it negative (more came back than we had on
        // record, e.g. after a line was re-allocated).
        line.ntokenline -= msg.tokens_acquired as i64;
        line.normalize();

        let no_request_in_flight = line.nrequestout == 0;
        let fits_locally = line.tokens as u64 + msg.tokens_acquired as u64 <= self.total_tokens as u64;

        if !msg.data_valid && no_request_in_flight && fits_locally {
            line.tokens += msg.tokens_acquired;
            if msg.priority {
                line.priority = true;
            }
            line.normalize();
            self.trace.entry(Trace::ParkedTokens(line.tag));
        } else {
            line.nrequestout += 1;
            line.reserved = true;
            line.normalize();
            self.trace.entry(Trace::ForwardedAbove(line.tag));
            self.above_out.push_back(msg);
        }
    }

    fn handle_from_above(&mut self, mut msg: CoherenceMessage, evicted: &mut EvictedLineBuffer) {
        if self.is_inside(msg.source) {
            // The return leg of one of our own below-originated requests.
            let (way, _) = self.find_or_allocate(msg.address, evicted);
            let line = &mut self.lines[way];
            if line.nrequestout > 0 {
                line.nrequestout -= 1;
            }
            line.ntokenline += msg.tokens_acquired as i64;
            line.reserved = line.nrequestout > 0;
            line.normalize();
            self.below_out.push_back(msg);

            if !self.lines[way].reserved {
                if let Some(deferred) = self.lines[way].deferred.pop_front() {
                    self.below_in.push_front(deferred);
                }
            }
            return;
        }

        // Foreign source: either this line isn't ours to answer (skip
        // onward) or it is, and the message must detour into our local
        // ring to see whether our caches hold any of the tokens it wants.
        let resident = self.find(msg.address);
        let has_trail = resident.is_none() && evicted.contains(msg.address);
        match resident {
            None if !has_trail => {
                self.trace.entry(Trace::SkippedForeignCluster(msg.address));
                self.above_out.push_back(msg);
            }
            _ => {
                let (way, _) = self.find_or_allocate(msg.address, evicted);
                let line = &mut self.lines[way];
                line.nrequestin += 1;
                line.ntokenrem += msg.tokens_acquired as i64;
                line.normalize();
                // This detour counts as the message's one local-ring
                // tour, so if it re-enters from below with nothing more
                // to gather it resumes its trip above rather than
                // orbiting again (§4.5's "hasn't been around once yet").
                msg.local_ring_hops = 1;
                self.trace.entry(Trace::DivertedForeignRequest(msg.address));
                self.below_out.push_back(msg);
            }
        }
    }

    fn is_inside(&self, source: abi::ids::Pid) -> bool {
        self.members.contains(&source)
    }

    pub fn total_tokens(&self) -> u32 {
        self.total_tokens
    }

    /// Sum of tokens resident at this directory across all valid lines,
    /// used by the token-conservation tests (§8 property 2).
    pub fn tokens_held(&self, address: Address) -> u32 {
        self.find(address).map(|w| self.lines[w].tokens).unwrap_or(0)
    }

    pub fn has_priority(&self, address: Address) -> bool {
        self.find(address).map(|w| self.lines[w].priority).unwrap_or(false)
    }

    /// Tokens for `address` currently sitting in one of this directory's
    /// queues (not yet folded into a line's bookkeeping), used by the
    /// token-conservation tests to account for a message mid-transit
    /// between two `step` calls (§8 property 2).
    pub fn queued_tokens(&self, address: Address) -> u32 {
        let queues = [&self.below_in, &self.above_in, &self.below_out, &self.above_out];
        let mut total: u32 = queues
            .iter()
            .flat_map(|q| q.iter())
            .filter(|m| m.address == address)
            .map(|m| m.tokens_acquired)
            .sum();
        if let Some(way) = self.find(address) {
            total += self.lines[way].deferred.iter().filter(|m| m.address == address).map(|m| m.tokens_acquired).sum::<u32>();
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::message::MessageKind;

    fn acquire(address: Address, tokens_requested: u32) -> CoherenceMessage {
        let mut m = CoherenceMessage::new(MessageKind::AcquireTokenData, address, 7);
        m.tokens_requested = tokens_requested;
        m
    }

    #[test]
    fn first_acquire_on_an_empty_line_is_forwarded_above() {
        let mut dir = LocalDirectory::new(0, vec![7], 64, 2, 4, 16);
        let mut evicted = EvictedLineBuffer::new(4);
        dir.submit_from_below(acquire(0x100, 1));
        dir.step(&mut evicted);
        let above = dir.drain_above_out();
        assert_eq!(above.len(), 1);
        assert_eq!(above[0].address, 0x100);
    }

    #[test]
    fn response_from_above_deposits_tokens_and_returns_below() {
        let mut dir = LocalDirectory::new(0, vec![7], 64, 2, 4, 16);
        let mut evicted = EvictedLineBuffer::new(4);
        dir.submit_from_below(acquire(0x100, 1));
        dir.step(&mut evicted);
        dir.drain_above_out();

        let mut response = acquire(0x100, 1);
        response.source = 7; // the directory's own cluster's core
        response.tokens_acquired = 16;
        response.priority = true;
        dir.deliver_from_above(response);
        dir.step(&mut evicted);

        let below = dir.drain_below_out();
        assert_eq!(below.len(), 1);
        assert_eq!(below[0].tokens_acquired, 16);
    }

    #[test]
    fn transient_request_upgrades_when_it_meets_the_priority_token() {
        let mut dir = LocalDirectory::new(0, vec![7], 64, 1, 1, 16);
        let mut evicted = EvictedLineBuffer::new(4);

        // Seed a resident line holding the priority token via a prior
        // dissemination (a cache returning tokens it no longer needs).
        let mut give_back = CoherenceMessage::new(MessageKind::DisseminateTokenData, 0x200, 1);
        give_back.tokens_acquired = 4;
        give_back.priority = true;
        dir.submit_from_below(give_back);
        dir.step(&mut evicted);
        assert!(dir.has_priority(0x200));

        let mut transient = acquire(0x200, 1);
        transient.kind = MessageKind::AcquireToken;
        transient.transient = true;
        dir.submit_from_below(transient);
        dir.step(&mut evicted);

        assert!(!dir.has_priority(0x200), "line must give up priority once it upgrades a request");
        let below = dir.drain_below_out();
        assert_eq!(below.len(), 1);
        assert!(below[0].priority, "the request itself now carries the single priority token");
        assert!(!below[0].transient, "an upgraded request is no longer transient");
    }

    #[test]
    fn dissemination_parks_tokens_when_no_request_outstanding() {
        let mut dir = LocalDirectory::new(0, vec![7], 64, 1, 1, 16);
        let mut evicted = EvictedLineBuffer::new(4);
        let mut give_back = CoherenceMessage::new(MessageKind::DisseminateTokenData, 0x300, 1);
        give_back.tokens_acquired = 16;
        dir.submit_from_below(give_back);
        dir.step(&mut evicted);

        assert_eq!(dir.tokens_held(0x300), 16);
        assert!(dir.drain_above_out().is_empty());
    }

    #[test]
    fn dirty_writeback_always_forwards_to_root() {
        let mut dir = LocalDirectory::new(0, vec![7], 64, 1, 1, 16);
        let mut evicted = EvictedLineBuffer::new(4);
        let mut wb = CoherenceMessage::new(MessageKind::DisseminateTokenData, 0x400, 1);
        wb.tokens_acquired = 16;
        wb.data_valid = true;
        dir.submit_from_below(wb);
        dir.step(&mut evicted);

        assert_eq!(dir.tokens_held(0x400), 0);
        assert_eq!(dir.drain_above_out().len(), 1);
    }

    #[test]
    fn second_acquire_queues_behind_an_outstanding_fetch_instead_of_double_forwarding() {
        let mut dir = LocalDirectory::new(0, vec![7], 64, 1, 1, 16);
        let mut evicted = EvictedLineBuffer::new(4);

        dir.submit_from_below(acquire(0x600, 1));
        dir.step(&mut evicted);
        assert_eq!(dir.drain_above_out().len(), 1, "first request forwards above");

        // A second request for the same line arrives before the first's
        // response does; it must queue, not trigger a second forward.
        dir.submit_from_below(acquire(0x600, 1));
        dir.step(&mut evicted);
        assert!(dir.drain_above_out().is_empty(), "second request must not double-forward");
        assert!(dir.drain_below_out().is_empty());

        let mut response = acquire(0x600, 1);
        response.source = 7;
        response.tokens_acquired = 16;
        response.priority = true;
        dir.deliver_from_above(response);
        dir.step(&mut evicted);

        // The original requester's response goes below immediately; the
        // queued second request is requeued for the next step.
        assert_eq!(dir.drain_below_out().len(), 1);

        dir.step(&mut evicted);
        let below = dir.drain_below_out();
        assert_eq!(below.len(), 1, "deferred request is serviced once the line is free");
        assert_eq!(below[0].address, 0x600);
    }

    #[test]
    fn foreign_request_for_an_absent_line_is_skipped_onward() {
        let mut dir = LocalDirectory::new(0, vec![7], 64, 1, 1, 16);
        let mut evicted = EvictedLineBuffer::new(4);
        let mut foreign = acquire(0x500, 1);
        foreign.source = 99;
        dir.deliver_from_above(foreign);
        dir.step(&mut evicted);
        assert_eq!(dir.drain_above_out().len(), 1);
        assert!(dir.drain_below_out().is_empty());
    }
}
