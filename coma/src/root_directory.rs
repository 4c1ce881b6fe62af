//! The root directory: sits between the top-level ring and [`crate::MainMemory`]
//! (§4.6). Where a [`crate::LocalDirectory`] tracks tokens its cluster's
//! caches hold, a root directory is the home for every address whose tokens
//! are *not* currently held anywhere in the machine — the place an
//! `AcquireTokenData` that toured the whole ring without finding its line
//! cached finally lands, and the place a dirty write-back eventually has to
//! be committed to memory.
//!
//! A root only ever needs bookkeeping for a line while some of its tokens
//! are parked here or a memory operation is outstanding for it; once a
//! line's tokens are entirely back out in the field and no fill/write-back
//! is pending, there is nothing left worth remembering, so entries are
//! garbage-collected rather than held in a fixed-size cache (§4.6 "the root
//! is sized by outstanding traffic, not by the address space it covers").

use std::collections::{HashMap, VecDeque};

use abi::message::{Address, CoherenceMessage, MessageKind};
use ringbuf::Ringbuf;

use crate::memory::{Completion, MainMemory};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Trace {
    FillStarted(Address),
    FillCompleted(Address),
    WritebackStarted(Address),
    WritebackCompleted(Address),
    AnsweredFromCache(Address),
    Parked(Address),
    Deferred(Address),
    NoTraffic,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Pending {
    None,
    Fill,
    WriteBack,
}

struct RootLine {
    tokens: u32,
    priority: bool,
    /// Whether `data` reflects a write newer than what's in memory.
    dirty: bool,
    data: Option<Vec<u8>>,
    pending: Pending,
    /// Requests that arrived while a fill or write-back was outstanding
    /// for this line; serviced FIFO once the operation completes (§4.6
    /// "any AcquireToken(Data) that arrives at the root serializes behind
    /// any in-flight memory fill for the same line").
    deferred: VecDeque<CoherenceMessage>,
}

impl RootLine {
    fn fresh() -> Self {
        Self { tokens: 0, priority: false, dirty: false, data: None, pending: Pending::None, deferred: VecDeque::new() }
    }

    fn idle(&self) -> bool {
        self.tokens == 0 && !self.dirty && self.pending == Pending::None && self.deferred.is_empty()
    }
}

/// Routes an address to the owning root directory in split-directory mode
/// (§4.6 "the address space may be partitioned across multiple
/// root-directory instances by `(address >> k) mod n`").
pub fn shard_of(address: Address, shard_shift: u32, shard_count: u32) -> u32 {
    ((address >> shard_shift) % shard_count.max(1) as u64) as u32
}

pub struct RootDirectory {
    id: usize,
    total_tokens: u32,
    line_bytes: usize,
    shard_shift: u32,
    shard_count: u32,
    shard_index: u32,
    lines: HashMap<Address, RootLine>,
    below_in: VecDeque<CoherenceMessage>,
    below_out: VecDeque<CoherenceMessage>,
    trace: Ringbuf<Trace, 32>,
}

impl RootDirectory {
    pub fn new(id: usize, total_tokens: u32, line_bytes: usize, shard_shift: u32, shard_count: u32, shard_index: u32) -> Self {
        Self {
            id,
            total_tokens,
            line_bytes,
            shard_shift,
            shard_count: shard_count.max(1),
            shard_index,
            lines: HashMap::new(),
            below_in: VecDeque::new(),
            below_out: VecDeque::new(),
            trace: Ringbuf::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Whether this shard is the home for `address` in split-directory
    /// mode; a non-owning root should not receive the message in the
    /// first place, but callers can use this to route.
    pub fn owns(&self, address: Address) -> bool {
        shard_of(address, self.shard_shift, self.shard_count) == self.shard_index
    }

    pub fn submit(&mut self, msg: CoherenceMessage) {
        self.below_in.push_back(msg);
    }

    pub fn drain_out(&mut self) -> Vec<CoherenceMessage> {
        self.below_out.drain(..).collect()
    }

    pub fn num_tracked_lines(&self) -> usize {
        self.lines.len()
    }

    /// Tokens currently parked at this root for `address` (0 if nothing is
    /// tracked, meaning every token is out in the field) — used by the
    /// token-conservation tests (§8 property 2).
    pub fn tokens_held(&self, address: Address) -> u32 {
        self.lines.get(&address).map(|l| l.tokens).unwrap_or(0)
    }

    /// Tokens for `address` sitting in this root's below-side queues
    /// (in-flight requests never carry tokens of their own, but a
    /// dissemination that has arrived but not yet been folded into
    /// `tokens_held` does), mirroring
    /// [`crate::LocalDirectory::queued_tokens`] (§8 property 2).
    pub fn queued_tokens(&self, address: Address) -> u32 {
        let mut total: u32 = self
            .below_in
            .iter()
            .chain(self.below_out.iter())
            .filter(|m| m.address == address)
            .map(|m| m.tokens_acquired)
            .sum();
        if let Some(line) = self.lines.get(&address) {
            total += line.deferred.iter().filter(|m| m.address == address).map(|m| m.tokens_acquired).sum::<u32>();
        }
        total
    }

    /// Advances outstanding memory operations one cycle and processes at
    /// most one ring-side message. Mirrors [`crate::LocalDirectory::step`]'s
    /// one-message-per-side-per-cycle discipline.
    pub fn step(&mut self, memory: &mut MainMemory) {
        for completion in memory.tick() {
            match completion {
                Completion::Filled { address, data } => self.complete_fill(address, data),
                Completion::WrittenBack { address } => self.complete_writeback(address),
            }
        }

        if let Some(msg) = self.below_in.pop_front() {
            self.handle(msg, memory);
        } else {
            self.trace.entry(Trace::NoTraffic);
        }
    }

    fn handle(&mut self, msg: CoherenceMessage, memory: &mut MainMemory) {
        match msg.kind {
            MessageKind::AcquireTokenData | MessageKind::AcquireToken => self.handle_acquire(msg, memory),
            MessageKind::DisseminateTokenData => self.handle_dissemination(msg, memory),
            _ => self.below_out.push_back(msg),
        }
    }

    fn handle_acquire(&mut self, msg: CoherenceMessage, memory: &mut MainMemory) {
        // A line nobody has tracked yet is either genuinely virgin (no
        // cache or directory has ever taken a token for it) or merely
        // idle (every token already came back and the entry was
        // garbage-collected). Only the virgin case needs seeding: the
        // root is the implicit initial holder of all `T` tokens and the
        // priority bit for an address main memory has never been asked
        // to fill, since nothing else in the system could hold them yet.
        let virgin = !self.lines.contains_key(&msg.address) && !memory.contains(msg.address);
        let total_tokens = self.total_tokens;
        let line = self.lines.entry(msg.address).or_insert_with(RootLine::fresh);
        if virgin {
            line.tokens = total_tokens;
            line.priority = true;
        }

        if line.pending != Pending::None {
            self.trace.entry(Trace::Deferred(msg.address));
            line.deferred.push_back(msg);
            return;
        }

        match &line.data {
            Some(data) => {
                let data = data.clone();
                self.respond_to_acquire(msg, data);
                self.trace.entry(Trace::AnsweredFromCache(self.lines[&msg.address].dirty as usize as u64 as Address));
            }
            None => {
                line.pending = Pending::Fill;
                line.deferred.push_back(msg);
                memory.begin_fill(msg.address);
                self.trace.entry(Trace::FillStarted(msg.address));
            }
        }
    }

    fn handle_dissemination(&mut self, msg: CoherenceMessage, memory: &mut MainMemory) {
        let address = msg.address;
        let line = self.lines.entry(address).or_insert_with(RootLine::fresh);
        line.tokens += msg.tokens_acquired;
        if msg.priority {
            line.priority = true;
        }
        if msg.data_valid {
            line.data = msg.payload.clone();
            line.dirty = true;
        }

        if line.tokens >= self.total_tokens && line.dirty && line.pending == Pending::None {
            let payload = line.data.clone().unwrap_or_else(|| vec![0u8; self.line_bytes]);
            line.pending = Pending::WriteBack;
            memory.begin_writeback(address, payload);
            self.trace.entry(Trace::WritebackStarted(address));
        } else {
            self.trace.entry(Trace::Parked(address));
        }

        self.gc(address);
    }

    fn respond_to_acquire(&mut self, mut msg: CoherenceMessage, data: Vec<u8>) {
        let address = msg.address;
        let line = self.lines.get_mut(&address).expect("line must exist to answer an acquire");
        msg.tokens_acquired += line.tokens;
        line.tokens = 0;
        if line.priority {
            msg.priority = true;
            line.priority = false;
        }
        msg.payload = Some(data);
        msg.data_valid = true;
        self.below_out.push_back(msg);
        self.gc(address);
    }

    fn complete_fill(&mut self, address: Address, data: Vec<u8>) {
        self.trace.entry(Trace::FillCompleted(address));
        let line = self.lines.entry(address).or_insert_with(RootLine::fresh);
        line.pending = Pending::None;
        line.data = Some(data.clone());
        if let Some(next) = line.deferred.pop_front() {
            self.respond_to_acquire(next, data);
        } else {
            self.gc(address);
        }
    }

    fn complete_writeback(&mut self, address: Address) {
        self.trace.entry(Trace::WritebackCompleted(address));
        let line = self.lines.entry(address).or_insert_with(RootLine::fresh);
        line.pending = Pending::None;
        line.dirty = false;

        // §4.6 Open Question (b): a write-back and a pending acquire for
        // the same freshly reallocated line serialize FIFO — the next
        // deferred request (if any) is serviced against the data that was
        // just written, without issuing a redundant fill.
        if let Some(next) = line.deferred.pop_front() {
            let data = line.data.clone().unwrap_or_else(|| vec![0u8; self.line_bytes]);
            self.respond_to_acquire(next, data);
        } else {
            self.gc(address);
        }
    }

    fn gc(&mut self, address: Address) {
        if self.lines.get(&address).map(|l| l.idle()).unwrap_or(false) {
            self.lines.remove(&address);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::message::MessageKind;

    fn acquire(address: Address) -> CoherenceMessage {
        let mut m = CoherenceMessage::new(MessageKind::AcquireTokenData, address, 1);
        m.tokens_requested = 16;
        m
    }

    #[test]
    fn first_acquire_triggers_a_fill_and_is_answered_once_it_completes() {
        let mut root = RootDirectory::new(0, 16, 64, 0, 1, 0);
        let mut mem = MainMemory::new(64, 2, 1);
        root.submit(acquire(0x1000));
        root.step(&mut mem);
        assert!(root.drain_out().is_empty(), "must wait for the fill");

        root.step(&mut mem);
        root.step(&mut mem);
        let out = root.drain_out();
        assert_eq!(out.len(), 1);
        assert!(out[0].data_valid);
    }

    #[test]
    fn first_ever_acquire_for_an_address_grants_all_tokens_and_priority() {
        let mut root = RootDirectory::new(0, 16, 64, 0, 1, 0);
        let mut mem = MainMemory::new(64, 2, 1);
        root.submit(acquire(0x9000));
        root.step(&mut mem);
        root.step(&mut mem);
        root.step(&mut mem);
        let out = root.drain_out();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].tokens_acquired, 16, "a virgin line's T tokens start at the root");
        assert!(out[0].priority, "the priority bit must also start somewhere");
    }

    #[test]
    fn re_fetch_of_an_idle_line_does_not_conjure_new_tokens() {
        // Once a line's tokens have all gone out and come back to a cache
        // (never disseminated back to the root), the root's entry is
        // garbage-collected. A later acquire for that same address must
        // not re-seed a fresh `T` tokens at the root, since the cache
        // already holds them.
        let mut root = RootDirectory::new(0, 16, 64, 0, 1, 0);
        let mut mem = MainMemory::new(64, 1, 1);
        root.submit(acquire(0xA000));
        root.step(&mut mem);
        root.step(&mut mem);
        root.drain_out();
        assert_eq!(root.num_tracked_lines(), 0);

        root.submit(acquire(0xA000));
        root.step(&mut mem);
        root.step(&mut mem);
        let out = root.drain_out();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].tokens_acquired, 0, "the root holds nothing now; the requesting cache already does");
    }

    #[test]
    fn second_acquire_defers_behind_an_in_flight_fill() {
        let mut root = RootDirectory::new(0, 16, 64, 0, 1, 0);
        let mut mem = MainMemory::new(64, 3, 1);
        root.submit(acquire(0x2000));
        root.step(&mut mem);
        root.submit(acquire(0x2000));
        root.step(&mut mem);
        assert!(root.drain_out().is_empty());

        root.step(&mut mem);
        let out = root.drain_out();
        assert_eq!(out.len(), 1, "only the first request is answered by the fill");
    }

    #[test]
    fn dirty_return_of_all_tokens_triggers_a_writeback() {
        let mut root = RootDirectory::new(0, 16, 4, 0, 1, 0);
        let mut mem = MainMemory::new(4, 1, 2);
        let mut wb = CoherenceMessage::new(MessageKind::DisseminateTokenData, 0x3000, 1);
        wb.tokens_acquired = 16;
        wb.data_valid = true;
        wb.payload = Some(vec![9, 9, 9, 9]);
        root.submit(wb);
        root.step(&mut mem);
        assert_eq!(mem.num_in_flight(), 1);
    }

    #[test]
    fn partial_token_return_parks_without_writing_memory() {
        let mut root = RootDirectory::new(0, 16, 4, 0, 1, 0);
        let mut mem = MainMemory::new(4, 1, 2);
        let mut partial = CoherenceMessage::new(MessageKind::DisseminateTokenData, 0x4000, 1);
        partial.tokens_acquired = 4;
        root.submit(partial);
        root.step(&mut mem);
        assert_eq!(mem.num_in_flight(), 0);
        assert_eq!(root.tokens_held(0x4000), 4);
    }

    #[test]
    fn idle_line_is_garbage_collected() {
        let mut root = RootDirectory::new(0, 16, 64, 0, 1, 0);
        let mut mem = MainMemory::new(64, 1, 1);
        root.submit(acquire(0x5000));
        root.step(&mut mem);
        root.step(&mut mem);
        root.drain_out();
        assert_eq!(root.num_tracked_lines(), 0, "fully returned line leaves no residue");
    }

    #[test]
    fn split_mode_routes_by_shard() {
        let root = RootDirectory::new(1, 16, 64, 4, 2, 1);
        assert!(root.owns(0x10));
        assert!(!root.owns(0x20));
    }
}
