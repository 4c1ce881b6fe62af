//! The data cache: services Memory-stage loads and stores, marking the
//! destination register `Pending` on a miss and completing it once the
//! fill returns (§4.6).

use std::collections::HashMap;

use abi::message::Address;
use abi::regs::RegAddr;

use super::{Access, CacheSets};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AccessOutcome {
    Hit,
    Miss,
    Busy,
}

/// A load whose completion needs to be written back to a register once
/// its fill finishes (§4.6, `RegisterFile::mark_pending`).
#[derive(Copy, Clone, Debug)]
pub struct OutstandingLoad {
    pub dest: RegAddr,
    pub sign_extend: bool,
}

pub struct DCache {
    sets: CacheSets,
    fill_latency: u32,
    /// `true` when this cache's misses are resolved by a live coherence
    /// substrate rather than a fixed timer (§4.3 "D-Cache is a coherence
    /// client"); see [`DCache::new_coherent`].
    coherent: bool,
    in_flight: HashMap<usize, (u32, OutstandingLoad)>,
    /// Ways whose miss has already been handed to the coherence bridge, so
    /// `take_new_misses` reports each one exactly once.
    dispatched: std::collections::HashSet<usize>,
}

impl DCache {
    pub fn new(line_size: u32, associativity: u32, num_sets: u32, fill_latency: u32) -> Self {
        Self {
            sets: CacheSets::new(line_size, associativity, num_sets),
            fill_latency,
            coherent: false,
            in_flight: HashMap::new(),
            dispatched: std::collections::HashSet::new(),
        }
    }

    /// A D-Cache whose misses are resolved by an `engine::coherence`
    /// bridge instead of a fixed latency: `tick_fills` never completes a
    /// fill on its own here, only once `complete_coherent_fill` has been
    /// called for that address by the directory response (§4.3, §4.6).
    pub fn new_coherent(line_size: u32, associativity: u32, num_sets: u32) -> Self {
        Self {
            sets: CacheSets::new(line_size, associativity, num_sets),
            fill_latency: 0,
            coherent: true,
            in_flight: HashMap::new(),
            dispatched: std::collections::HashSet::new(),
        }
    }

    pub fn read(&mut self, address: Address, dest: RegAddr, sign_extend: bool) -> AccessOutcome {
        match self.sets.probe(address) {
            Access::Hit(_) => AccessOutcome::Hit,
            Access::Miss(way) => {
                let initial = if self.coherent { u32::MAX } else { self.fill_latency };
                self.in_flight.entry(way).or_insert((initial, OutstandingLoad { dest, sign_extend }));
                AccessOutcome::Miss
            }
            Access::AllWaysBusy => AccessOutcome::Busy,
        }
    }

    /// Drains the addresses of misses not yet dispatched to the coherence
    /// substrate, marking them dispatched. No-op on a non-coherent cache.
    pub fn take_new_misses(&mut self) -> Vec<Address> {
        if !self.coherent {
            return Vec::new();
        }
        let mut addrs = Vec::new();
        for &way in self.in_flight.keys() {
            if self.dispatched.insert(way) {
                addrs.push(self.sets.tag_at(way));
            }
        }
        addrs
    }

    /// Called once the coherence substrate answers `address` with data:
    /// arms the matching in-flight fill so the next `tick_fills` drains it
    /// (§4.6 "CompletedReads").
    pub fn complete_coherent_fill(&mut self, address: Address) {
        if let Some(&way) = self.in_flight.keys().find(|&&w| self.sets.tag_at(w) == address) {
            if let Some((remaining, _)) = self.in_flight.get_mut(&way) {
                *remaining = 0;
            }
            self.dispatched.remove(&way);
        }
    }

    /// A write always hits the coherence plane rather than local cache
    /// state in this simulator (§4.7: writes are delegated through
    /// `coma`); `write` here only invalidates a stale local copy.
    pub fn invalidate(&mut self, address: Address) {
        if let Access::Hit(way) = self.sets.probe(address) {
            self.sets.invalidate(way);
        }
    }

    /// Advances in-flight fills, returning the loads that completed this
    /// cycle so the caller can write their destination registers. On a
    /// coherent cache this only drains fills already armed by
    /// `complete_coherent_fill`; it never completes one on a timer.
    pub fn tick_fills(&mut self) -> Vec<OutstandingLoad> {
        let mut done = Vec::new();
        if self.coherent {
            for (&way, &(remaining, load)) in self.in_flight.iter() {
                if remaining == 0 {
                    done.push((way, load));
                }
            }
        } else {
            for (way, (remaining, load)) in self.in_flight.iter_mut() {
                *remaining = remaining.saturating_sub(1);
                if *remaining == 0 {
                    done.push((*way, *load));
                }
            }
        }
        let mut completed = Vec::new();
        for (way, load) in done {
            self.in_flight.remove(&way);
            self.dispatched.remove(&way);
            self.sets.complete_fill(way);
            completed.push(load);
        }
        completed
    }
}
