//! The instruction cache: services Fetch's line reads and wakes the
//! fetching thread once a miss's fill completes (§4.6).

use std::collections::HashMap;

use abi::message::Address;

use super::{Access, CacheSets};

/// Outcome of a fetch request against the I-Cache.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FetchOutcome {
    /// The line was already resident; the caller may read it this cycle.
    Hit,
    /// A fill was started (or was already in flight); the caller should
    /// retry once `fill_latency` more cycles have elapsed.
    Miss,
    /// The set backing this address has every way mid-fill; try again
    /// next cycle.
    Busy,
}

pub struct ICache {
    sets: CacheSets,
    fill_latency: u32,
    in_flight: HashMap<usize, u32>,
}

impl ICache {
    pub fn new(line_size: u32, associativity: u32, num_sets: u32, fill_latency: u32) -> Self {
        Self { sets: CacheSets::new(line_size, associativity, num_sets), fill_latency, in_flight: HashMap::new() }
    }

    /// Requests the line containing `pc`. Call once per cycle until it
    /// stops returning `Miss`/`Busy` (§4.6 "fetch stall due to I-cache
    /// miss").
    pub fn fetch(&mut self, pc: Address) -> FetchOutcome {
        match self.sets.probe(pc) {
            Access::Hit(_) => FetchOutcome::Hit,
            Access::Miss(way) => {
                self.in_flight.entry(way).or_insert(self.fill_latency);
                FetchOutcome::Miss
            }
            Access::AllWaysBusy => FetchOutcome::Busy,
        }
    }

    /// Advances every in-flight fill by one cycle, completing any whose
    /// latency has elapsed.
    pub fn tick_fills(&mut self) {
        let mut done = Vec::new();
        for (way, remaining) in self.in_flight.iter_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                done.push(*way);
            }
        }
        for way in done {
            self.in_flight.remove(&way);
            self.sets.complete_fill(way);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_becomes_hit_after_fill_latency_elapses() {
        let mut icache = ICache::new(64, 2, 4, 3);
        assert_eq!(icache.fetch(0x100), FetchOutcome::Miss);
        for _ in 0..3 {
            icache.tick_fills();
        }
        assert_eq!(icache.fetch(0x100), FetchOutcome::Hit);
    }
}
