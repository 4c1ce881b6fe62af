//! Instruction and data caches (§4.6 "I-Cache / D-Cache").
//!
//! Both caches share the same set-associative line-state machine
//! (`Empty -> Loading -> Full`, with an `Invalid` state for a line whose
//! fetch is in flight but has since been superseded); the original
//! expresses this once per cache type because each attaches different
//! bookkeeping to a completed fill (I-Cache wakes a fetching thread,
//! D-Cache writes back into a register). That difference lives in
//! `icache.rs`/`dcache.rs`; the line array and LRU victim selection are
//! shared here.

pub mod dcache;
pub mod icache;

use abi::message::Address;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LineState {
    Empty,
    Loading,
    Invalid,
    Full,
}

#[derive(Clone, Debug)]
pub struct Line {
    pub state: LineState,
    pub tag: Address,
    pub last_access: u64,
}

impl Line {
    fn empty() -> Self {
        Self { state: LineState::Empty, tag: 0, last_access: 0 }
    }
}

/// A set-associative cache of fixed-size lines, storing metadata only;
/// instruction and data storage overlays the actual word/byte array on
/// top of this (§4.6: the simulator tracks coherence state, not real
/// byte-for-byte memory contents, at this layer).
pub struct CacheSets {
    line_size: u32,
    associativity: u32,
    num_sets: u32,
    lines: Vec<Line>,
    clock: u64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Access {
    Hit(usize),
    Miss(usize),
    /// Every way in the targeted set is `Loading`; nothing to evict.
    AllWaysBusy,
}

impl CacheSets {
    pub fn new(line_size: u32, associativity: u32, num_sets: u32) -> Self {
        let lines = (0..(associativity * num_sets)).map(|_| Line::empty()).collect();
        Self { line_size, associativity, num_sets, lines, clock: 0 }
    }

    fn set_of(&self, address: Address) -> u32 {
        ((address / self.line_size as u64) % self.num_sets as u64) as u32
    }

    fn tag_of(&self, address: Address) -> Address {
        address - (address % self.line_size as u64)
    }

    fn ways(&self, set: u32) -> std::ops::Range<usize> {
        let base = (set * self.associativity) as usize;
        base..base + self.associativity as usize
    }

    /// Looks up `address`, returning a hit index, a miss index chosen for
    /// a fresh fill (evicting the LRU `Full` line if the set has no
    /// `Empty` way), or `AllWaysBusy` if every way is mid-fill.
    pub fn probe(&mut self, address: Address) -> Access {
        self.clock += 1;
        let tag = self.tag_of(address);
        let set = self.set_of(address);

        for way in self.ways(set) {
            if self.lines[way].state == LineState::Full && self.lines[way].tag == tag {
                self.lines[way].last_access = self.clock;
                return Access::Hit(way);
            }
        }

        if let Some(way) = self.ways(set).find(|&w| self.lines[w].state == LineState::Empty) {
            self.lines[way] = Line { state: LineState::Loading, tag, last_access: self.clock };
            return Access::Miss(way);
        }

        let victim = self
            .ways(set)
            .filter(|&w| self.lines[w].state == LineState::Full)
            .min_by_key(|&w| self.lines[w].last_access);

        match victim {
            Some(way) => {
                self.lines[way] = Line { state: LineState::Loading, tag, last_access: self.clock };
                Access::Miss(way)
            }
            None => Access::AllWaysBusy,
        }
    }

    pub fn complete_fill(&mut self, way: usize) {
        if self.lines[way].state == LineState::Loading {
            self.lines[way].state = LineState::Full;
        }
    }

    /// The address tag a miss allocated into `way`, so a reply arriving
    /// out-of-band (e.g. from the coherence substrate) can be matched back
    /// to the way that is waiting on it.
    pub fn tag_at(&self, way: usize) -> Address {
        self.lines[way].tag
    }

    pub fn invalidate(&mut self, way: usize) {
        self.lines[way].state = LineState::Invalid;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miss_then_hit_after_fill_completes() {
        let mut cache = CacheSets::new(64, 2, 4);
        let way = match cache.probe(128) {
            Access::Miss(w) => w,
            other => panic!("expected miss, got {other:?}"),
        };
        assert!(matches!(cache.probe(128), Access::Miss(_) | Access::AllWaysBusy));
        cache.complete_fill(way);
        assert!(matches!(cache.probe(128), Access::Hit(_)));
    }

    #[test]
    fn evicts_lru_when_set_is_full() {
        let mut cache = CacheSets::new(64, 1, 1);
        let w0 = match cache.probe(0) {
            Access::Miss(w) => w,
            other => panic!("{other:?}"),
        };
        cache.complete_fill(w0);
        assert!(matches!(cache.probe(0), Access::Hit(_)));
        // Same set (num_sets=1), different tag: must evict.
        let w1 = match cache.probe(64) {
            Access::Miss(w) => w,
            other => panic!("{other:?}"),
        };
        assert_eq!(w0, w1);
    }
}
