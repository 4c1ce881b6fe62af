//! The evicted-line buffer: short-term memory of lines just evicted from
//! a local ring, so a race between an eviction and an in-flight response
//! for the same line can be merged instead of triggering a spurious
//! off-chip refetch (§4.5, §5 "Deadlock avoidance" (b), §8 scenario S5).

use std::collections::VecDeque;

use abi::message::Address;

/// The residual bookkeeping a [`crate::LocalDirectory`] carries for a line
/// at the moment it becomes evictable but still has counts outstanding
/// (§4.5 "if `ntokenrem > 0 ∨ nrequestin > 0` at eviction time, the
/// residual counts are moved into the evicted-line buffer").
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EvictedEntry {
    pub address: Address,
    pub ntokenrem: i64,
    pub nrequestin: i64,
}

/// A fixed-capacity FIFO of [`EvictedEntry`]. §5 "Deadlock avoidance" (b)
/// requires this buffer be sized strictly greater than the maximum number
/// of lines any single sub-ring can have in flight, so eviction itself
/// never has to block; callers are responsible for sizing it that way
/// (this type just enforces "oldest survives least" once `capacity` is
/// exceeded, matching a real hardware FIFO rather than silently growing).
pub struct EvictedLineBuffer {
    capacity: usize,
    entries: VecDeque<EvictedEntry>,
}

impl EvictedLineBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "an evicted-line buffer must have nonzero capacity");
        Self { capacity, entries: VecDeque::with_capacity(capacity) }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records the residual counts for a line this directory just evicted.
    /// If the buffer is at capacity, the oldest entry is dropped to make
    /// room (§5's sizing requirement means this should not happen in
    /// practice; it is not itself a fatal condition, since losing a very
    /// old race-merge opportunity just means the next acquire pays for an
    /// off-chip refetch instead of merging, not that tokens are lost).
    pub fn record(&mut self, address: Address, ntokenrem: i64, nrequestin: i64) {
        if ntokenrem == 0 && nrequestin == 0 {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(EvictedEntry { address, ntokenrem, nrequestin });
    }

    /// Whether an entry for `address` is currently buffered, without
    /// consuming it (§4.5 "From Above with foreign source... no eviction
    /// trail exists").
    pub fn contains(&self, address: Address) -> bool {
        self.entries.iter().any(|e| e.address == address)
    }

    /// Removes and returns the entry for `address`, if one is buffered —
    /// the merge step a freshly re-allocated directory line performs when
    /// an acquire for a line it just evicted arrives again (§4.5
    /// "AcquireTokenData from Below, line absent... If the evicted-line
    /// buffer holds a matching entry, merge...").
    pub fn take(&mut self, address: Address) -> Option<EvictedEntry> {
        let pos = self.entries.iter().position(|e| e.address == address)?;
        self.entries.remove(pos)
    }
}
