// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A fixed-capacity trace buffer for simulator diagnostics.
//!
//! This is adapted from the Hubris kernel's `ringbuf` crate, which exists to
//! let a debugger attached to a running embedded target dump the recent
//! history of an interrupt-driven component. The Microgrid simulator runs
//! single-threaded and cooperatively (§5: "a single cooperative
//! discrete-event scheduler"), so none of the original's atomics,
//! `static_cell` statics, or ISR-safety tricks apply — there is no
//! concurrent writer to race against. What's kept is the shape: a
//! fixed-capacity circular buffer of entries with adjacent-duplicate
//! counting, owned by the component that records into it, queried at
//! deadlock time to build the stall-reason dump (§5) or from a test to
//! assert a sequence of internal transitions occurred.
//!
//! ```
//! use ringbuf::Ringbuf;
//!
//! #[derive(Clone, Debug, PartialEq, Eq)]
//! enum Event { Hit, Miss(u32) }
//!
//! let mut rb: Ringbuf<Event, 4> = Ringbuf::new();
//! rb.entry(Event::Hit);
//! rb.entry(Event::Miss(7));
//! rb.entry(Event::Miss(7)); // de-duplicated: bumps the previous entry's count
//! assert_eq!(rb.len(), 2);
//! ```

use std::collections::VecDeque;

/// One recorded entry: a payload plus how many consecutive times in a row
/// it was recorded (de-duplication, as in the original).
#[derive(Clone, Debug)]
pub struct Entry<T> {
    pub payload: T,
    pub count: u32,
}

/// A fixed-capacity ring of the last `N` distinct (after de-duplication)
/// entries recorded.
#[derive(Clone, Debug)]
pub struct Ringbuf<T, const N: usize> {
    buffer: VecDeque<Entry<T>>,
}

impl<T, const N: usize> Default for Ringbuf<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> Ringbuf<T, N> {
    pub fn new() -> Self {
        assert!(N > 0, "a ring buffer must have nonzero capacity");
        Self { buffer: VecDeque::with_capacity(N) }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry<T>> {
        self.buffer.iter()
    }

    /// The most recently recorded entry, if any.
    pub fn last(&self) -> Option<&Entry<T>> {
        self.buffer.back()
    }

    #[cfg(feature = "disabled")]
    pub fn entry(&mut self, _payload: T) {}

    #[cfg(not(feature = "disabled"))]
    pub fn entry(&mut self, payload: T)
    where
        T: PartialEq,
    {
        if let Some(back) = self.buffer.back_mut() {
            if back.payload == payload {
                back.count += 1;
                return;
            }
        }
        if self.buffer.len() == N {
            self.buffer.pop_front();
        }
        self.buffer.push_back(Entry { payload, count: 1 });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    enum Event {
        A,
        B(u32),
    }

    #[test]
    fn dedups_adjacent_entries() {
        let mut rb: Ringbuf<Event, 8> = Ringbuf::new();
        rb.entry(Event::A);
        rb.entry(Event::A);
        rb.entry(Event::B(1));
        assert_eq!(rb.len(), 2);
        assert_eq!(rb.iter().next().unwrap().count, 2);
    }

    #[test]
    fn evicts_oldest_when_full() {
        let mut rb: Ringbuf<Event, 2> = Ringbuf::new();
        rb.entry(Event::A);
        rb.entry(Event::B(1));
        rb.entry(Event::B(2));
        assert_eq!(rb.len(), 2);
        assert_eq!(rb.last().unwrap().payload, Event::B(2));
    }
}
