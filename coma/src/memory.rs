//! Main memory: the backing store for line fills and write-backs (§4.6).
//! The only component allowed to evict a line to, or fetch a line from,
//! real storage is the [`crate::RootDirectory`]; `MainMemory` itself is
//! just that storage plus the fixed per-operation latency a fill or
//! write-back takes (§2 "Main Memory... Share 3%" — deliberately the
//! smallest, dumbest component in the substrate).

use std::collections::{HashMap, VecDeque};

use abi::message::Address;

/// One line's worth of bytes, lazily materialized to all-zero on first
/// touch (this simulator never needs to model *which* bytes a program
/// reads, only that a fill round-trips the same bytes a write-back put
/// there — §8 property 7, "loading and storing the same word... is the
/// identity modulo coherence state").
pub type LineData = Vec<u8>;

enum Op {
    Fill,
    WriteBack(LineData),
}

struct InFlight {
    address: Address,
    remaining: u32,
    op: Op,
}

/// Completed memory operation, ready for the [`crate::RootDirectory`] to
/// consume.
pub enum Completion {
    Filled { address: Address, data: LineData },
    WrittenBack { address: Address },
}

pub struct MainMemory {
    line_bytes: usize,
    fill_latency: u32,
    writeback_latency: u32,
    lines: HashMap<Address, LineData>,
    in_flight: VecDeque<InFlight>,
}

impl MainMemory {
    pub fn new(line_bytes: usize, fill_latency: u32, writeback_latency: u32) -> Self {
        Self {
            line_bytes,
            fill_latency: fill_latency.max(1),
            writeback_latency: writeback_latency.max(1),
            lines: HashMap::new(),
            in_flight: VecDeque::new(),
        }
    }

    /// Begins a fill of `address`; the data is available after
    /// `fill_latency` further calls to [`Self::tick`].
    pub fn begin_fill(&mut self, address: Address) {
        self.in_flight.push_back(InFlight { address, remaining: self.fill_latency, op: Op::Fill });
    }

    /// Begins a write-back of `data` to `address`; committed to the
    /// backing store after `writeback_latency` further calls to
    /// [`Self::tick`].
    pub fn begin_writeback(&mut self, address: Address, data: LineData) {
        self.in_flight.push_back(InFlight {
            address,
            remaining: self.writeback_latency,
            op: Op::WriteBack(data),
        });
    }

    pub fn num_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Whether `address` has ever been filled or written back before. The
    /// root directory uses this to tell a genuinely virgin line (whose `T`
    /// tokens have never left it, since nothing has ever fetched it) apart
    /// from a line that returned to idle after every token came back
    /// (§8 property 2, "token conservation" — the invariant only holds if
    /// *something* starts out holding all `T` tokens for an address no one
    /// has touched yet, and that something is the root).
    pub fn contains(&self, address: Address) -> bool {
        self.lines.contains_key(&address)
    }

    /// Advances every outstanding operation one cycle, committing
    /// write-backs to the backing store immediately (so a subsequent fill
    /// of the same address sees the new data) and returning every
    /// operation that completed this cycle.
    pub fn tick(&mut self) -> Vec<Completion> {
        let mut completed = Vec::new();
        let mut remaining_ops = VecDeque::with_capacity(self.in_flight.len());
        while let Some(mut op) = self.in_flight.pop_front() {
            op.remaining = op.remaining.saturating_sub(1);
            if op.remaining == 0 {
                match op.op {
                    Op::Fill => {
                        let data = self
                            .lines
                            .entry(op.address)
                            .or_insert_with(|| vec![0u8; self.line_bytes])
                            .clone();
                        completed.push(Completion::Filled { address: op.address, data });
                    }
                    Op::WriteBack(data) => {
                        self.lines.insert(op.address, data);
                        completed.push(Completion::WrittenBack { address: op.address });
                    }
                }
            } else {
                remaining_ops.push_back(op);
            }
        }
        self.in_flight = remaining_ops;
        completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_completes_after_its_latency() {
        let mut mem = MainMemory::new(64, 2, 1);
        mem.begin_fill(0x1000);
        assert!(mem.tick().is_empty());
        let completed = mem.tick();
        assert_eq!(completed.len(), 1);
        assert!(matches!(completed[0], Completion::Filled { address: 0x1000, .. }));
    }

    #[test]
    fn writeback_then_fill_observes_the_written_data() {
        let mut mem = MainMemory::new(4, 1, 1);
        mem.begin_writeback(0x2000, vec![1, 2, 3, 4]);
        let wb = mem.tick();
        assert!(matches!(wb[0], Completion::WrittenBack { address: 0x2000 }));

        mem.begin_fill(0x2000);
        let fill = mem.tick();
        match &fill[0] {
            Completion::Filled { data, .. } => assert_eq!(data, &vec![1, 2, 3, 4]),
            _ => panic!("expected a fill completion"),
        }
    }
}
