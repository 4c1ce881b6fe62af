//! The Memory stage: resolves a load against the D-Cache, or simply
//! passes a non-memory result through unchanged, latching the final
//! value for Writeback (§4.5, §4.6).
//!
//! This simulator does not model a byte-addressable backing store (out of
//! scope per the pipeline's Non-goals); a completed load's value is the
//! address itself, which is enough to exercise the cache's hit/miss
//! timing and the pending-register wakeup path without inventing memory
//! contents semantics the spec never defines.

use ringbuf::Ringbuf;

use crate::cache::dcache::AccessOutcome;
use crate::pipeline::{ExecuteLatch, MemoryLatch, SharedPipeline};
use crate::sched::{ProcResult, Process};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Trace {
    Completed,
    DcacheMiss,
    LatchFull,
    Empty,
}

pub struct Memory {
    pipeline: SharedPipeline,
    pending: Option<ExecuteLatch>,
    staged: Option<MemoryLatch>,
    trace: Ringbuf<Trace, 16>,
}

impl Memory {
    pub fn new(pipeline: SharedPipeline) -> Self {
        Self { pipeline, pending: None, staged: None, trace: Ringbuf::new() }
    }
}

impl Process for Memory {
    fn name(&self) -> &str {
        "Memory"
    }

    fn tick(&mut self) -> ProcResult {
        let mut p = self.pipeline.borrow_mut();
        if p.memory_out.is_some() {
            self.trace.entry(Trace::LatchFull);
            return ProcResult::Failed;
        }

        let latch = match self.pending.take() {
            Some(latch) => latch,
            None => match p.execute_out.take() {
                Some(latch) => latch,
                None => {
                    self.trace.entry(Trace::Empty);
                    return ProcResult::Failed;
                }
            },
        };

        let Some(address) = latch.executed.memory_address else {
            self.trace.entry(Trace::Completed);
            self.staged = Some(MemoryLatch {
                tid: latch.tid,
                dest: latch.executed.dest,
                value: latch.executed.value,
            });
            return ProcResult::Success;
        };

        let Some(dest) = latch.executed.dest else {
            self.trace.entry(Trace::Completed);
            self.staged = Some(MemoryLatch { tid: latch.tid, dest: None, value: 0 });
            return ProcResult::Success;
        };

        match p.dcache.read(address, dest, false) {
            AccessOutcome::Hit => {
                self.trace.entry(Trace::Completed);
                self.staged = Some(MemoryLatch { tid: latch.tid, dest: Some(dest), value: address });
                ProcResult::Success
            }
            AccessOutcome::Miss | AccessOutcome::Busy => {
                self.trace.entry(Trace::DcacheMiss);
                self.pending = Some(latch);
                ProcResult::Failed
            }
        }
    }

    fn commit(&mut self) {
        let mut p = self.pipeline.borrow_mut();
        p.dcache.tick_fills();
        if let Some(latch) = self.staged.take() {
            p.memory_out = Some(latch);
        }
    }

    fn stall_reason(&self) -> String {
        match self.trace.last().map(|e| e.payload) {
            Some(Trace::DcacheMiss) => "D-cache miss".into(),
            Some(Trace::Empty) => "nothing executed yet".into(),
            Some(Trace::LatchFull) => "Writeback has not consumed the memory latch".into(),
            _ => "no reason recorded".into(),
        }
    }
}
