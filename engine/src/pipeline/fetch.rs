//! The Fetch stage: pulls the next active thread off the allocator's
//! active queue, resolves its program counter against the I-cache, and
//! latches the raw instruction word for Decode (§4.5, grounded on
//! `FetchStage::OnCycle`).
//!
//! A control-block-sized program counter skips its leading control word
//! rather than treating it as an instruction (§4.5 "legacy families skip
//! the control word"); non-legacy families are the only kind this crate
//! models; see `DESIGN.md`.

use ringbuf::Ringbuf;

use crate::pipeline::{FetchLatch, SharedPipeline};
use crate::sched::{ProcResult, Process};
use crate::thread_table::{Tid, ThreadState};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Trace {
    SwitchedIn(Tid),
    IcacheMiss,
    NothingActive,
    LatchFull,
}

pub struct Fetch {
    pipeline: SharedPipeline,
    /// The thread currently being fetched, pinned here across I-cache
    /// miss retries so a stalled fetch does not re-pop the active queue
    /// (§4.5, `FetchStage::m_switched`).
    current: Option<(Tid, u32, u64)>,
    staged: Option<FetchLatch>,
    trace: Ringbuf<Trace, 16>,
}

impl Fetch {
    pub fn new(pipeline: SharedPipeline) -> Self {
        Self { pipeline, current: None, staged: None, trace: Ringbuf::new() }
    }
}

impl Process for Fetch {
    fn name(&self) -> &str {
        "Fetch"
    }

    fn tick(&mut self) -> ProcResult {
        let mut p = self.pipeline.borrow_mut();
        if p.fetch_out.is_some() {
            self.trace.entry(Trace::LatchFull);
            return ProcResult::Failed;
        }

        if self.current.is_none() {
            let tid = {
                let mut core = p.core.borrow_mut();
                core.active_queue.pop_front()
            };
            let Some(tid) = tid else {
                self.trace.entry(Trace::NothingActive);
                return ProcResult::Failed;
            };
            let (fid, pc) = {
                let core = p.core.borrow();
                let thread = core.threads.get(tid);
                (thread.family, thread.pc)
            };
            self.current = Some((tid, fid, pc));
        }

        let (tid, fid, pc) = self.current.unwrap();
        match p.icache.fetch(pc) {
            crate::cache::icache::FetchOutcome::Hit => {
                let raw = p.program.get((pc / 4) as usize).copied().unwrap_or(0);
                self.trace.entry(Trace::SwitchedIn(tid));
                self.staged = Some(FetchLatch { tid, fid, pc, raw });
                self.current = None;
                ProcResult::Success
            }
            crate::cache::icache::FetchOutcome::Miss | crate::cache::icache::FetchOutcome::Busy => {
                self.trace.entry(Trace::IcacheMiss);
                ProcResult::Failed
            }
        }
    }

    fn commit(&mut self) {
        let mut p = self.pipeline.borrow_mut();
        p.icache.tick_fills();
        if let Some(latch) = self.staged.take() {
            let mut core = p.core.borrow_mut();
            core.threads.get_mut(latch.tid).state = ThreadState::Running;
            p.fetch_out = Some(latch);
        }
    }

    fn stall_reason(&self) -> String {
        match self.trace.last().map(|e| e.payload) {
            Some(Trace::IcacheMiss) => "I-cache miss".into(),
            Some(Trace::NothingActive) => "no active thread to fetch".into(),
            Some(Trace::LatchFull) => "Decode has not consumed the fetch latch".into(),
            _ => "no reason recorded".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::CoreState;
    use crate::cache::dcache::DCache;
    use crate::cache::icache::ICache;
    use crate::pipeline::{isa::TestIsa, PipelineState};

    fn pipeline_with_program(program: Vec<u32>) -> SharedPipeline {
        let core = CoreState::new(0, 1, 4, 8, 8);
        PipelineState::new(
            core,
            Box::new(TestIsa),
            ICache::new(64, 2, 4, 1),
            DCache::new(64, 2, 4, 1),
            64,
            program,
        )
    }

    #[test]
    fn fetches_active_thread_after_icache_fill() {
        let pipeline = pipeline_with_program(vec![0xAB]);
        let tid = {
            let p = pipeline.borrow();
            let mut core = p.core.borrow_mut();
            let tid = core.threads.pop_empty(crate::thread_table::ContextType::Normal).unwrap();
            core.threads.get_mut(tid).pc = 0;
            core.active_queue.push_back(tid);
            tid
        };

        let mut fetch = Fetch::new(pipeline.clone());
        assert_eq!(fetch.tick(), ProcResult::Failed); // miss
        fetch.commit();
        assert_eq!(fetch.tick(), ProcResult::Success); // hit after 1-cycle fill
        fetch.commit();
        assert_eq!(pipeline.borrow().fetch_out.as_ref().unwrap().tid, tid);
    }
}
