//! The Writeback stage: commits Memory's result to the register file and
//! reactivates every thread that was parked waiting on it (§4.3, §4.5).

use ringbuf::Ringbuf;

use crate::pipeline::SharedPipeline;
use crate::sched::{ProcResult, Process};
use crate::thread_table::Tid;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Trace {
    Wrote,
    Empty,
}

pub struct Writeback {
    pipeline: SharedPipeline,
    staged: Option<(abi::regs::RegAddr, u64)>,
    woken: Vec<Tid>,
    trace: Ringbuf<Trace, 8>,
}

impl Writeback {
    pub fn new(pipeline: SharedPipeline) -> Self {
        Self { pipeline, staged: None, woken: Vec::new(), trace: Ringbuf::new() }
    }
}

impl Process for Writeback {
    fn name(&self) -> &str {
        "Writeback"
    }

    fn tick(&mut self) -> ProcResult {
        let mut p = self.pipeline.borrow_mut();
        let Some(latch) = p.memory_out.take() else {
            self.trace.entry(Trace::Empty);
            return ProcResult::Failed;
        };

        if let Some(dest) = latch.dest {
            self.staged = Some((dest, latch.value));
        }
        self.trace.entry(Trace::Wrote);
        ProcResult::Success
    }

    fn commit(&mut self) {
        let Some((dest, value)) = self.staged.take() else { return };
        let mut p = self.pipeline.borrow_mut();
        let mut core = p.core.borrow_mut();
        let effect = core.regs.write(dest, value);
        for tid in effect.woken {
            core.active_queue.push_back(tid);
        }
        drop(core);
        drop(p);
        self.woken.clear();
    }

    fn stall_reason(&self) -> String {
        "nothing to write back yet".into()
    }
}
