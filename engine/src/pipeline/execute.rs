//! The Execute stage: runs the ISA backend's ALU/branch logic and, for a
//! taken branch, redirects the thread's program counter for its next
//! fetch (§4.5, grounded on `ExecuteStage.cpp`).

use ringbuf::Ringbuf;

use crate::pipeline::{ExecuteLatch, SharedPipeline};
use crate::sched::{ProcResult, Process};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Trace {
    Executed,
    LatchFull,
    Empty,
}

pub struct Execute {
    pipeline: SharedPipeline,
    staged: Option<ExecuteLatch>,
    redirect: Option<(crate::thread_table::Tid, u64)>,
    trace: Ringbuf<Trace, 16>,
}

impl Execute {
    pub fn new(pipeline: SharedPipeline) -> Self {
        Self { pipeline, staged: None, redirect: None, trace: Ringbuf::new() }
    }
}

impl Process for Execute {
    fn name(&self) -> &str {
        "Execute"
    }

    fn tick(&mut self) -> ProcResult {
        let mut p = self.pipeline.borrow_mut();
        if p.execute_out.is_some() {
            self.trace.entry(Trace::LatchFull);
            return ProcResult::Failed;
        }
        let Some(latch) = p.read_out.take() else {
            self.trace.entry(Trace::Empty);
            return ProcResult::Failed;
        };

        let executed = match p.isa.execute(&latch.decoded, &latch.operands, latch.pc) {
            Ok(executed) => executed,
            Err(_err) => {
                p.read_out = Some(latch);
                return ProcResult::Failed;
            }
        };

        if let Some(redirect_pc) = executed.redirect_pc {
            self.redirect = Some((latch.tid, redirect_pc));
        } else {
            self.redirect = Some((latch.tid, latch.pc + 4));
        }

        self.trace.entry(Trace::Executed);
        self.staged = Some(ExecuteLatch { tid: latch.tid, fid: latch.fid, executed });
        ProcResult::Success
    }

    fn commit(&mut self) {
        let mut p = self.pipeline.borrow_mut();
        if let Some((tid, pc)) = self.redirect.take() {
            let mut core = p.core.borrow_mut();
            core.threads.get_mut(tid).pc = pc;
            core.active_queue.push_back(tid);
        }
        if let Some(latch) = self.staged.take() {
            p.execute_out = Some(latch);
        }
    }

    fn stall_reason(&self) -> String {
        "nothing read yet".into()
    }
}
