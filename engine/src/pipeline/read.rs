//! The Read stage: resolves each decoded source operand against the
//! register file, stalling (parking the thread on the register's wait
//! list) if any source is not yet `Full` (§4.5, §4.3).
//!
//! The original additionally bypasses values directly from Execute's
//! output latch so a dependent instruction one cycle behind does not have
//! to wait for a full register-file round trip; this crate always goes
//! through the register file instead, trading one cycle of extra latency
//! per RAW hazard for a much simpler read stage. Noted as a deliberate
//! simplification in `DESIGN.md`.

use ringbuf::Ringbuf;

use crate::pipeline::{ReadLatch, SharedPipeline};
use crate::register_file::RegValue;
use crate::sched::{ProcResult, Process};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Trace {
    Read,
    LatchFull,
    Empty,
    OperandNotReady,
}

pub struct Read {
    pipeline: SharedPipeline,
    staged: Option<ReadLatch>,
    trace: Ringbuf<Trace, 16>,
}

impl Read {
    pub fn new(pipeline: SharedPipeline) -> Self {
        Self { pipeline, staged: None, trace: Ringbuf::new() }
    }
}

impl Process for Read {
    fn name(&self) -> &str {
        "Read"
    }

    fn tick(&mut self) -> ProcResult {
        let mut p = self.pipeline.borrow_mut();
        if p.read_out.is_some() {
            self.trace.entry(Trace::LatchFull);
            return ProcResult::Failed;
        }
        let Some(latch) = p.decode_out.clone() else {
            self.trace.entry(Trace::Empty);
            return ProcResult::Failed;
        };

        let mut operands = Vec::with_capacity(latch.decoded.sources.len());
        let mut core = p.core.borrow_mut();
        for &addr in &latch.decoded.sources {
            match core.regs.read(addr) {
                RegValue::Full(value) => operands.push(*value),
                RegValue::Empty | RegValue::Waiting { .. } | RegValue::Pending { .. } => {
                    core.regs.wait(addr, latch.tid);
                    self.trace.entry(Trace::OperandNotReady);
                    return ProcResult::Failed;
                }
            }
        }
        drop(core);

        p.decode_out = None;
        self.trace.entry(Trace::Read);
        self.staged = Some(ReadLatch {
            tid: latch.tid,
            fid: latch.fid,
            pc: latch.pc,
            decoded: latch.decoded,
            operands,
        });
        ProcResult::Success
    }

    fn commit(&mut self) {
        if let Some(latch) = self.staged.take() {
            self.pipeline.borrow_mut().read_out = Some(latch);
        }
    }

    fn stall_reason(&self) -> String {
        match self.trace.last().map(|e| e.payload) {
            Some(Trace::OperandNotReady) => "waiting on a source register".into(),
            Some(Trace::Empty) => "nothing decoded yet".into(),
            Some(Trace::LatchFull) => "Execute has not consumed the read latch".into(),
            _ => "no reason recorded".into(),
        }
    }
}
