//! The Decode stage: hands Fetch's raw instruction word to the ISA
//! backend and latches the decoded operand list for Read (§4.5, grounded
//! on `DecodeStage.cpp`).

use ringbuf::Ringbuf;

use crate::pipeline::{DecodeLatch, SharedPipeline};
use crate::sched::{ProcResult, Process};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Trace {
    Decoded,
    LatchFull,
    Empty,
    IllegalInstruction,
}

pub struct Decode {
    pipeline: SharedPipeline,
    staged: Option<DecodeLatch>,
    trace: Ringbuf<Trace, 16>,
}

impl Decode {
    pub fn new(pipeline: SharedPipeline) -> Self {
        Self { pipeline, staged: None, trace: Ringbuf::new() }
    }
}

impl Process for Decode {
    fn name(&self) -> &str {
        "Decode"
    }

    fn tick(&mut self) -> ProcResult {
        let mut p = self.pipeline.borrow_mut();
        if p.decode_out.is_some() {
            self.trace.entry(Trace::LatchFull);
            return ProcResult::Failed;
        }
        let Some(latch) = p.fetch_out.take() else {
            self.trace.entry(Trace::Empty);
            return ProcResult::Failed;
        };

        match p.isa.decode(latch.pc, latch.raw) {
            Ok(decoded) => {
                self.trace.entry(Trace::Decoded);
                self.staged =
                    Some(DecodeLatch { tid: latch.tid, fid: latch.fid, pc: latch.pc, decoded });
                ProcResult::Success
            }
            Err(_err) => {
                // A real core would park the thread as fatally trapped
                // (§7 "IllegalInstruction"); wiring that escalation to
                // `SimError` happens in `core.rs`, which owns the thread's
                // fault state.
                self.trace.entry(Trace::IllegalInstruction);
                p.fetch_out = Some(latch);
                ProcResult::Failed
            }
        }
    }

    fn commit(&mut self) {
        if let Some(latch) = self.staged.take() {
            self.pipeline.borrow_mut().decode_out = Some(latch);
        }
    }

    fn stall_reason(&self) -> String {
        match self.trace.last().map(|e| e.payload) {
            Some(Trace::Empty) => "nothing fetched yet".into(),
            Some(Trace::LatchFull) => "Read has not consumed the decode latch".into(),
            Some(Trace::IllegalInstruction) => "illegal instruction".into(),
            _ => "no reason recorded".into(),
        }
    }
}
