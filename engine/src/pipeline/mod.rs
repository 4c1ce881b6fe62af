//! The five-stage pipeline: Fetch, Decode, Read, Execute, Memory, and a
//! trailing Writeback (§4.5). Six stages are listed because a memory
//! operation's destination is written back a cycle after Memory resolves
//! it, the same split the original keeps between `MemoryStage` proper and
//! the register-file write it schedules.
//!
//! Each stage is a [`crate::sched::Process`] that reads the latch left by
//! the stage before it and, on success, stages a new latch for the stage
//! after it — the "bypass network" of §4.5 is exactly this: Execute can
//! also forward a value straight to Read's operand-fetch of the next
//! instruction in the same cycle by checking `PipelineState::execute_out`
//! before falling back to the register file.

pub mod decode;
pub mod execute;
pub mod fetch;
pub mod isa;
pub mod memory;
pub mod read;
pub mod writeback;

use std::cell::RefCell;
use std::rc::Rc;

use abi::regs::RegAddr;

use self::isa::{Decoded, Executed, Isa, RawInstruction};
use crate::allocator::SharedCore;
use crate::cache::dcache::DCache;
use crate::cache::icache::ICache;
use crate::thread_table::Tid;

#[derive(Clone, Debug)]
pub struct FetchLatch {
    pub tid: Tid,
    pub fid: u32,
    pub pc: u64,
    pub raw: RawInstruction,
}

#[derive(Clone, Debug)]
pub struct DecodeLatch {
    pub tid: Tid,
    pub fid: u32,
    pub pc: u64,
    pub decoded: Decoded,
}

#[derive(Clone, Debug)]
pub struct ReadLatch {
    pub tid: Tid,
    pub fid: u32,
    pub pc: u64,
    pub decoded: Decoded,
    pub operands: Vec<u64>,
}

#[derive(Clone, Debug)]
pub struct ExecuteLatch {
    pub tid: Tid,
    pub fid: u32,
    pub executed: Executed,
}

#[derive(Clone, Debug)]
pub struct MemoryLatch {
    pub tid: Tid,
    pub dest: Option<RegAddr>,
    pub value: u64,
}

/// Latches and shared caches threaded between pipeline stages. Held
/// behind `Rc<RefCell<_>>` for the same reason as
/// [`crate::allocator::CoreState`]: several independently-scheduled
/// `Process`es need to reach it, never concurrently.
pub struct PipelineState {
    pub core: SharedCore,
    pub isa: Box<dyn Isa>,
    pub icache: ICache,
    pub dcache: DCache,
    pub control_block_size: u32,
    /// Instruction memory, indexed by `pc / 4`. Real MGSim fetches raw
    /// bytes out of the shared COMA-backed address space; this crate
    /// keeps the I-cache's hit/miss timing model (§4.6) but, since actual
    /// instruction bytes are outside this spec's scope, resolves a hit
    /// against a flat program image loaded once at `Grid::new` time.
    pub program: Vec<RawInstruction>,

    pub fetch_out: Option<FetchLatch>,
    pub decode_out: Option<DecodeLatch>,
    pub read_out: Option<ReadLatch>,
    pub execute_out: Option<ExecuteLatch>,
    pub memory_out: Option<MemoryLatch>,
}

pub type SharedPipeline = Rc<RefCell<PipelineState>>;

impl PipelineState {
    pub fn new(
        core: SharedCore,
        isa: Box<dyn Isa>,
        icache: ICache,
        dcache: DCache,
        control_block_size: u32,
        program: Vec<RawInstruction>,
    ) -> SharedPipeline {
        Rc::new(RefCell::new(Self {
            core,
            isa,
            icache,
            dcache,
            control_block_size,
            program,
            fetch_out: None,
            decode_out: None,
            read_out: None,
            execute_out: None,
            memory_out: None,
        }))
    }
}
