//! One simulated processor core: its thread/family tables, register
//! files, five-stage pipeline, and allocator sub-processes, wired into a
//! single [`Kernel`] (§3 "Core", §4).

use abi::config::Config;
use abi::ids::Pid;

use crate::allocator::bundle::DoBundle;
use crate::allocator::family_allocate::DoFamilyAllocate;
use crate::allocator::family_create::DoFamilyCreate;
use crate::allocator::link_ingest::LinkIngest;
use crate::allocator::thread_activation::DoThreadActivation;
use crate::allocator::thread_allocate::DoThreadAllocate;
use crate::allocator::{CoreState, SharedCore};
use crate::cache::dcache::DCache;
use crate::cache::icache::ICache;
use crate::network::SharedNetworkPort;
use crate::pipeline::decode::Decode;
use crate::pipeline::execute::Execute;
use crate::pipeline::fetch::Fetch;
use crate::pipeline::isa::{Isa, RawInstruction};
use crate::pipeline::memory::Memory;
use crate::pipeline::read::Read;
use crate::pipeline::writeback::Writeback;
use crate::pipeline::{PipelineState, SharedPipeline};
use crate::sched::{Kernel, StepOutcome};

/// One core's complete process set, plus the two pieces of shared state
/// ([`CoreState`] and [`PipelineState`]) every process closes over.
pub struct Core {
    pub pid: Pid,
    pub state: SharedCore,
    pub pipeline: SharedPipeline,
    kernel: Kernel,
}

impl Core {
    pub fn new(
        pid: Pid,
        config: &Config,
        isa: Box<dyn Isa>,
        program: Vec<RawInstruction>,
        network: SharedNetworkPort,
    ) -> Self {
        let state = CoreState::new_with_network(
            pid,
            config.core.num_families,
            config.core.num_threads,
            config.core.num_int_registers,
            config.core.num_flt_registers,
            config.seed,
            network,
        );

        let icache = ICache::new(
            config.icache.cache_line_size,
            config.icache.associativity,
            config.icache.num_sets,
            3,
        );
        // The D-Cache is a coherence client (§4.3): its misses are
        // resolved by the grid's `coherence::CoherenceSubstrate`, not by
        // a fixed timer, so it is constructed in coherent mode here and
        // driven externally by `Grid::step_cycle`.
        let dcache = DCache::new_coherent(
            config.dcache.cache_line_size,
            config.dcache.associativity,
            config.dcache.num_sets,
        );
        let pipeline =
            PipelineState::new(state.clone(), isa, icache, dcache, config.core.control_block_size, program);

        let mut kernel = Kernel::new();
        kernel.register(Box::new(DoFamilyAllocate::new(state.clone())));
        kernel.register(Box::new(DoFamilyCreate::new(state.clone(), pipeline.clone())));
        kernel.register(Box::new(DoThreadAllocate::new(state.clone())));
        kernel.register(Box::new(DoThreadActivation::new(state.clone())));
        kernel.register(Box::new(DoBundle::new(state.clone())));
        kernel.register(Box::new(LinkIngest::new(state.clone())));
        kernel.register(Box::new(Fetch::new(pipeline.clone())));
        kernel.register(Box::new(Decode::new(pipeline.clone())));
        kernel.register(Box::new(Read::new(pipeline.clone())));
        kernel.register(Box::new(Execute::new(pipeline.clone())));
        kernel.register(Box::new(Memory::new(pipeline.clone())));
        kernel.register(Box::new(Writeback::new(pipeline.clone())));

        Self { pid, state, pipeline, kernel }
    }

    pub fn cycle(&self) -> u64 {
        self.kernel.cycle()
    }

    /// Runs this core's processes for one cycle. Does not advance the
    /// inter-core network; that is `Grid::step`'s job, since it touches
    /// more than one core's state (§4.7).
    pub(crate) fn run_cycle(&mut self) -> StepOutcome {
        self.kernel.run_cycle()
    }

    /// Seeds this core with a single runnable thread at `pc`, as if a
    /// family of one had already completed allocation. Used by the grid's
    /// initial boot thread and by tests that want to skip the full
    /// allocate/create dance (§6 "Stepping").
    pub fn spawn_boot_thread(&self, pc: u64) {
        let mut state = self.state.borrow_mut();
        let fid = state.families.allocate().expect("fresh core must have a free family slot");
        {
            let family = state.families.get_mut(fid);
            family.physical_block_size = 1;
            family.dependencies.num_threads_allocated = 1;
            family.dependencies.allocation_done = true;
            family.state = crate::family_table::FamilyState::Active;
        }
        let tid = state
            .threads
            .pop_empty(crate::thread_table::ContextType::Normal)
            .expect("fresh core must have a free thread context");
        {
            let thread = state.threads.get_mut(tid);
            thread.family = fid;
            thread.pc = pc;
            thread.state = crate::thread_table::ThreadState::Active;
        }
        state.active_queue.push_back(tid);
    }
}
