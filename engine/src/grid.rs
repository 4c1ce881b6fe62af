//! The grid: every core plus the link/delegate network connecting them,
//! and the external stepping interface (§6 "Stepping").

use abi::config::Config;
use abi::error::SimError;
use abi::ids::Pid;

use crate::coherence::CoherenceSubstrate;
use crate::core::Core;
use crate::network::Network;
use crate::pipeline::isa::{Isa, RawInstruction};
use crate::sched::StepOutcome;

/// A full multi-core Microgrid, built once from a [`Config`] and stepped
/// one or more cycles at a time.
pub struct Grid {
    cores: Vec<Core>,
    network: Network,
    coherence: CoherenceSubstrate,
    cycle: u64,
}

impl Grid {
    /// Builds a grid of `num_cores` identical cores sharing one program
    /// image, each given its own ISA backend instance via `make_isa`
    /// (an ISA backend is typically stateless, but a factory keeps the
    /// door open for e.g. a per-core trace hook), plus the `coma`
    /// coherence substrate every core's D-Cache misses into (§2).
    pub fn new(
        config: &Config,
        num_cores: u32,
        make_isa: impl Fn() -> Box<dyn Isa>,
        program: Vec<RawInstruction>,
    ) -> Self {
        let network = Network::new(num_cores.max(1));
        let cores = (0..num_cores)
            .map(|pid| Core::new(pid, config, make_isa(), program.clone(), network.port_handle(pid)))
            .collect();
        let coherence = CoherenceSubstrate::new(config, num_cores.max(1));
        Self { cores, network, coherence, cycle: 0 }
    }

    pub fn core(&self, pid: Pid) -> &Core {
        &self.cores[pid as usize]
    }

    pub fn core_mut(&mut self, pid: Pid) -> &mut Core {
        &mut self.cores[pid as usize]
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn coherence(&self) -> &CoherenceSubstrate {
        &self.coherence
    }

    /// Boots a single thread at `pc` on core 0 (§6 "the grid starts with
    /// one runnable thread on core 0 unless otherwise configured").
    pub fn boot(&mut self, pc: u64) {
        self.cores[0].spawn_boot_thread(pc);
    }

    /// Advances the grid by one cycle: every core's processes fire, then
    /// the inter-core network forwards one hop of link/delegate traffic.
    /// A cycle is a structural deadlock only if every core's own kernel
    /// reports one (§5 "structural deadlock... across the whole grid").
    pub fn step_cycle(&mut self) -> StepOutcome {
        let mut all_deadlocked = true;
        let mut stalls = Vec::new();

        for core in &mut self.cores {
            match core.run_cycle() {
                StepOutcome::Deadlock { stalls: core_stalls, .. } => {
                    stalls.extend(core_stalls);
                }
                _ => all_deadlocked = false,
            }
        }

        self.coherence.step(&mut self.cores);
        let network_moved = self.network.step(64);
        self.cycle += 1;

        if all_deadlocked && !network_moved && !self.cores.is_empty() {
            return StepOutcome::Deadlock { cycle: self.cycle, stalls };
        }
        StepOutcome::Idle
    }

    /// Advances the grid for up to `n_cycles`, stopping early on a
    /// terminal outcome (§6 "Stepping").
    pub fn step(&mut self, n_cycles: u64) -> StepOutcome {
        for _ in 0..n_cycles {
            match self.step_cycle() {
                StepOutcome::Idle => continue,
                other => return other,
            }
        }
        StepOutcome::Idle
    }

    /// Converts a terminal [`StepOutcome::Deadlock`] into a [`SimError`]
    /// for callers that want `Result`-based error propagation rather than
    /// matching on `StepOutcome` directly (§7).
    pub fn to_result(outcome: StepOutcome) -> Result<(), SimError> {
        match outcome {
            StepOutcome::Deadlock { cycle, stalls } => Err(SimError::Deadlock {
                cycle,
                stalls: stalls
                    .into_iter()
                    .map(|s| abi::error::StallReason { process: s.process, reason: s.reason })
                    .collect(),
            }),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::isa::TestIsa;
    use abi::config::{CacheConfig, Config, CoreConfig, DirectoryConfig, FpuConfig, InjectionPolicy};

    fn test_config() -> Config {
        let cache = CacheConfig {
            cache_line_size: 64,
            associativity: 2,
            num_sets: 4,
            bank_selector: 0,
            outgoing_buffer_size: 4,
            incoming_buffer_size: 4,
        };
        Config {
            core: CoreConfig {
                num_int_registers: 32,
                num_flt_registers: 32,
                num_families: 4,
                num_threads: 8,
                control_block_size: 64,
                initial_thread_allocate_queue_size: 4,
                create_queue_size: 4,
                thread_cleanup_queue_size: 4,
                family_allocation_suspend_queue_size: 4,
                family_allocation_no_suspend_queue_size: 4,
                family_allocation_exclusive_queue_size: 1,
            },
            icache: cache.clone(),
            dcache: cache.clone(),
            directory: DirectoryConfig { cache, num_tokens: 16, injection_policy: InjectionPolicy::None },
            fpu: FpuConfig::default(),
            seed: 1,
        }
    }

    #[test]
    fn single_core_grid_runs_a_tiny_program_without_deadlock() {
        // LOADIMM r1, #7 ; ADD r2, r1, r1 ; BEQZ r2, +0 (never taken)
        let loadimm = 1 | (1 << 3) | (7 << 18);
        let add = 0 | (2 << 3) | (1 << 8) | (1 << 13);
        let program = vec![loadimm, add];

        let config = test_config();
        let mut grid = Grid::new(&config, 1, || Box::new(TestIsa), program);
        grid.boot(0);

        let outcome = grid.step(20);
        assert!(!matches!(outcome, StepOutcome::Deadlock { .. }));
    }
}
