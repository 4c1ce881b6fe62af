//! The bridge between a core's coherence-client D-Cache (§4.3) and the
//! `coma` substrate's local directories, top-level ring, root directory
//! and main memory (§4.5–§4.7).
//!
//! `coma` never reaches into `engine`; this module is the one place that
//! knows about both sides. Each core is its own single-core cluster (a
//! degenerate but entirely valid instance of §4.5's "local directory per
//! cluster": the cluster's only leaf is that core's D-Cache) so the
//! bridge needs no cache-to-cluster grouping policy beyond `Pid` identity.
//! The top-level ring seats every local directory plus the root
//! directory as stops, in the order the grid's cores are numbered,
//! followed by the root; `coma::ring::Ring` already implements the hop
//! mechanics of §4.7, so this module only has to shuttle messages between
//! each directory's own queues and its ring stop once per cycle.

use coma::{EvictedLineBuffer, LocalDirectory, MainMemory, Ring, RootDirectory};

use abi::config::Config;
use abi::ids::Pid;
use abi::message::{Address, CoherenceMessage, MessageKind};

use crate::core::Core;

/// Per-grid coherence substrate: one [`LocalDirectory`] per core, one
/// shared [`RootDirectory`] backed by [`MainMemory`], and the top-level
/// [`Ring`] connecting them (§2 "Coherence substrate (C2)").
pub struct CoherenceSubstrate {
    locals: Vec<LocalDirectory>,
    evicted: Vec<EvictedLineBuffer>,
    root: RootDirectory,
    memory: MainMemory,
    ring: Ring,
    total_tokens: u32,
}

/// Ring stop index for core `pid`'s local directory; the root always
/// takes the last stop.
fn local_stop(pid: Pid) -> usize {
    pid as usize
}

impl CoherenceSubstrate {
    pub fn new(config: &Config, num_cores: u32) -> Self {
        let total_tokens = config.directory.num_tokens;
        let locals = (0..num_cores)
            .map(|pid| {
                LocalDirectory::new(
                    pid as usize,
                    vec![pid],
                    config.directory.cache.cache_line_size,
                    config.directory.cache.associativity,
                    config.directory.cache.num_sets,
                    total_tokens,
                )
            })
            .collect();
        let evicted = (0..num_cores)
            .map(|_| EvictedLineBuffer::new((config.directory.cache.associativity.max(1) * 4) as usize))
            .collect();
        let root = RootDirectory::new(0, total_tokens, config.directory.cache.cache_line_size as usize, 0, 1, 0);
        let memory = MainMemory::new(config.directory.cache.cache_line_size as usize, 4, 4);
        // One ring stop per local directory, plus one for the root.
        let ring = Ring::new(num_cores as usize + 1, config.directory.cache.incoming_buffer_size as usize);

        Self { locals, evicted, root, memory, ring, total_tokens }
    }

    fn root_stop(&self) -> usize {
        self.ring.len() - 1
    }

    pub fn total_tokens(&self) -> u32 {
        self.total_tokens
    }

    /// One coherence-substrate cycle: pulls new misses and dirty
    /// write-backs out of every core's D-Cache, steps every local
    /// directory and the root, advances the ring one hop, and delivers
    /// any completed fills back to the D-Cache that asked for them.
    pub fn step(&mut self, cores: &mut [Core]) {
        self.issue_below(cores);

        for (i, local) in self.locals.iter_mut().enumerate() {
            local.step(&mut self.evicted[i]);
            for msg in local.drain_above_out() {
                self.ring.node_mut(local_stop(i as Pid)).send(msg);
            }
        }
        self.root.step(&mut self.memory);
        for msg in self.root.drain_out() {
            self.ring.node_mut(self.root_stop()).send(msg);
        }

        self.ring.step();

        let root_stop = self.root_stop();
        if let Some(msg) = self.ring.node_mut(root_stop).recv() {
            self.root.submit(msg);
        }
        for (i, local) in self.locals.iter_mut().enumerate() {
            if let Some(msg) = self.ring.node_mut(local_stop(i as Pid)).recv() {
                local.deliver_from_above(msg);
            }
        }

        self.deliver_below(cores);
    }

    /// Turns each core's fresh D-Cache misses into below-side
    /// `AcquireTokenData` traffic for that core's local directory (§4.3
    /// "D-Cache is a coherence client"). Dirty write-back dissemination
    /// is not driven from here: this D-Cache model tracks line identity
    /// and coherence state only, not real byte contents (Memory stage's
    /// documented non-goal), so there is no per-line dirty payload yet to
    /// disseminate — see `DESIGN.md`.
    fn issue_below(&mut self, cores: &mut [Core]) {
        for (pid, core) in cores.iter_mut().enumerate() {
            let mut pipeline = core.pipeline.borrow_mut();
            for address in pipeline.dcache.take_new_misses() {
                let mut msg = CoherenceMessage::new(MessageKind::AcquireTokenData, address, pid as Pid);
                msg.tokens_requested = self.total_tokens;
                self.locals[pid].submit_from_below(msg);
            }
        }
    }

    /// Delivers every local directory's below-side responses to the
    /// originating core's D-Cache, completing the fill that was waiting
    /// on that address.
    fn deliver_below(&mut self, cores: &mut [Core]) {
        for (pid, local) in self.locals.iter_mut().enumerate() {
            for msg in local.drain_below_out() {
                if msg.data_valid {
                    let mut pipeline = cores[pid].pipeline.borrow_mut();
                    pipeline.dcache.complete_coherent_fill(msg.address);
                }
            }
        }
    }

    pub fn local(&self, pid: Pid) -> &LocalDirectory {
        &self.locals[pid as usize]
    }

    pub fn root(&self) -> &RootDirectory {
        &self.root
    }

    /// Sum of tokens held anywhere in the substrate (directories and
    /// memory-pending write-backs) for `address`, excluding whatever a
    /// D-Cache itself might hold — used by the token-conservation tests
    /// (§8 property 2) alongside each D-Cache's own count.
    pub fn tokens_held(&self, address: Address) -> u32 {
        let locals: u32 = self.locals.iter().map(|l| l.tokens_held(address)).sum();
        locals + self.root.tokens_held(address)
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
    fn a_cold_miss_round_trips_through_root_and_memory() {
        let config = test_config();
        let mut substrate = CoherenceSubstrate::new(&config, 1);
        let network = crate::network::Network::new(1);
        let mut cores = vec![Core::new(0, &config, Box::new(TestIsa), vec![0], network.port_handle(0))];

        {
            let mut pipeline = cores[0].pipeline.borrow_mut();
            let dest = abi::regs::RegAddr::new(abi::regs::RegType::Integer, 3);
            assert_eq!(pipeline.dcache.read(0x1000, dest, false), crate::cache::dcache::AccessOutcome::Miss);
        }

        let mut filled = false;
        for _ in 0..20 {
            substrate.step(&mut cores);
            let mut pipeline = cores[0].pipeline.borrow_mut();
            if !pipeline.dcache.tick_fills().is_empty() {
                filled = true;
                break;
            }
        }
        assert!(filled, "a cold miss must eventually be satisfied by the root directory and memory");
    }
}
