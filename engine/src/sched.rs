//! The two-phase cooperative scheduler kernel (§5).
//!
//! Every stateful component in the grid — pipeline stages, allocator
//! sub-processes, directories, ring nodes — registers one or more
//! [`Process`]es here. Each cycle runs in two phases: every process fires
//! once against the end-of-previous-cycle state, and only afterwards are
//! the staged commits from processes that succeeded replayed to produce the
//! new state. This is the direct analogue of the teacher's syscall
//! dispatch loop (`kern/src/syscalls.rs`'s `safe_syscall_entry`, which
//! computes a `NextTask` without mutating anything it hasn't validated)
//! generalized from "one entry point per syscall" to "many independent
//! processes per cycle."

use std::collections::HashMap;

use abi::error::StallReason;

/// The outcome of firing one [`Process`] for one cycle.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProcResult {
    /// The process made progress and its staged commits should be applied.
    Success,
    /// The process could not make progress this cycle (lost arbitration, a
    /// resource was unavailable, ...). None of its staged commits are
    /// applied, and the process is considered for the deadlock count.
    Failed,
    /// The process completed its work for now and will reactivate itself
    /// when some future event fires; like `Success`, its commits so far are
    /// applied, but it does not count as "stalled" for deadlock purposes.
    Delayed,
}

/// One independently-scheduled unit of behavior.
///
/// `tick` must not mutate any state observable to other processes before
/// returning; implementations stage their effects internally and apply them
/// from `commit`, which the kernel calls only for processes that returned
/// anything other than `Failed` (§5 "If a process returns FAILED, none of
/// its COMMIT effects are applied").
pub trait Process {
    /// A short, stable name used in deadlock dumps and tests.
    fn name(&self) -> &str;

    /// Attempt to make progress for the current cycle, observing only
    /// end-of-previous-cycle state.
    fn tick(&mut self) -> ProcResult;

    /// Apply whatever this process staged during the `tick` that just
    /// returned `Success` or `Delayed`. Called once per cycle, after every
    /// process's `tick` has run, in priority order.
    fn commit(&mut self) {}

    /// A short, human-readable explanation of why the last `tick` returned
    /// `Failed`, used to build the §5 deadlock dump. Implementations are
    /// expected to keep this updated via their own `ringbuf` trace rather
    /// than recomputing it here.
    fn stall_reason(&self) -> String {
        String::from("no reason recorded")
    }
}

/// Outcome of stepping the grid for some number of cycles (§6 "Stepping").
#[derive(Debug)]
pub enum StepOutcome {
    /// The requested number of cycles elapsed with no terminal condition.
    Idle,
    /// Every registered process returned `Failed` for one full cycle.
    Deadlock { cycle: u64, stalls: Vec<StallReason> },
    /// A breakpoint address was hit (reported by a collaborator outside
    /// this crate; the kernel itself never raises this on its own).
    Breakpoint,
    /// The simulated program exited with the given code.
    ProgramExit(i64),
}

/// Runs the registered processes of a single grid for some number of
/// cycles, applying the two-phase commit discipline of §5.
pub struct Kernel {
    processes: Vec<Box<dyn Process>>,
    cycle: u64,
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    pub fn new() -> Self {
        Self { processes: Vec::new(), cycle: 0 }
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Registers a process. Registration order is the process's priority
    /// for `commit` ordering and, implicitly, for any storage this process
    /// happens to be first to claim this cycle (§5's "fixed priority list
    /// of processes").
    pub fn register(&mut self, process: Box<dyn Process>) {
        self.processes.push(process);
    }

    /// Runs exactly one cycle, returning whether every process stalled.
    pub fn run_cycle(&mut self) -> StepOutcome {
        let mut results = Vec::with_capacity(self.processes.len());
        for process in &mut self.processes {
            results.push(process.tick());
        }

        let all_failed = results.iter().all(|r| *r == ProcResult::Failed);

        for (process, result) in self.processes.iter_mut().zip(results.iter()) {
            if *result != ProcResult::Failed {
                process.commit();
            }
        }

        self.cycle += 1;

        if all_failed && !self.processes.is_empty() {
            let stalls = self
                .processes
                .iter()
                .map(|p| StallReason { process: p.name().to_string(), reason: p.stall_reason() })
                .collect();
            return StepOutcome::Deadlock { cycle: self.cycle, stalls };
        }

        StepOutcome::Idle
    }

    /// Runs up to `n_cycles`, stopping early on deadlock.
    pub fn run(&mut self, n_cycles: u64) -> StepOutcome {
        for _ in 0..n_cycles {
            match self.run_cycle() {
                StepOutcome::Idle => continue,
                other => return other,
            }
        }
        StepOutcome::Idle
    }
}

/// A storage element written by more than one process in a given cycle
/// needs an arbitrator: a fixed priority list of the processes allowed to
/// write it, consulted in order until one of them actually wants the
/// write this cycle (§5 "Arbitration").
pub struct Arbiter<K> {
    priority: HashMap<K, Vec<String>>,
}

impl<K: std::hash::Hash + Eq> Default for Arbiter<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: std::hash::Hash + Eq> Arbiter<K> {
    pub fn new() -> Self {
        Self { priority: HashMap::new() }
    }

    /// Declares that, for storage `key`, processes should be tried for the
    /// write port in the given order.
    pub fn set_priority(&mut self, key: K, processes: Vec<String>) {
        self.priority.insert(key, processes);
    }

    /// Returns `true` if `requester` is allowed to win the write port for
    /// `key` given the set of processes that also want it this cycle.
    pub fn wins(&self, key: &K, requester: &str, contenders: &[String]) -> bool {
        match self.priority.get(key) {
            None => true,
            Some(order) => {
                for candidate in order {
                    if contenders.iter().any(|c| c == candidate) {
                        return candidate == requester;
                    }
                }
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysFail(&'static str);
    impl Process for AlwaysFail {
        fn name(&self) -> &str { self.0 }
        fn tick(&mut self) -> ProcResult { ProcResult::Failed }
        fn stall_reason(&self) -> String { "always fails".into() }
    }

    struct CountUp {
        count: u32,
        staged: u32,
    }
    impl Process for CountUp {
        fn name(&self) -> &str { "count-up" }
        fn tick(&mut self) -> ProcResult {
            self.staged = self.count + 1;
            ProcResult::Success
        }
        fn commit(&mut self) {
            self.count = self.staged;
        }
    }

    #[test]
    fn deadlock_detected_when_all_processes_fail() {
        let mut k = Kernel::new();
        k.register(Box::new(AlwaysFail("p1")));
        k.register(Box::new(AlwaysFail("p2")));
        match k.run_cycle() {
            StepOutcome::Deadlock { stalls, .. } => assert_eq!(stalls.len(), 2),
            other => panic!("expected deadlock, got {other:?}"),
        }
    }

    #[test]
    fn failed_process_does_not_block_progress_of_others() {
        let mut k = Kernel::new();
        k.register(Box::new(AlwaysFail("stuck")));
        k.register(Box::new(CountUp { count: 0, staged: 0 }));
        // Not a deadlock: one process still makes progress.
        match k.run_cycle() {
            StepOutcome::Idle => {}
            other => panic!("expected idle progress, got {other:?}"),
        }
    }

    #[test]
    fn arbiter_respects_priority_order() {
        let mut arb: Arbiter<u32> = Arbiter::new();
        arb.set_priority(1, vec!["high".into(), "low".into()]);
        let contenders = vec!["high".to_string(), "low".to_string()];
        assert!(arb.wins(&1, "high", &contenders));
        assert!(!arb.wins(&1, "low", &contenders));
    }
}
