//! Per-core thread table: a fixed-size pool of thread contexts recycled
//! between families (§3 "Thread Table", §4.2).
//!
//! Threads progress `Empty -> Waiting -> Active -> Ready -> Running ->
//! {Waiting, Suspended, Terminated} -> Empty`. `Empty` contexts live on one
//! of three free lists, keyed by [`ContextType`], so that a reservation
//! made ahead of a create (`CONTEXT_RESERVED`) or an exclusive place's
//! single-threaded guarantee (`CONTEXT_EXCLUSIVE`) can never be stolen by
//! an ordinary allocation.

use std::collections::VecDeque;

use abi::ids::Pid;

pub type Tid = u32;
pub const INVALID_TID: Tid = u32::MAX;

/// Which free list an empty context belongs to (§4.2 "Context reservation").
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ContextType {
    Normal,
    Reserved,
    Exclusive,
}

impl ContextType {
    pub const ALL: [ContextType; 3] =
        [ContextType::Normal, ContextType::Reserved, ContextType::Exclusive];
}

/// A thread's lifecycle state (§4.2, §4.4).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ThreadState {
    Empty,
    Waiting,
    Active,
    Ready,
    Running,
    Suspended,
    Terminated,
}

/// Register window base indices for one register type (§4.2 "AllocateRegisters").
#[derive(Copy, Clone, Debug, Default)]
pub struct RegWindow {
    pub locals: u32,
    pub dependents: u32,
    pub shareds: u32,
}

/// Cleanup-ordering dependencies that must all clear before a terminated
/// thread's context can be recycled (§4.4 "DoThreadAllocate", ported from
/// `Thread::Dependencies`). A thread cannot be returned to its free list
/// merely by running to completion: out-of-order termination across a
/// group create means the thread after it in program order must wait for
/// it specifically, not just for "some" predecessor, or it could link to
/// the wrong thread when the family's `lastAllocated` pointer has already
/// moved on.
#[derive(Copy, Clone, Debug, Default)]
pub struct Dependencies {
    pub killed: bool,
    pub prev_cleaned_up: bool,
    pub num_pending_writes: u32,
}

impl Dependencies {
    pub fn resolved(&self) -> bool {
        self.killed && self.prev_cleaned_up && self.num_pending_writes == 0
    }
}

/// One thread context.
#[derive(Clone, Debug)]
pub struct Thread {
    pub pc: u64,
    pub regs: RegWindow,
    pub float_regs: RegWindow,
    pub dependencies: Dependencies,
    pub waiting_for_writes: bool,
    /// Next thread to be created within this core's contiguous block of
    /// the family, or `INVALID_TID` if this thread is the last allocated
    /// so far (§4.4's `nextInBlock`, used to wire up the linear thread
    /// chain as threads are allocated one at a time).
    pub next_in_block: Tid,
    pub core: Pid,
    pub family: u32,
    /// Free-list / ready-queue link, reused for whichever list currently
    /// owns this slot.
    pub next: Tid,
    pub state: ThreadState,
}

impl Thread {
    fn empty() -> Self {
        Self {
            pc: 0,
            regs: RegWindow::default(),
            float_regs: RegWindow::default(),
            dependencies: Dependencies::default(),
            waiting_for_writes: false,
            next_in_block: INVALID_TID,
            core: 0,
            family: 0,
            next: INVALID_TID,
            state: ThreadState::Empty,
        }
    }
}

/// The fixed-size thread pool and its three free lists.
pub struct ThreadTable {
    threads: Vec<Thread>,
    free: [VecDeque<Tid>; 3],
}

impl ThreadTable {
    /// Builds a table of `size` empty contexts, all initially on the
    /// `Normal` free list (§4.2: reservation narrows a subset of this pool
    /// rather than starting with separate pools).
    pub fn new(size: u32) -> Self {
        let threads = (0..size).map(|_| Thread::empty()).collect();
        let mut normal = VecDeque::with_capacity(size as usize);
        for tid in 0..size {
            normal.push_back(tid);
        }
        Self { threads, free: [normal, VecDeque::new(), VecDeque::new()] }
    }

    pub fn num_threads(&self) -> u32 {
        self.threads.len() as u32
    }

    pub fn get(&self, tid: Tid) -> &Thread {
        &self.threads[tid as usize]
    }

    pub fn get_mut(&mut self, tid: Tid) -> &mut Thread {
        &mut self.threads[tid as usize]
    }

    pub fn num_free(&self, context: ContextType) -> u32 {
        self.free[context as usize].len() as u32
    }

    /// Pops one empty context off `context`'s free list, if any (§4.2
    /// "PopEmpty").
    pub fn pop_empty(&mut self, context: ContextType) -> Option<Tid> {
        self.free[context as usize].pop_front()
    }

    /// Returns a terminated-and-cleaned-up context to `context`'s free
    /// list, resetting it to a blank slate (§4.2 "PushEmpty").
    pub fn push_empty(&mut self, tid: Tid, context: ContextType) {
        self.threads[tid as usize] = Thread::empty();
        self.free[context as usize].push_back(tid);
    }

    /// Moves one context from the `Normal` free list onto `Reserved`
    /// (§4.2 "ReserveThread"), called ahead of a create so a later
    /// allocation cannot claim the last free slot out from under it.
    pub fn reserve(&mut self) -> bool {
        match self.free[ContextType::Normal as usize].pop_front() {
            Some(tid) => {
                self.free[ContextType::Reserved as usize].push_back(tid);
                true
            }
            None => false,
        }
    }

    /// Undoes a reservation that turned out to be unneeded, returning the
    /// context to `Normal` (§4.2 "UnreserveThread").
    pub fn unreserve(&mut self) -> bool {
        match self.free[ContextType::Reserved as usize].pop_front() {
            Some(tid) => {
                self.free[ContextType::Normal as usize].push_back(tid);
                true
            }
            None => false,
        }
    }

    pub fn is_empty_pool(&self) -> bool {
        self.free.iter().all(|list| list.len() as u32 == self.threads.len() as u32 / 3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pop_and_push_round_trip() {
        let mut table = ThreadTable::new(4);
        let tid = table.pop_empty(ContextType::Normal).expect("should have free contexts");
        table.get_mut(tid).pc = 0x1000;
        assert_eq!(table.num_free(ContextType::Normal), 3);
        table.push_empty(tid, ContextType::Normal);
        assert_eq!(table.num_free(ContextType::Normal), 4);
        assert_eq!(table.get(tid).pc, 0);
    }

    #[test]
    fn reserve_moves_between_lists() {
        let mut table = ThreadTable::new(2);
        assert!(table.reserve());
        assert_eq!(table.num_free(ContextType::Normal), 1);
        assert_eq!(table.num_free(ContextType::Reserved), 1);
        assert!(table.unreserve());
        assert_eq!(table.num_free(ContextType::Normal), 2);
    }

    #[test]
    fn reserve_fails_when_normal_list_is_empty() {
        let mut table = ThreadTable::new(1);
        assert!(table.reserve());
        assert!(!table.reserve());
    }

    #[test]
    fn dependencies_resolved_requires_all_three() {
        let mut deps = Dependencies::default();
        assert!(!deps.resolved());
        deps.killed = true;
        deps.prev_cleaned_up = true;
        assert!(!deps.resolved());
        deps.num_pending_writes = 0;
        assert!(deps.resolved());
    }
}
