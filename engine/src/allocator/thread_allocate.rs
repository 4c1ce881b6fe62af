//! `DoThreadAllocate`: reclaims a terminated thread's register windows and
//! context, and, separately, hands a fresh register window to the next
//! thread of a family still being populated (§4.2, §4.4).
//!
//! Cleanup of an already-terminated thread always takes precedence over
//! allocating a brand-new one: a terminated thread is holding a context
//! and a register window that something else may be waiting for, so it
//! is drained from `cleanup_queue` first and `families_pending_alloc` is
//! only consulted once there is nothing left to clean up this cycle.

use ringbuf::Ringbuf;

use crate::allocator::{CleanupRequest, SharedCore};
use crate::family_table::FamilyDependency;
use crate::thread_table::{ContextType, Tid, INVALID_TID};

use crate::sched::{ProcResult, Process};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Trace {
    CleanedUp(Tid),
    Reactivated(Tid),
    AllocatedFresh(Tid),
    FamilyDoneAllocating,
    BothQueuesEmpty,
    NoFreeContext,
}

enum Staged {
    /// The cleaned-up thread's family had finished allocating: release the
    /// context for good and decrement the family's thread count.
    Released { tid: Tid, fid: u32, context: ContextType },
    /// The cleaned-up thread's family is still short of threads: recycle
    /// the same context immediately as the next fresh allocation.
    Reactivated { tid: Tid, fid: u32 },
    /// A brand-new context was popped for the next thread of a family
    /// still being populated.
    FreshAllocation { tid: Tid, fid: u32, context: ContextType },
    /// The family has as many threads as it will ever need; mark its
    /// create-side allocation as finished.
    AllocationDone { fid: u32 },
    /// The family is simply done (reached its target count or had its
    /// allocation marked done already); drop it from the alloc queue.
    FamilyDequeued,
}

pub struct DoThreadAllocate {
    core: SharedCore,
    staged: Option<Staged>,
    trace: Ringbuf<Trace, 24>,
}

impl DoThreadAllocate {
    pub fn new(core: SharedCore) -> Self {
        Self { core, staged: None, trace: Ringbuf::new() }
    }

    fn try_cleanup(&mut self) -> Option<ProcResult> {
        let mut core = self.core.borrow_mut();
        let CleanupRequest { tid, fid } = core.cleanup_queue.front()?.clone();

        let thread = core.threads.get(tid).clone();
        for reg_type in abi::regs::RegType::ALL {
            let idx = reg_type.index();
            let count = core.families.get(fid).regs[idx].count.shareds;
            if count > 0 {
                let window = if idx == 0 { &thread.regs } else { &thread.float_regs };
                core.regs.clear(reg_type, window.dependents, count as u32);
            }
        }

        let family_has_shareds = core.families.get(fid).has_shareds;
        let block_size = core.families.get(fid).physical_block_size;
        if family_has_shareds && block_size > 1 {
            if thread.next_in_block == INVALID_TID {
                core.families.get_mut(fid).prev_cleaned_up = true;
            } else {
                core.threads.get_mut(thread.next_in_block).dependencies.prev_cleaned_up = true;
            }
        }

        core.cleanup_queue.pop_front();

        let family = core.families.get(fid);
        if family.dependencies.allocation_done {
            let context = if family.is_exclusive && family.dependencies.num_threads_allocated == 1 {
                ContextType::Exclusive
            } else {
                ContextType::Normal
            };
            self.trace.entry(Trace::CleanedUp(tid));
            self.staged = Some(Staged::Released { tid, fid, context });
        } else {
            self.trace.entry(Trace::Reactivated(tid));
            self.staged = Some(Staged::Reactivated { tid, fid });
        }
        Some(ProcResult::Success)
    }

    fn try_allocate(&mut self) -> ProcResult {
        let mut core = self.core.borrow_mut();
        let Some(&fid) = core.alloc_queue_fids().front() else {
            self.trace.entry(Trace::BothQueuesEmpty);
            return ProcResult::Failed;
        };

        let family = core.families.get(fid);
        let num_allocated = family.dependencies.num_threads_allocated;
        let target = family.physical_block_size;
        let allocation_done = family.dependencies.allocation_done;

        if allocation_done {
            self.trace.entry(Trace::FamilyDoneAllocating);
            self.staged = Some(Staged::FamilyDequeued);
            return ProcResult::Success;
        }

        if num_allocated == target {
            self.staged = Some(Staged::AllocationDone { fid });
            return ProcResult::Success;
        }

        let exclusive = num_allocated == 0 && family.is_exclusive;
        let reserved = num_allocated == 0;
        let context = if exclusive {
            ContextType::Exclusive
        } else if reserved {
            ContextType::Reserved
        } else {
            ContextType::Normal
        };

        let Some(tid) = core.threads.pop_empty(context) else {
            self.trace.entry(Trace::NoFreeContext);
            return ProcResult::Failed;
        };

        self.trace.entry(Trace::AllocatedFresh(tid));
        self.staged = Some(Staged::FreshAllocation { tid, fid, context });
        ProcResult::Success
    }
}

impl Process for DoThreadAllocate {
    fn name(&self) -> &str {
        "DoThreadAllocate"
    }

    fn tick(&mut self) -> ProcResult {
        if let Some(result) = self.try_cleanup() {
            return result;
        }
        self.try_allocate()
    }

    fn commit(&mut self) {
        let Some(staged) = self.staged.take() else { return };
        let mut core = self.core.borrow_mut();
        match staged {
            Staged::Released { tid, fid, context } => {
                core.threads.push_empty(tid, context);
                // Mirrors `link_ingest::apply_outcome`'s unwind leg: once
                // this was the decrement that finally drained the family,
                // its slot goes back to the free list rather than sitting
                // in `Terminated` forever.
                if core.families.get_mut(fid).decrease_dependency(FamilyDependency::ThreadCount) {
                    // Drop the capability correlation `link_ingest` kept
                    // around for the `LinkCreate` broadcast; the slot is
                    // about to go back to the free list and must not answer
                    // to a stale capability afterward.
                    let capability = core.families.get(fid).capability;
                    core.pending_link_allocs.remove(&capability);
                    if core.exclusive_family == Some(fid) {
                        core.exclusive_family = None;
                    }
                    // Hand each register-type window this family reserved
                    // at `AllocatingRegisters` back to its `RaUnit` before
                    // the slot itself is freed (§2, §3).
                    let block_size = core.families.get(fid).physical_block_size.max(1);
                    for reg_type in abi::regs::RegType::ALL {
                        let idx = reg_type.index();
                        let info = core.families.get(fid).regs[idx];
                        core.ra_units[idx].release(info.base, info.count.total() * block_size);
                    }
                    core.families.release(fid);
                }
            }
            Staged::Reactivated { tid, fid } => {
                core.families.get_mut(fid).last_allocated = tid;
                core.ready_queue.push_back(tid);
            }
            Staged::FreshAllocation { tid, fid, .. } => {
                let family = core.families.get_mut(fid);
                family.dependencies.num_threads_allocated += 1;
                let prev = family.last_allocated;
                family.last_allocated = tid;
                if prev != INVALID_TID {
                    core.threads.get_mut(prev).next_in_block = tid;
                }
                core.threads.get_mut(tid).family = fid;
                core.ready_queue.push_back(tid);
            }
            Staged::AllocationDone { fid } => {
                core.families.get_mut(fid).decrease_dependency(FamilyDependency::AllocationDone);
                core.alloc_fid_queue_pop_front();
            }
            Staged::FamilyDequeued => {
                core.alloc_fid_queue_pop_front();
            }
        }
    }

    fn stall_reason(&self) -> String {
        match self.trace.last().map(|e| e.payload) {
            Some(Trace::NoFreeContext) => "no free thread context available".into(),
            Some(Trace::BothQueuesEmpty) => "cleanup and allocation queues both empty".into(),
            _ => "no reason recorded".into(),
        }
    }
}

impl crate::allocator::CoreState {
    fn alloc_queue_fids(&self) -> std::collections::VecDeque<u32> {
        // The allocator's per-family alloc queue is keyed by `LocalFid`; we
        // derive the live view from `families_pending_alloc` each call
        // rather than keeping a second source of truth.
        self.families_pending_alloc.clone()
    }

    fn alloc_fid_queue_pop_front(&mut self) {
        self.families_pending_alloc.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::CoreState;
    use crate::family_table::FamilyState;

    #[test]
    fn fresh_allocation_claims_reserved_context_for_first_thread() {
        let core = CoreState::new(0, 2, 4, 8, 8);
        let fid = core.borrow_mut().families.allocate().unwrap();
        {
            let mut c = core.borrow_mut();
            let family = c.families.get_mut(fid);
            family.physical_block_size = 2;
            family.state = FamilyState::Active;
            c.families_pending_alloc.push_back(fid);
        }

        let mut proc = DoThreadAllocate::new(core.clone());
        assert_eq!(proc.tick(), ProcResult::Success);
        proc.commit();

        let c = core.borrow();
        assert_eq!(c.families.get(fid).dependencies.num_threads_allocated, 1);
        assert_eq!(c.ready_queue.len(), 1);
    }

    #[test]
    fn cleanup_takes_precedence_over_fresh_allocation() {
        let core = CoreState::new(0, 2, 4, 8, 8);
        let fid = core.borrow_mut().families.allocate().unwrap();
        {
            let mut c = core.borrow_mut();
            let family = c.families.get_mut(fid);
            family.physical_block_size = 1;
            family.dependencies.num_threads_allocated = 1;
            family.dependencies.allocation_done = true;
            c.families_pending_alloc.push_back(fid);
            let tid = c.threads.pop_empty(ContextType::Normal).unwrap();
            c.threads.get_mut(tid).family = fid;
            c.cleanup_queue.push_back(CleanupRequest { tid, fid });
        }

        let mut proc = DoThreadAllocate::new(core.clone());
        assert_eq!(proc.tick(), ProcResult::Success);
        proc.commit();

        assert_eq!(core.borrow().families.get(fid).dependencies.num_threads_allocated, 0);
    }

    #[test]
    fn last_cleanup_of_an_active_family_releases_its_slot() {
        let core = CoreState::new(0, 2, 4, 8, 8);
        let fid = core.borrow_mut().families.allocate().unwrap();
        let families_free_before = core.borrow().families.num_free();
        {
            let mut c = core.borrow_mut();
            let family = c.families.get_mut(fid);
            family.state = FamilyState::Active;
            family.physical_block_size = 1;
            family.dependencies.num_threads_allocated = 1;
            family.dependencies.allocation_done = true;
            let tid = c.threads.pop_empty(ContextType::Normal).unwrap();
            c.threads.get_mut(tid).family = fid;
            c.cleanup_queue.push_back(CleanupRequest { tid, fid });
        }

        let mut proc = DoThreadAllocate::new(core.clone());
        assert_eq!(proc.tick(), ProcResult::Success);
        proc.commit();

        let c = core.borrow();
        assert_eq!(c.families.get(fid).state, FamilyState::Empty, "the slot is back on the free list");
        assert_eq!(c.families.num_free(), families_free_before + 1);
    }
}
