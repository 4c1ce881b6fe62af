//! Per-core family table: the control blocks that drive thread creation
//! for one family on one core (§3 "Family table", §4.1, §4.4).
//!
//! A family's lifecycle is `Empty -> CreateQueued -> Creating -> Active ->
//! Terminated -> Empty`. While `Active` it tracks how many of its threads'
//! register windows have been claimed so far (`num_threads_allocated`),
//! whether the create broadcast has finished reaching every core in the
//! place (`allocation_done`), and the chain of decrementing dependency
//! counters that together decide when the family may be torn down
//! (`DecreaseFamilyDependency` in the original).

use abi::ids::{Capability, Fid, Pid, Place};
use abi::regs::{RegAddr, RegCounts};

use crate::thread_table::{Tid, INVALID_TID};

/// Where to deliver a `sync` that arrived before the family it is waiting
/// on has satisfied its dependencies (§3 "Family... sync continuation
/// {pid, reg} for remote waiters").
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SyncContinuation {
    pub pid: Pid,
    pub reg: RegAddr,
}

pub type LocalFid = u32;

/// A family's lifecycle state (§4.1).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FamilyState {
    Empty,
    CreateQueued,
    Creating,
    Active,
    Terminated,
}

/// The dependency counters that gate a family's teardown (§4.4
/// "DecreaseFamilyDependency"). A family cannot be recycled until every
/// counter here has reached its terminal value; `FAMDEP_THREAD_COUNT` is
/// the field most pipeline processes touch, but sync and detach also hold
/// a reference until their respective events fire.
#[derive(Copy, Clone, Debug, Default)]
pub struct FamilyDependencies {
    pub num_threads_allocated: u32,
    pub num_pending_reads: u32,
    pub allocation_done: bool,
    pub prev_synchronized: bool,
    pub sync_sent: bool,
    pub detached: bool,
}

/// Which counter a caller is decrementing (§4.4's `FAMDEP_*` constants).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FamilyDependency {
    ThreadCount,
    OutstandingReads,
    PrevSynchronized,
    AllocationDone,
    SyncSent,
    Detached,
}

/// Per-register-type window base and per-thread sizing, mirroring
/// `Thread::RegInfo` but held at the family level since every thread in
/// the family shares the same shared/local counts (§4.2).
#[derive(Copy, Clone, Debug, Default)]
pub struct FamilyRegInfo {
    pub base: u32,
    pub count: RegCounts,
}

/// One family control block.
#[derive(Clone, Debug)]
pub struct FamilyEntry {
    pub state: FamilyState,
    pub parent: Option<Fid>,
    pub place: Place,
    pub capability: Capability,
    pub entry_pc: u64,
    pub regs: [FamilyRegInfo; 2],
    pub has_shareds: bool,
    pub physical_block_size: u32,
    pub is_exclusive: bool,
    pub dependencies: FamilyDependencies,
    /// Last thread context allocated so far, or `INVALID_TID` if none yet
    /// (§4.4 "lastAllocated", used to link a newly-allocated thread onto
    /// the end of the family's local chain).
    pub last_allocated: Tid,
    /// `true` once the immediately preceding thread in program order has
    /// finished cleanup; threads allocate in strict order across a create
    /// so that out-of-order termination can never scramble the chain
    /// (§4.4, ThreadTable.h `prevCleanedUp`).
    pub prev_cleaned_up: bool,
    /// Number of cores this family was actually granted, filled in by the
    /// `AllocResponse` commit leg (§3 "Family... number of cores in its
    /// place"). `0` until that commit lands.
    pub num_cores: u32,
    /// This family's FID on the next core in its place, or `None` if this
    /// is the last (or only) core (§3 "Family... link FID on the next
    /// core in the place").
    pub link_fid: Option<Fid>,
    /// Where to deliver a `sync` for this family that arrives on a remote
    /// core before the family has finished (§3 "sync continuation").
    pub sync_continuation: Option<SyncContinuation>,
    /// Set when an exact group allocate could not claim the full place;
    /// `sync` on a broken family still returns, but reports the failure
    /// (§3 "Family... broken flag").
    pub broken: bool,
}

impl FamilyEntry {
    fn empty() -> Self {
        Self {
            state: FamilyState::Empty,
            parent: None,
            place: Place::single(0),
            capability: Capability::INVALID,
            entry_pc: 0,
            regs: [FamilyRegInfo::default(); 2],
            has_shareds: false,
            physical_block_size: 0,
            is_exclusive: false,
            dependencies: FamilyDependencies::default(),
            last_allocated: INVALID_TID,
            prev_cleaned_up: true,
            num_cores: 0,
            link_fid: None,
            sync_continuation: None,
            broken: false,
        }
    }

    /// Applies one dependency decrement, returning `true` if this was the
    /// transition that finally terminates the family (§4.4).
    pub fn decrease_dependency(&mut self, dep: FamilyDependency) -> bool {
        match dep {
            FamilyDependency::ThreadCount => {
                debug_assert!(self.dependencies.num_threads_allocated > 0);
                self.dependencies.num_threads_allocated -= 1;
            }
            FamilyDependency::OutstandingReads => {
                debug_assert!(self.dependencies.num_pending_reads > 0);
                self.dependencies.num_pending_reads -= 1;
            }
            FamilyDependency::PrevSynchronized => {
                debug_assert!(!self.dependencies.prev_synchronized);
                self.dependencies.prev_synchronized = true;
            }
            FamilyDependency::AllocationDone => {
                debug_assert!(!self.dependencies.allocation_done);
                self.dependencies.allocation_done = true;
            }
            FamilyDependency::SyncSent => {
                debug_assert!(!self.dependencies.sync_sent);
                self.dependencies.sync_sent = true;
            }
            FamilyDependency::Detached => {
                debug_assert!(!self.dependencies.detached);
                self.dependencies.detached = true;
            }
        }

        let drained = self.dependencies.num_threads_allocated == 0 && self.dependencies.allocation_done;
        if drained
            && matches!(
                dep,
                FamilyDependency::ThreadCount | FamilyDependency::AllocationDone
            )
            && self.state == FamilyState::Active
        {
            self.state = FamilyState::Terminated;
            return true;
        }
        false
    }
}

/// The fixed-size family pool for one core, with a simple free list since
/// families (unlike threads) do not need the reserved/exclusive split.
pub struct FamilyTable {
    families: Vec<FamilyEntry>,
    free: Vec<LocalFid>,
}

impl FamilyTable {
    pub fn new(size: u32) -> Self {
        let families = (0..size).map(|_| FamilyEntry::empty()).collect();
        let free = (0..size).rev().collect();
        Self { families, free }
    }

    pub fn num_families(&self) -> u32 {
        self.families.len() as u32
    }

    pub fn get(&self, fid: LocalFid) -> &FamilyEntry {
        &self.families[fid as usize]
    }

    pub fn get_mut(&mut self, fid: LocalFid) -> &mut FamilyEntry {
        &mut self.families[fid as usize]
    }

    pub fn num_free(&self) -> u32 {
        self.free.len() as u32
    }

    pub fn allocate(&mut self) -> Option<LocalFid> {
        let fid = self.free.pop()?;
        self.families[fid as usize].state = FamilyState::CreateQueued;
        Some(fid)
    }

    pub fn release(&mut self, fid: LocalFid) {
        self.families[fid as usize] = FamilyEntry::empty();
        self.free.push(fid);
    }

    pub fn core_of(&self, _fid: LocalFid, this_core: Pid) -> Pid {
        this_core
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_release_round_trip() {
        let mut table = FamilyTable::new(4);
        let fid = table.allocate().expect("should allocate");
        assert_eq!(table.get(fid).state, FamilyState::CreateQueued);
        assert_eq!(table.num_free(), 3);
        table.release(fid);
        assert_eq!(table.num_free(), 4);
        assert_eq!(table.get(fid).state, FamilyState::Empty);
    }

    #[test]
    fn family_terminates_when_threads_and_allocation_drain() {
        let mut entry = FamilyEntry::empty();
        entry.state = FamilyState::Active;
        entry.dependencies.num_threads_allocated = 1;
        assert!(!entry.decrease_dependency(FamilyDependency::ThreadCount));
        assert!(entry.decrease_dependency(FamilyDependency::AllocationDone));
        assert_eq!(entry.state, FamilyState::Terminated);
    }

    #[test]
    fn family_does_not_terminate_while_threads_remain() {
        let mut entry = FamilyEntry::empty();
        entry.state = FamilyState::Active;
        entry.dependencies.num_threads_allocated = 2;
        entry.dependencies.allocation_done = true;
        assert!(!entry.decrease_dependency(FamilyDependency::ThreadCount));
        assert_eq!(entry.state, FamilyState::Active);
    }
}
