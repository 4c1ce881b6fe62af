//! The five allocator sub-processes that turn a `create` into running
//! threads (§4.1, §4.2, §4.4), each a [`crate::sched::Process`] registered
//! independently with the core's [`crate::sched::Kernel`] so that, e.g., a
//! stalled `DoFamilyCreate` never blocks `DoThreadAllocate` from draining
//! an unrelated family's queue.
//!
//! All five share the core's family table, thread table, and register
//! files through a single [`CoreState`], the Rust analogue of the
//! `Processor&` back-reference every allocator sub-object in the original
//! holds; here it is one `Rc<RefCell<_>>` rather than five raw references
//! because several of these processes run in the same cooperative thread
//! and must see each other's *prior-cycle* commits, never a live borrow
//! across a `tick`.

pub mod bundle;
pub mod family_allocate;
pub mod family_create;
pub mod link_ingest;
pub mod thread_activation;
pub mod thread_allocate;

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use abi::ids::{Capability, CapabilitySource, Fid, Pid, Place};
use abi::regs::RegCounts;

use crate::family_table::{FamilyTable, LocalFid};
use crate::network::{NetworkPorts, SharedNetworkPort};
use crate::ra_unit::RaUnit;
use crate::register_file::RegisterFile;
use crate::thread_table::{ThreadTable, Tid};

/// A queued request to allocate a family slot, either for a local create
/// or as the tail end of a link message arriving from a previous core in
/// the place (§4.1 "DoFamilyAllocate").
#[derive(Clone, Debug)]
pub struct AllocRequest {
    pub place: Place,
    pub parent: Option<Fid>,
    pub capability: Capability,
    /// Register used to report the allocated `Fid` back to the requester,
    /// if this is a local (non-link) request.
    pub completion_reg: Option<abi::regs::RegAddr>,
    pub suspend_on_full: bool,
    /// `true` if this allocation must reserve the whole requested place or
    /// fail outright; `false` accepts the largest power-of-two subset
    /// actually available (§4.1 "DoAllocResponse... exact allocation").
    pub exact: bool,
    /// `true` for a request that must bind the core's single exclusive
    /// context, e.g. `DoBundle`'s `ALLOCATE_SINGLE` (§4.1 "indirect
    /// create... exclusive=true"). Routes the request to the exclusive
    /// queue and, once granted, holds `CoreState::exclusive_family` until
    /// that family is torn down (§3 "the exclusive context is held by at
    /// most one family at a time").
    pub exclusive: bool,
}

/// A queued request to broadcast a family's create information around its
/// place (§4.1 "DoFamilyCreate").
#[derive(Clone, Debug)]
pub struct CreateRequest {
    pub fid: LocalFid,
    pub entry_pc: u64,
    pub reg_counts: [RegCounts; 2],
    pub has_shareds: bool,
    pub physical_block_size: u32,
}

/// A thread context whose cleanup dependencies have all resolved and is
/// ready to be returned to the thread table's free list (§4.4
/// "DoThreadAllocate" cleanup phase).
#[derive(Clone, Debug)]
pub struct CleanupRequest {
    pub tid: Tid,
    pub fid: LocalFid,
}

/// Shared mutable state every allocator process and pipeline stage reads
/// or writes. Standing in for the `Processor&` that every MGSim component
/// holds a reference to; this crate is single-threaded so `Rc<RefCell<_>>`
/// gives the same "many readers, one cooperative writer per cycle"
/// discipline without `unsafe`.
pub struct CoreState {
    pub pid: Pid,
    pub families: FamilyTable,
    pub threads: ThreadTable,
    pub regs: RegisterFile,
    /// This core's link/delegate network port, shared with the grid's
    /// [`crate::network::Network`] so a `LinkAllocate`/`LinkCreate`/
    /// `AllocResponse` pushed here is visible to `Grid::step`'s hop
    /// without this core needing a reference to the whole `Network`
    /// (§4.1, §4.7).
    pub network: SharedNetworkPort,
    /// Deterministic per-core capability generator (§3 "Capability").
    pub cap_source: CapabilitySource,
    /// Correlates a group allocate's capability to the local family-table
    /// slot this core claimed for it. Populated when this core claims a
    /// slot during the `LinkAllocate` walk, consulted by the
    /// `AllocResponse` leg (which only carries the capability, not a
    /// core-local index) to find the entry to commit or unwind, and kept
    /// around afterward so the later `LinkCreate` broadcast can find the
    /// same slot by capability alone (§4.1 "DoAllocResponse",
    /// "DoFamilyCreate... BroadcastingCreate"). Removed only when the
    /// slot is released, whether by unwind or by eventual family
    /// teardown.
    pub pending_link_allocs: HashMap<Capability, LocalFid>,

    /// Block-grained register-region allocator, one per register type
    /// (§2 "RA Unit"), indexed by `RegType::index()`. A family's register
    /// window is reserved from here at `DoFamilyCreate::AllocatingRegisters`
    /// and returned once its last thread context is released (§3).
    pub ra_units: [RaUnit; 2],

    /// Three priority queues a create's `AllocRequest` is routed into by
    /// `CoreState::queue_alloc_request`, drained by `DoFamilyAllocate` in
    /// that order: exclusive (only while `exclusive_family` is free),
    /// non-suspending, suspending (§4.1 "DoFamilyAllocate", §6
    /// `FamilyAllocation{Suspend,NoSuspend,Exclusive}QueueSize`).
    pub alloc_queue_exclusive: VecDeque<AllocRequest>,
    pub alloc_queue_no_suspend: VecDeque<AllocRequest>,
    pub alloc_queue_suspend: VecDeque<AllocRequest>,
    /// The family currently holding this core's single exclusive context,
    /// if any; gates whether `DoFamilyAllocate` may service
    /// `alloc_queue_exclusive` (§3 "the exclusive context is held by at
    /// most one family at a time").
    pub exclusive_family: Option<LocalFid>,

    pub create_queue: VecDeque<CreateRequest>,
    pub cleanup_queue: VecDeque<CleanupRequest>,
    /// Families with an initial-allocation job still outstanding, in the
    /// order they should be serviced (§4.4 "DoThreadAllocate", `m_alloc`).
    pub families_pending_alloc: VecDeque<LocalFid>,
    /// Threads whose register windows have been assigned and are ready to
    /// be scheduled into the pipeline (§4.2 "DoThreadActivation").
    pub ready_queue: VecDeque<Tid>,
    /// Threads activation has admitted to the pipeline; Fetch pulls from
    /// here (§4.2, §4.5 "five-stage pipeline").
    pub active_queue: VecDeque<Tid>,
}

pub type SharedCore = Rc<RefCell<CoreState>>;

impl CoreState {
    /// Builds a core sharing a grid-wide network port, used by
    /// `Core::new` when wiring a real multi-core [`crate::grid::Grid`]
    /// (§4.7).
    #[allow(clippy::too_many_arguments)]
    pub fn new_with_network(
        pid: Pid,
        num_families: u32,
        num_threads: u32,
        num_int_registers: u32,
        num_flt_registers: u32,
        seed: u64,
        network: SharedNetworkPort,
    ) -> SharedCore {
        Rc::new(RefCell::new(Self {
            pid,
            families: FamilyTable::new(num_families),
            threads: ThreadTable::new(num_threads),
            regs: RegisterFile::new(num_int_registers, num_flt_registers),
            network,
            cap_source: CapabilitySource::new(seed ^ ((pid as u64) << 32 | pid as u64)),
            pending_link_allocs: HashMap::new(),
            ra_units: [RaUnit::new(num_int_registers), RaUnit::new(num_flt_registers)],
            alloc_queue_exclusive: VecDeque::new(),
            alloc_queue_no_suspend: VecDeque::new(),
            alloc_queue_suspend: VecDeque::new(),
            exclusive_family: None,
            create_queue: VecDeque::new(),
            cleanup_queue: VecDeque::new(),
            families_pending_alloc: VecDeque::new(),
            ready_queue: VecDeque::new(),
            active_queue: VecDeque::new(),
        }))
    }

    /// Builds a standalone core with a throwaway, unconnected network port
    /// — every allocator sub-process test in this module exercises one
    /// core in isolation and has no grid to forward link traffic to.
    pub fn new(
        pid: Pid,
        num_families: u32,
        num_threads: u32,
        num_int_registers: u32,
        num_flt_registers: u32,
    ) -> SharedCore {
        let network = Rc::new(RefCell::new(NetworkPorts::new(pid, 1)));
        Self::new_with_network(pid, num_families, num_threads, num_int_registers, num_flt_registers, 1, network)
    }

    /// Routes a queued allocate request into the correct priority queue
    /// (§4.1 "DoFamilyAllocate... exclusive, non-suspending, suspending").
    pub fn queue_alloc_request(&mut self, request: AllocRequest) {
        if request.exclusive {
            self.alloc_queue_exclusive.push_back(request);
        } else if request.suspend_on_full {
            self.alloc_queue_suspend.push_back(request);
        } else {
            self.alloc_queue_no_suspend.push_back(request);
        }
    }
}
