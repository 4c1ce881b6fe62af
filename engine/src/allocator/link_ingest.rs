//! Drains this core's incoming link-plane traffic and turns it into local
//! effects: a `LinkAllocate` forward hop claims (or fails to claim) a
//! family-table slot and forwards onward; an `AllocResponse` backward hop
//! commits or unwinds the slot this core provisionally claimed (§4.1
//! "DoFamilyAllocate", "DoAllocResponse").
//!
//! The original splits this across two methods on the same object
//! (`DoFamilyAllocate` for the outward leg, `DoAllocResponse` for the
//! return leg); here they are one `Process` because both legs consume the
//! same single incoming queue and a core can only usefully act on one
//! queued link message per cycle regardless of which leg it belongs to.

use ringbuf::Ringbuf;

use abi::ids::Fid;
use abi::message::{AllocOutcome, LinkPayload, MessageKind, MessagePayload};

use crate::allocator::SharedCore;
use crate::family_table::{FamilyRegInfo, FamilyState, LocalFid};
use crate::network::make_link_message;
use crate::sched::{ProcResult, Process};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Trace {
    NoTraffic,
    ForwardedAllocate,
    AllocateFailedLocally,
    StartedResponse,
    Committed(u32),
    Unwound,
    AppliedCreate,
    Ignored,
}

enum Staged {
    /// Claim succeeded (or failed); forward the outward leg to the next
    /// core with the updated bookkeeping.
    ForwardAllocate { payload: LinkPayload, claimed: bool, local_fid: Option<u32> },
    /// This core is the last on the outward leg: decide the final outcome
    /// and start walking the response back toward the origin.
    /// `self_claim` is this core's own claimed slot (if any) and whether
    /// it survives the outcome, since this core will never receive its
    /// own `AllocResponse` hop to apply that decision for it.
    StartResponse { payload: LinkPayload, outcome: AllocOutcome, self_claim: Option<(u32, bool)> },
    /// Apply a commit/unwind to the entry this core provisionally
    /// claimed, then forward the response onward unless this was the
    /// last hop.
    ApplyResponse { payload: LinkPayload, is_origin: bool },
    /// Populate the family slot this core claimed during the earlier
    /// `LinkAllocate` walk with the broadcast register-count header, then
    /// forward the hop onward unless this core is the last to need it
    /// (§4.1 "DoFamilyCreate... BroadcastingCreate").
    ApplyCreate { payload: LinkPayload, local_fid: Option<LocalFid> },
    /// Nothing of interest arrived; drop the message (e.g. coherence
    /// traffic misrouted onto the link queue in a test).
    Drop,
}

pub struct LinkIngest {
    core: SharedCore,
    staged: Option<Staged>,
    trace: Ringbuf<Trace, 24>,
}

impl LinkIngest {
    pub fn new(core: SharedCore) -> Self {
        Self { core, staged: None, trace: Ringbuf::new() }
    }
}

/// Largest power of two `<= n`, with `po2(0) == 0` since an allocation
/// that claimed no cores at all has nothing to round down to (§8
/// "A non-exact allocate of size s returns a power-of-two <= s").
fn largest_po2_le(n: u32) -> u32 {
    if n == 0 {
        0
    } else {
        1 << (31 - n.leading_zeros())
    }
}

impl Process for LinkIngest {
    fn name(&self) -> &str {
        "LinkIngest"
    }

    fn tick(&mut self) -> ProcResult {
        let mut core = self.core.borrow_mut();
        let Some(msg) = core.network.borrow_mut().incoming.pop_front() else {
            self.trace.entry(Trace::NoTraffic);
            return ProcResult::Failed;
        };
        let pid = core.pid;

        let payload = match &msg.extra {
            MessagePayload::Link(p) => p.clone(),
            _ => {
                self.trace.entry(Trace::Ignored);
                self.staged = Some(Staged::Drop);
                return ProcResult::Success;
            }
        };

        match msg.kind {
            MessageKind::LinkAllocate => {
                let claimed_fid = core.families.allocate();
                let claimed = claimed_fid.is_some();
                if claimed {
                    self.trace.entry(Trace::ForwardedAllocate);
                } else {
                    self.trace.entry(Trace::AllocateFailedLocally);
                }

                let is_last_hop = payload.remaining == 1;
                if !is_last_hop {
                    self.staged = Some(Staged::ForwardAllocate { payload, claimed, local_fid: claimed_fid });
                    return ProcResult::Success;
                }

                let allocated_count = payload.allocated_count + if claimed { 1 } else { 0 };
                let outcome = if payload.exact {
                    if claimed && allocated_count == payload.total_size {
                        AllocOutcome::Commit { num_cores: payload.total_size }
                    } else {
                        AllocOutcome::Unwind
                    }
                } else {
                    let granted = largest_po2_le(allocated_count);
                    if granted == 0 {
                        AllocOutcome::Unwind
                    } else {
                        AllocOutcome::Commit { num_cores: granted }
                    }
                };

                // `allocated_count` is this core's 1-indexed position along
                // the path (it is the `total_size`-th core visited, so its
                // own ordinal is `allocated_count`), used to decide locally
                // whether this core's own slot survives a non-exact
                // power-of-two truncation.
                let self_claim = claimed_fid.map(|fid| {
                    let survives = match outcome {
                        AllocOutcome::Commit { num_cores } => allocated_count <= num_cores,
                        AllocOutcome::Unwind => false,
                    };
                    (fid, survives)
                });

                self.staged = Some(Staged::StartResponse { payload, outcome, self_claim });
                ProcResult::Success
            }
            MessageKind::AllocResponse => {
                let is_origin = payload.first_fid.pid() == pid;
                self.staged = Some(Staged::ApplyResponse { payload, is_origin });
                ProcResult::Success
            }
            MessageKind::LinkCreate => {
                let local_fid = core.pending_link_allocs.get(&payload.capability).copied();
                self.trace.entry(Trace::AppliedCreate);
                self.staged = Some(Staged::ApplyCreate { payload, local_fid });
                ProcResult::Success
            }
            _ => {
                self.trace.entry(Trace::Ignored);
                self.staged = Some(Staged::Drop);
                ProcResult::Success
            }
        }
    }

    fn commit(&mut self) {
        let Some(staged) = self.staged.take() else { return };
        let mut core = self.core.borrow_mut();
        let pid = core.pid;

        match staged {
            Staged::Drop => {}

            Staged::ForwardAllocate { mut payload, claimed, local_fid } => {
                if let Some(fid) = local_fid {
                    core.pending_link_allocs.insert(payload.capability, fid);
                }
                payload.allocated_count += if claimed { 1 } else { 0 };
                payload.prev_fid = match local_fid {
                    Some(fid) => Fid::pack(pid, fid, payload.capability),
                    None => payload.prev_fid,
                };
                payload.remaining -= 1;
                let msg = make_link_message(MessageKind::LinkAllocate, 0, pid, payload);
                core.network.borrow_mut().outgoing.push_back(msg);
            }

            Staged::StartResponse { mut payload, outcome } => {
                apply_outcome(&mut core, pid, payload.capability, outcome);
                self.trace.entry(match outcome {
                    AllocOutcome::Commit { num_cores } => Trace::Committed(num_cores),
                    AllocOutcome::Unwind => Trace::Unwound,
                });
                self.trace.entry(Trace::StartedResponse);

                payload.outcome = Some(outcome);
                payload.remaining = payload.total_size - 1;
                if payload.remaining > 0 {
                    let msg = make_link_message(MessageKind::AllocResponse, 0, pid, payload);
                    core.network.borrow_mut().outgoing.push_back(msg);
                }
            }

            Staged::ApplyResponse { mut payload, is_origin } => {
                let outcome = payload.outcome.expect("AllocResponse always carries an outcome");
                apply_outcome(&mut core, pid, payload.capability, outcome);
                self.trace.entry(match outcome {
                    AllocOutcome::Commit { num_cores } => Trace::Committed(num_cores),
                    AllocOutcome::Unwind => Trace::Unwound,
                });

                if is_origin {
                    if let Some(reg) = payload.completion_reg {
                        let fid = match outcome {
                            AllocOutcome::Commit { .. } => payload.first_fid,
                            AllocOutcome::Unwind => Fid::INVALID,
                        };
                        core.regs.write(reg, fid.0);
                    }
                }

                payload.remaining -= 1;
                if payload.remaining > 0 {
                    let msg = make_link_message(MessageKind::AllocResponse, 0, pid, payload);
                    core.network.borrow_mut().outgoing.push_back(msg);
                }
            }

            Staged::ApplyCreate { mut payload, local_fid } => {
                if let (Some(fid), Some(spec)) = (local_fid, &payload.create) {
                    let block_size = spec.physical_block_size.max(1);
                    // Same RA Unit reservation `DoFamilyCreate::AllocatingRegisters`
                    // does on the origin core; a remote core applying a
                    // broadcast `LinkCreate` must carve its own window out of
                    // its own RA Units rather than assuming index 0 is free
                    // (§2, §3 — two families on this core must never overlap).
                    let int_base =
                        core.ra_units[0].allocate(spec.reg_counts[0].total() * block_size).unwrap_or(0);
                    let flt_base =
                        core.ra_units[1].allocate(spec.reg_counts[1].total() * block_size).unwrap_or(0);
                    let entry = core.families.get_mut(fid);
                    entry.has_shareds = spec.has_shareds;
                    entry.physical_block_size = spec.physical_block_size;
                    entry.entry_pc = spec.entry_pc;
                    entry.regs = [
                        FamilyRegInfo { base: int_base, count: spec.reg_counts[0] },
                        FamilyRegInfo { base: flt_base, count: spec.reg_counts[1] },
                    ];
                    entry.state = FamilyState::Active;
                    entry.dependencies.allocation_done = false;
                    core.families_pending_alloc.push_back(fid);
                }

                payload.remaining -= 1;
                if payload.remaining > 0 {
                    payload.allocated_count += 1;
                    let msg = make_link_message(MessageKind::LinkCreate, 0, pid, payload);
                    core.network.borrow_mut().outgoing.push_back(msg);
                }
            }
        }
    }

    fn stall_reason(&self) -> String {
        "no link traffic pending".into()
    }
}

/// Applies the commit/unwind outcome to whichever family slot this core
/// provisionally claimed for `capability`. A commit deliberately leaves the
/// capability-to-slot correlation in place: the later `LinkCreate`
/// broadcast needs to find the very same slot by capability alone, since
/// it carries no core-local index (§4.1 "DoAllocResponse",
/// "DoFamilyCreate... BroadcastingCreate"). An unwind has no further use
/// for the slot, so it frees both the slot and the correlation.
fn apply_outcome(
    core: &mut crate::allocator::CoreState,
    pid: abi::ids::Pid,
    capability: abi::ids::Capability,
    outcome: AllocOutcome,
) {
    match outcome {
        AllocOutcome::Commit { num_cores } => {
            let Some(&local_fid) = core.pending_link_allocs.get(&capability) else {
                return;
            };
            let entry = core.families.get_mut(local_fid);
            entry.num_cores = num_cores;
            entry.is_exclusive = num_cores == 1;
            let _ = pid;
        }
        AllocOutcome::Unwind => {
            if let Some(local_fid) = core.pending_link_allocs.remove(&capability) {
                core.families.release(local_fid);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{AllocRequest, CoreState};
    use crate::allocator::family_allocate::DoFamilyAllocate;
    use crate::network::Network;
    use abi::ids::{Capability, Place};
    use abi::regs::{RegAddr, RegType};

    fn wire_ring(num_cores: u32, sizes: &[u32]) -> (Network, Vec<SharedCoreForTest>) {
        let net = Network::new(num_cores);
        // 32 registers per type per core leaves enough room for the
        // broadcast test's RegCounts{1,2,3} window at physical_block_size 4
        // (6 regs/thread * 4 threads = 24) without the RA Unit stalling it.
        let cores = (0..num_cores)
            .map(|pid| {
                CoreState::new_with_network(pid, sizes[pid as usize], 8, 32, 32, 1, net.port_handle(pid))
            })
            .collect();
        (net, cores)
    }

    type SharedCoreForTest = crate::allocator::SharedCore;

    #[test]
    fn group_allocate_of_full_ring_commits_every_core() {
        let (mut net, cores) = wire_ring(4, &[2, 2, 2, 2]);
        let reg = RegAddr::new(RegType::Integer, 0);
        cores[0].borrow_mut().queue_alloc_request(AllocRequest {
            place: Place { pid: 0, size: 4, capability: Capability::INVALID },
            parent: None,
            capability: Capability::INVALID,
            completion_reg: Some(reg),
            suspend_on_full: false,
            exact: true,
            exclusive: false,
        });

        let mut allocators: Vec<_> = cores.iter().cloned().map(DoFamilyAllocate::new).collect();
        let mut ingests: Vec<_> = cores.iter().cloned().map(LinkIngest::new).collect();

        for _ in 0..20 {
            for a in allocators.iter_mut() {
                if a.tick() != ProcResult::Failed {
                    a.commit();
                }
            }
            for i in ingests.iter_mut() {
                if i.tick() != ProcResult::Failed {
                    i.commit();
                }
            }
            net.step(64);
        }

        match cores[0].borrow().regs.read(reg) {
            crate::register_file::RegValue::Full(bits) => {
                let fid = Fid(*bits);
                assert_ne!(fid, Fid::INVALID);
                assert_eq!(fid.pid(), 0);
            }
            other => panic!("expected Full register, got {other:?}"),
        }
        for core in &cores {
            assert_eq!(core.borrow().families.num_free(), sizes_free(&core));
        }
    }

    fn sizes_free(core: &SharedCoreForTest) -> u32 {
        // Every table in this test started with enough slots that exactly
        // one should remain claimed (committed) after the walk.
        core.borrow().families.num_families() - 1
    }

    #[test]
    fn exact_allocate_larger_than_the_place_unwinds_every_core() {
        let (mut net, cores) = wire_ring(4, &[1, 1, 1, 1]);
        let reg = RegAddr::new(RegType::Integer, 0);
        // Only 4 cores exist; asking for an exact place of 8 can never be
        // satisfied by any of them (§8 S6 "exact allocate failure"), so
        // model it here as an exact request whose last core deliberately
        // has no free slot, forcing the unwind path end to end.
        cores[3].borrow_mut().families.allocate();
        cores[0].borrow_mut().queue_alloc_request(AllocRequest {
            place: Place { pid: 0, size: 4, capability: Capability::INVALID },
            parent: None,
            capability: Capability::INVALID,
            completion_reg: Some(reg),
            suspend_on_full: false,
            exact: true,
            exclusive: false,
        });

        let mut allocators: Vec<_> = cores.iter().cloned().map(DoFamilyAllocate::new).collect();
        let mut ingests: Vec<_> = cores.iter().cloned().map(LinkIngest::new).collect();

        for _ in 0..20 {
            for a in allocators.iter_mut() {
                if a.tick() != ProcResult::Failed {
                    a.commit();
                }
            }
            for i in ingests.iter_mut() {
                if i.tick() != ProcResult::Failed {
                    i.commit();
                }
            }
            net.step(64);
        }

        match cores[0].borrow().regs.read(reg) {
            crate::register_file::RegValue::Full(bits) => assert_eq!(Fid(*bits), Fid::INVALID),
            other => panic!("expected Full register, got {other:?}"),
        }
        // Every slot this walk claimed must have been released again.
        assert_eq!(cores[0].borrow().families.num_free(), 1);
        assert_eq!(cores[1].borrow().families.num_free(), 1);
        assert_eq!(cores[2].borrow().families.num_free(), 1);
    }

    /// S2: once a group allocate has committed a family slot on every core
    /// of a 4-core place, queuing a create on the origin core alone must
    /// still populate every other core's slot with the broadcast register
    /// header and hand it to `DoThreadAllocate` (§4.1 "DoFamilyCreate...
    /// BroadcastingCreate... when numCores reaches one, clears the link on
    /// the originating core").
    #[test]
    fn link_create_broadcasts_register_header_to_every_core_in_the_place() {
        use crate::allocator::family_create::DoFamilyCreate;
        use crate::allocator::CreateRequest;
        use crate::cache::dcache::DCache;
        use crate::cache::icache::ICache;
        use crate::family_table::FamilyState;
        use crate::pipeline::{isa::TestIsa, PipelineState};
        use abi::regs::RegCounts;

        let (mut net, cores) = wire_ring(4, &[2, 2, 2, 2]);
        let reg = RegAddr::new(RegType::Integer, 0);
        cores[0].borrow_mut().queue_alloc_request(AllocRequest {
            place: Place { pid: 0, size: 4, capability: Capability::INVALID },
            parent: None,
            capability: Capability::INVALID,
            completion_reg: Some(reg),
            suspend_on_full: false,
            exact: true,
            exclusive: false,
        });

        let mut allocators: Vec<_> = cores.iter().cloned().map(DoFamilyAllocate::new).collect();
        let mut ingests: Vec<_> = cores.iter().cloned().map(LinkIngest::new).collect();
        for _ in 0..20 {
            for a in allocators.iter_mut() {
                if a.tick() != ProcResult::Failed {
                    a.commit();
                }
            }
            for i in ingests.iter_mut() {
                if i.tick() != ProcResult::Failed {
                    i.commit();
                }
            }
            net.step(64);
        }

        let fid = match cores[0].borrow().regs.read(reg) {
            crate::register_file::RegValue::Full(bits) => Fid(*bits).local_fid(),
            other => panic!("expected Full register, got {other:?}"),
        };
        for core in &cores {
            assert_eq!(core.borrow().families.get(fid).num_cores, 4, "group allocate must commit the full place before create runs");
        }

        cores[0].borrow_mut().create_queue.push_back(CreateRequest {
            fid,
            entry_pc: 0x8000,
            reg_counts: [RegCounts { globals: 1, shareds: 2, locals: 3 }, RegCounts::default()],
            has_shareds: false,
            physical_block_size: 4,
        });

        let pipeline = PipelineState::new(
            cores[0].clone(),
            Box::new(TestIsa),
            ICache::new(64, 2, 4, 1),
            DCache::new(64, 2, 4, 1),
            64,
            Vec::new(),
        );
        let mut creator = DoFamilyCreate::new(cores[0].clone(), pipeline.clone());
        for _ in 0..40 {
            match creator.tick() {
                ProcResult::Failed => {}
                _ => creator.commit(),
            }
            pipeline.borrow_mut().icache.tick_fills();
            for i in ingests.iter_mut() {
                if i.tick() != ProcResult::Failed {
                    i.commit();
                }
            }
            net.step(64);

            if cores.iter().all(|c| c.borrow().families.get(fid).state == FamilyState::Active) {
                break;
            }
        }

        for (i, core) in cores.iter().enumerate() {
            let entry = core.borrow().families.get(fid).clone();
            assert_eq!(entry.state, FamilyState::Active, "core {i} never saw its LinkCreate hop");
            assert_eq!(entry.entry_pc, 0x8000);
            assert_eq!(entry.regs[0].count, RegCounts { globals: 1, shareds: 2, locals: 3 });
            assert!(core.borrow().families_pending_alloc.contains(&fid), "core {i} must hand the populated slot to DoThreadAllocate");
        }
    }
}
