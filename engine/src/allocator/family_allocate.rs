//! `DoFamilyAllocate`: claims a family-table slot for a create and, for a
//! group create, forwards the allocation request around the place's ring
//! before returning the resulting `Fid` to the requester (§4.1).

use ringbuf::Ringbuf;

use abi::ids::{Capability, Fid};
use abi::message::{LinkPayload, MessageKind};

use crate::allocator::{AllocRequest, SharedCore};
use crate::network::make_link_message;
use crate::sched::{ProcResult, Process};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Trace {
    QueueEmpty,
    NoFreeFamilySlot,
    Allocated(u32),
}

pub struct DoFamilyAllocate {
    core: SharedCore,
    staged: Option<(AllocRequest, u32)>,
    trace: Ringbuf<Trace, 16>,
}

impl DoFamilyAllocate {
    pub fn new(core: SharedCore) -> Self {
        Self { core, staged: None, trace: Ringbuf::new() }
    }
}

impl Process for DoFamilyAllocate {
    fn name(&self) -> &str {
        "DoFamilyAllocate"
    }

    fn tick(&mut self) -> ProcResult {
        let mut core = self.core.borrow_mut();
        // §4.1: service the exclusive queue first, but only while this
        // core's single exclusive context is not already held by another
        // family; otherwise fall through to non-suspending, then
        // suspending (§3 "the exclusive context is held by at most one
        // family at a time").
        let request = if core.exclusive_family.is_none() { core.alloc_queue_exclusive.pop_front() } else { None }
            .or_else(|| core.alloc_queue_no_suspend.pop_front())
            .or_else(|| core.alloc_queue_suspend.pop_front());
        let Some(request) = request else {
            self.trace.entry(Trace::QueueEmpty);
            return ProcResult::Failed;
        };

        let Some(local_fid) = core.families.allocate() else {
            if request.exclusive {
                core.alloc_queue_exclusive.push_front(request);
            } else if request.suspend_on_full {
                core.alloc_queue_suspend.push_front(request);
            } else {
                core.alloc_queue_no_suspend.push_front(request);
            }
            self.trace.entry(Trace::NoFreeFamilySlot);
            return ProcResult::Failed;
        };

        self.trace.entry(Trace::Allocated(local_fid));
        self.staged = Some((request, local_fid));
        ProcResult::Success
    }

    fn commit(&mut self) {
        if let Some((request, local_fid)) = self.staged.take() {
            let mut core = self.core.borrow_mut();
            let pid = core.pid;
            let capability = if request.capability == Capability::INVALID {
                core.cap_source.next()
            } else {
                request.capability
            };

            let entry = core.families.get_mut(local_fid);
            entry.place = request.place;
            entry.parent = request.parent;
            entry.capability = capability;
            entry.is_exclusive = request.place.size == 1;

            if request.exclusive {
                core.exclusive_family = Some(local_fid);
            }

            if request.place.size == 1 {
                entry.num_cores = 1;
                let fid = Fid::pack(pid, local_fid, capability);
                if let Some(reg) = request.completion_reg {
                    core.regs.write(reg, fid.0);
                }
                return;
            }

            // Group allocate: this core's slot is provisional until the
            // `AllocResponse` leg commits or unwinds it (§4.1
            // "DoAllocResponse"). Stash the correlation and forward the
            // request to the next core in the place.
            core.pending_link_allocs.insert(capability, local_fid);
            let first_fid = Fid::pack(pid, local_fid, capability);
            let payload = LinkPayload {
                first_fid,
                prev_fid: first_fid,
                remaining: request.place.size - 1,
                exact: request.exact,
                completion_reg: request.completion_reg,
                capability,
                total_size: request.place.size,
                allocated_count: 1,
                outcome: None,
                create: None,
            };
            let msg = make_link_message(MessageKind::LinkAllocate, 0, pid, payload);
            core.network.borrow_mut().outgoing.push_back(msg);
        }
    }

    fn stall_reason(&self) -> String {
        match self.trace.last().map(|e| e.payload) {
            Some(Trace::QueueEmpty) => "allocation queue empty".into(),
            Some(Trace::NoFreeFamilySlot) => "no free family-table slot".into(),
            _ => "no reason recorded".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::CoreState;
    use abi::ids::{Capability, Place};

    #[test]
    fn allocates_a_free_family_slot_and_reports_fid() {
        let core = CoreState::new(0, 2, 4, 8, 8);
        let reg = abi::regs::RegAddr::new(abi::regs::RegType::Integer, 0);
        core.borrow_mut().queue_alloc_request(AllocRequest {
            place: Place::single(0),
            parent: None,
            capability: Capability(7),
            completion_reg: Some(reg),
            suspend_on_full: false,
            exact: false,
            exclusive: false,
        });

        let mut proc = DoFamilyAllocate::new(core.clone());
        assert_eq!(proc.tick(), ProcResult::Success);
        proc.commit();

        match core.borrow().regs.read(reg) {
            crate::register_file::RegValue::Full(bits) => {
                let fid = Fid(*bits);
                assert_eq!(fid.pid(), 0);
                assert_eq!(fid.capability(), Capability(7));
            }
            other => panic!("expected Full register, got {other:?}"),
        }
    }

    #[test]
    fn fails_when_queue_is_empty() {
        let core = CoreState::new(0, 2, 4, 8, 8);
        let mut proc = DoFamilyAllocate::new(core);
        assert_eq!(proc.tick(), ProcResult::Failed);
    }

    #[test]
    fn fails_and_requeues_when_no_family_slot_is_free() {
        let core = CoreState::new(0, 0, 4, 8, 8);
        core.borrow_mut().queue_alloc_request(AllocRequest {
            place: Place::single(0),
            parent: None,
            capability: Capability(1),
            completion_reg: None,
            suspend_on_full: false,
            exact: false,
            exclusive: false,
        });
        let mut proc = DoFamilyAllocate::new(core.clone());
        assert_eq!(proc.tick(), ProcResult::Failed);
        assert_eq!(core.borrow().alloc_queue_no_suspend.len(), 1);
    }
}
