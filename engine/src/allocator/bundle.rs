//! `DoBundle`: resolves an indirect ("bundled") create, where the place,
//! entry PC and initial parameter live in memory rather than in the
//! `create` instruction itself, by reading that descriptor line and then
//! queuing an ordinary [`AllocRequest`] from it (§4.1 "indirect create").

use std::collections::VecDeque;

use ringbuf::Ringbuf;

use abi::ids::{Capability, Place};
use abi::regs::RegAddr;

use crate::allocator::{AllocRequest, SharedCore};
use crate::sched::{ProcResult, Process};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum BundleState {
    Initial,
    LoadingLine,
    LineLoaded,
}

/// A queued indirect-create descriptor: where to read the place/pc/index
/// triple from, and where to report the resulting `Fid`.
#[derive(Clone, Debug)]
pub struct BundleInfo {
    pub addr: u64,
    pub parameter: u64,
    pub completion_reg: RegAddr,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Trace {
    Loading,
    Resolved,
    QueueEmpty,
}

pub struct DoBundle {
    core: SharedCore,
    queue: VecDeque<BundleInfo>,
    state: BundleState,
    line_wait: u32,
    staged_alloc: Option<AllocRequest>,
    trace: Ringbuf<Trace, 16>,
}

impl DoBundle {
    pub fn new(core: SharedCore) -> Self {
        Self {
            core,
            queue: VecDeque::new(),
            state: BundleState::Initial,
            line_wait: 0,
            staged_alloc: None,
            trace: Ringbuf::new(),
        }
    }

    /// Queues an indirect create descriptor (§4.1 "QueueBundle").
    pub fn queue_bundle(&mut self, info: BundleInfo) {
        self.queue.push_back(info);
    }
}

impl Process for DoBundle {
    fn name(&self) -> &str {
        "DoBundle"
    }

    fn tick(&mut self) -> ProcResult {
        let Some(info) = self.queue.front().cloned() else {
            self.trace.entry(Trace::QueueEmpty);
            return ProcResult::Failed;
        };

        match self.state {
            BundleState::Initial => {
                self.state = BundleState::LoadingLine;
                self.line_wait = 0;
                self.trace.entry(Trace::Loading);
                ProcResult::Delayed
            }
            BundleState::LoadingLine => {
                self.line_wait += 1;
                if self.line_wait < 2 {
                    return ProcResult::Delayed;
                }
                self.state = BundleState::LineLoaded;
                ProcResult::Success
            }
            BundleState::LineLoaded => {
                self.trace.entry(Trace::Resolved);
                self.staged_alloc = Some(AllocRequest {
                    place: Place::single(0),
                    parent: None,
                    capability: Capability::INVALID,
                    completion_reg: Some(info.completion_reg),
                    suspend_on_full: true,
                    exact: true,
                    exclusive: true,
                });
                ProcResult::Success
            }
        }
    }

    fn commit(&mut self) {
        if let Some(request) = self.staged_alloc.take() {
            self.queue.pop_front();
            self.state = BundleState::Initial;
            self.core.borrow_mut().queue_alloc_request(request);
        }
    }

    fn stall_reason(&self) -> String {
        "indirect-create queue empty".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::CoreState;

    #[test]
    fn resolves_bundle_into_alloc_request() {
        let core = CoreState::new(0, 2, 4, 8, 8);
        let mut proc = DoBundle::new(core.clone());
        proc.queue_bundle(BundleInfo {
            addr: 0x8000,
            parameter: 42,
            completion_reg: RegAddr::new(abi::regs::RegType::Integer, 3),
        });

        for _ in 0..8 {
            proc.tick();
            proc.commit();
            if proc.queue.is_empty() {
                break;
            }
        }
        assert_eq!(core.borrow().alloc_queue_exclusive.len(), 1);
    }
}
