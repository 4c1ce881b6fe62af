//! `DoThreadActivation`: moves a thread from `ready_queue` (its register
//! window is assigned) onto `active_queue`, where Fetch can pick it up,
//! flipping its state from `Ready` to `Active` (§4.2).

use ringbuf::Ringbuf;

use crate::allocator::SharedCore;
use crate::sched::{ProcResult, Process};
use crate::thread_table::{ThreadState, Tid};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Trace {
    Activated(Tid),
    QueueEmpty,
}

pub struct DoThreadActivation {
    core: SharedCore,
    staged: Option<Tid>,
    trace: Ringbuf<Trace, 16>,
}

impl DoThreadActivation {
    pub fn new(core: SharedCore) -> Self {
        Self { core, staged: None, trace: Ringbuf::new() }
    }
}

impl Process for DoThreadActivation {
    fn name(&self) -> &str {
        "DoThreadActivation"
    }

    fn tick(&mut self) -> ProcResult {
        let mut core = self.core.borrow_mut();
        let Some(tid) = core.ready_queue.pop_front() else {
            self.trace.entry(Trace::QueueEmpty);
            return ProcResult::Failed;
        };
        self.trace.entry(Trace::Activated(tid));
        self.staged = Some(tid);
        ProcResult::Success
    }

    fn commit(&mut self) {
        if let Some(tid) = self.staged.take() {
            let mut core = self.core.borrow_mut();
            core.threads.get_mut(tid).state = ThreadState::Active;
            core.active_queue.push_back(tid);
        }
    }

    fn stall_reason(&self) -> String {
        "ready queue empty".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::CoreState;

    #[test]
    fn moves_ready_thread_onto_active_queue() {
        let core = CoreState::new(0, 1, 2, 4, 4);
        let tid = core.borrow_mut().threads.pop_empty(crate::thread_table::ContextType::Normal).unwrap();
        core.borrow_mut().ready_queue.push_back(tid);

        let mut proc = DoThreadActivation::new(core.clone());
        assert_eq!(proc.tick(), ProcResult::Success);
        proc.commit();

        let c = core.borrow();
        assert_eq!(c.active_queue.len(), 1);
        assert_eq!(c.threads.get(tid).state, ThreadState::Active);
    }

    #[test]
    fn fails_when_ready_queue_is_empty() {
        let core = CoreState::new(0, 1, 2, 4, 4);
        let mut proc = DoThreadActivation::new(core);
        assert_eq!(proc.tick(), ProcResult::Failed);
    }
}
