//! The fatal error taxonomy (§7).
//!
//! These are reserved for conditions the spec calls out as always fatal.
//! Per-cycle backpressure (`FAILED`) and multi-cycle continuations
//! (`DELAYED`) are a different, non-error concept — see
//! `engine::sched::ProcResult` — and are never represented as a
//! `SimError` (§7 "Retries are used only for backpressure... never for
//! correctness errors").

use crate::ids::Pid;
use crate::message::Address;
use thiserror::Error;

/// A fatal error raised by some component of the simulated grid.
///
/// Every variant names the core that faulted, per §7 "the core that
/// faulted is identified."
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SimError {
    /// Raised by Decode on an invalid operand class or class overflow.
    /// Parked on the thread as a fatal trap (§7).
    #[error("core {core}: illegal instruction at pc={pc:#x}: {reason}")]
    IllegalInstruction { core: Pid, pc: u64, reason: String },

    /// Raised on malformed FIDs, misaligned MMIO accesses, or overlapping
    /// directory address reservations.
    #[error("core {core}: invalid argument: {reason}")]
    InvalidArgument { core: Pid, reason: String },

    /// Raised on execution from non-executable memory, or DCA access
    /// outside granted permissions.
    #[error("core {core}: security violation: {reason}")]
    Security { core: Pid, reason: String },

    /// Generic assertion-violation of an invariant.
    #[error("core {core}: simulation invariant violated: {reason}")]
    Simulation { core: Pid, reason: String },

    /// Structural deadlock: every registered process returned `Failed` for
    /// a full cycle. Carries a stall-reason dump, one line per process,
    /// sourced from that process's trace ring buffer.
    #[error("deadlock at cycle {cycle}: {} processes stalled", stalls.len())]
    Deadlock { cycle: u64, stalls: Vec<StallReason> },
}

/// One process's explanation for why it could not make progress this
/// cycle, used to build the §5 deadlock dump.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StallReason {
    pub process: String,
    pub reason: String,
}

impl SimError {
    pub fn core(&self) -> Option<Pid> {
        match self {
            SimError::IllegalInstruction { core, .. }
            | SimError::InvalidArgument { core, .. }
            | SimError::Security { core, .. }
            | SimError::Simulation { core, .. } => Some(*core),
            SimError::Deadlock { .. } => None,
        }
    }
}

/// A fault tied to a specific coherence line, used internally by `coma`
/// before it is escalated to a [`SimError::InvalidArgument`] or
/// [`SimError::Simulation`] at the directory's public boundary.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LineFault {
    pub address: Address,
    pub reason: String,
}
