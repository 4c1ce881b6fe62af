//! Coherence, link, and delegate messages.
//!
//! A message is a value type moved through queues (§9 "Message ownership");
//! queues hold owned messages, peeking returns a borrow, and forwarding a
//! message between queues is a move. This mirrors the way the teacher moves
//! `Task` state around by value rather than by handle-plus-lookup wherever
//! it can.

use crate::ids::{Capability, Fid, Pid};
use crate::regs::{RegAddr, RegCounts};

/// Physical address of a coherence line. The simulator does not model a
/// real address space layout; this is an opaque dense index into main
/// memory's line array.
pub type Address = u64;

/// Tag identifying which of the coherence/link/delegate variants a
/// [`CoherenceMessage`] carries (§3 "Coherence message").
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MessageKind {
    AcquireToken,
    AcquireTokenData,
    DisseminateTokenData,
    LocalDirNotification,
    /// Forward leg of a group allocate, hopping around the place ring
    /// once per core while each core claims its own family-table slot
    /// (§4.1 "DoFamilyAllocate... forwards a LinkAllocate message").
    LinkAllocate,
    /// Reverse leg of a group allocate: commits or unwinds the family
    /// slots claimed by `LinkAllocate` (§4.1 "DoAllocResponse").
    AllocResponse,
    LinkCreate,
    LinkDone,
    LinkSync,
    LinkDetach,
    LinkBreak,
    LinkGlobalWrite,
    DelegateSetProperty,
    DelegateCreate,
    DelegateRawRegister,
    DelegateFamilyRegister,
}

/// A coherence-plane message. Every variant carries the common envelope
/// fields listed in §3; kind-specific content lives in [`MessagePayload`].
#[derive(Clone, Debug)]
pub struct CoherenceMessage {
    pub kind: MessageKind,
    pub address: Address,
    pub source: Pid,
    /// Tokens this message is carrying right now.
    pub tokens_acquired: u32,
    /// Tokens the original requester still wants in total.
    pub tokens_requested: u32,
    /// A transient request does not permanently carry tokens and may be
    /// upgraded to a priority request if it meets the priority token
    /// (§4.5, §GLOSSARY).
    pub transient: bool,
    /// Whether this message currently carries the line's single priority
    /// token (§GLOSSARY "Priority token").
    pub priority: bool,
    pub data_valid: bool,
    pub payload: Option<Vec<u8>>,
    pub extra: MessagePayload,
    /// Number of times this message has already circled its local ring
    /// without being forwarded upward. Not part of the real wire layout
    /// (§6 "opaque to software"); it is bookkeeping a directory needs to
    /// answer "has this request been around once yet" (§4.5
    /// `AcquireTokenData` from Below, line present) without inventing a
    /// side channel outside the message itself.
    pub local_ring_hops: u32,
}

/// Kind-specific fields that do not fit the common envelope.
#[derive(Clone, Debug, Default)]
pub enum MessagePayload {
    #[default]
    None,
    Link(LinkPayload),
    Delegate(DelegatePayload),
}

/// Outcome the reverse `AllocResponse` leg carries for each core it visits
/// (§4.1 "DoAllocResponse... Commit... unwind").
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AllocOutcome {
    /// Write `num_cores` into the visited core's family entry.
    Commit { num_cores: u32 },
    /// Release the context this core reserved; the allocate as a whole
    /// failed (exact) or was truncated away (non-exact power-of-two
    /// rounding).
    Unwind,
}

/// Payload for the link plane (§4.1, §4.7): point-to-point forwarding
/// around a place's ring, used for allocation, create broadcast, sync, and
/// teardown.
#[derive(Clone, Debug)]
pub struct LinkPayload {
    /// FID on the place's first core.
    pub first_fid: Fid,
    /// FID on the previous core in the ring.
    pub prev_fid: Fid,
    /// Number of cores still to be visited by this message.
    pub remaining: u32,
    pub exact: bool,
    /// Register that should receive the completion result, on the core
    /// that originated the request.
    pub completion_reg: Option<RegAddr>,
    pub capability: Capability,
    /// Total size of the place being allocated; unchanged across hops
    /// (`remaining` is what counts down). Used by `LinkAllocate`'s last
    /// hop to compute the non-exact power-of-two result and by
    /// `AllocResponse` to know how many cores still need visiting.
    pub total_size: u32,
    /// Count of cores that have successfully claimed a family-table slot
    /// so far along a `LinkAllocate` forward walk.
    pub allocated_count: u32,
    /// Set only on the `AllocResponse` leg: what the visited core should
    /// do with the family slot it (attempted to) claim.
    pub outcome: Option<AllocOutcome>,
    /// Set only on the `LinkCreate` leg: the register-count header and
    /// entry point every other core in the place needs to populate the
    /// family slot it already claimed during the `LinkAllocate` walk,
    /// without re-fetching the instruction word from its own I-cache
    /// (§4.1 "DoFamilyCreate... BroadcastingCreate").
    pub create: Option<CreateSpec>,
}

/// The per-type register-count header and entry point a `LinkCreate`
/// broadcast carries around the place (§4.1, §6 "Register-count
/// encoding").
#[derive(Copy, Clone, Debug)]
pub struct CreateSpec {
    pub entry_pc: u64,
    pub reg_counts: [RegCounts; 2],
    pub has_shareds: bool,
    pub physical_block_size: u32,
}

/// Payload for the delegate (all-to-all) plane (§4.7).
#[derive(Clone, Debug)]
pub struct DelegatePayload {
    pub dest: Pid,
    pub reg: Option<RegAddr>,
    pub value: u64,
}

impl CoherenceMessage {
    pub fn new(kind: MessageKind, address: Address, source: Pid) -> Self {
        Self {
            kind,
            address,
            source,
            tokens_acquired: 0,
            tokens_requested: 0,
            transient: false,
            priority: false,
            data_valid: false,
            payload: None,
            extra: MessagePayload::None,
            local_ring_hops: 0,
        }
    }

    /// `true` for the three message kinds the local directory dispatches
    /// by (arrival side × kind) in §4.5.
    pub fn is_token_traffic(&self) -> bool {
        matches!(
            self.kind,
            MessageKind::AcquireToken
                | MessageKind::AcquireTokenData
                | MessageKind::DisseminateTokenData
        )
    }
}
