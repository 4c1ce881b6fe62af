//! The token-counting COMA coherence substrate (§4.5–§4.7, §GLOSSARY
//! "COMA").
//!
//! This crate is the sibling of `engine`'s C1 half: a two-level ring of
//! caches and directories that implements a non-blocking token-counting
//! coherence protocol. It deliberately does not depend on `engine` — a
//! [`LocalDirectory`] only ever sees [`abi::message::CoherenceMessage`]s
//! arriving "from Below" (its cluster's caches) or "from Above" (the
//! global ring), and never reaches into a D-Cache or register file
//! directly. `engine::coherence` is the bridge that wires a core's
//! `DCache` miss traffic into a `LocalDirectory`'s below-side queues.
//!
//! Every address has a fixed total token count `T` (`total_tokens`,
//! configured per grid). The sum of tokens held by every cache, every
//! directory, and every in-flight message for one address is invariant at
//! `T` (§8 property 2, "token conservation"); at most one message at a
//! time carries the single priority token for a given address (§8
//! property 3). Both are exercised directly in `tests/token_conservation.rs`
//! by driving directories and the root with synthetic traffic rather than
//! through a full pipeline, since token conservation is a property of the
//! message-passing protocol itself and does not need a running ISA to
//! falsify.

pub mod evicted;
pub mod local_directory;
pub mod memory;
pub mod ring;
pub mod root_directory;

pub use evicted::EvictedLineBuffer;
pub use local_directory::LocalDirectory;
pub use memory::MainMemory;
pub use ring::{Ring, RingNode};
pub use root_directory::RootDirectory;
