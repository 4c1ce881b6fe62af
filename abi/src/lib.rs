//! Shared ABI for the Microgrid simulator.
//!
//! This crate is to `engine`/`coma` what `sys/abi` is to the Hubris kernel
//! and its tasks: the narrow layer of types that must agree between the two
//! halves of the system (the per-core pipeline/allocator and the
//! cache-coherence substrate) is defined once, here, so neither side can
//! drift out of sync with the other's idea of a family handle or a
//! coherence message.

pub mod config;
pub mod error;
pub mod ids;
pub mod message;
pub mod regs;

pub use config::{Config, ConfigError};
pub use error::SimError;
pub use ids::{Capability, Fid, Pid, Place};
pub use message::CoherenceMessage;
pub use regs::{RegAddr, RegType};
