//! Per-core thread/family allocation and the five-stage pipeline (§3, §4).
//!
//! This crate is the Microgrid half of the simulator that corresponds to
//! the teacher's kernel: a cooperative scheduler (`sched`) running a fixed
//! set of independent processes once per cycle, exactly the shape of the
//! original's syscall-driven task scheduler generalized from "one task
//! runs at a time" to "every process gets a cycle." `coma`, a sibling
//! crate, supplies the token-coherence model this crate's D-Cache and
//! network ultimately sit on top of, but does not depend on this crate;
//! `grid.rs` is where the two are wired together for a caller.

pub mod allocator;
pub mod cache;
pub mod coherence;
pub mod core;
pub mod family_table;
pub mod grid;
pub mod network;
pub mod pipeline;
pub mod ra_unit;
pub mod register_file;
pub mod sched;
pub mod thread_table;

pub use core::Core;
pub use grid::Grid;
pub use sched::{Kernel, ProcResult, Process, StepOutcome};
