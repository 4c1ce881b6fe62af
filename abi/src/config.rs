//! The flat, object-path-prefixed configuration surface of §6.
//!
//! The distilled spec describes configuration as "a flat key-value map with
//! sections chosen by object-path prefix." We model that the way the
//! teacher's `app.rs` models a flashed `App` header: a typed struct that
//! `serde` fills in from the raw map, with `deny_unknown_fields` turning
//! "Unknown keys are errors" into a property the type system (mostly)
//! enforces for us rather than something we have to hand-check.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Injection policy for a directory's local-ring traffic (§6).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InjectionPolicy {
    None,
    EmptySlotOneEject,
}

/// Per-core sizing knobs (§6, per-core keys).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoreConfig {
    pub num_int_registers: u32,
    pub num_flt_registers: u32,
    pub num_families: u32,
    pub num_threads: u32,
    pub control_block_size: u32,
    pub initial_thread_allocate_queue_size: u32,
    pub create_queue_size: u32,
    pub thread_cleanup_queue_size: u32,
    pub family_allocation_suspend_queue_size: u32,
    pub family_allocation_no_suspend_queue_size: u32,
    pub family_allocation_exclusive_queue_size: u32,
}

/// Per-cache sizing knobs, shared by the I-Cache and D-Cache (§6).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    pub cache_line_size: u32,
    pub associativity: u32,
    pub num_sets: u32,
    pub bank_selector: u32,
    pub outgoing_buffer_size: u32,
    pub incoming_buffer_size: u32,
}

/// Per-directory sizing knobs: a cache config plus token/injection policy
/// fields (§6).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DirectoryConfig {
    #[serde(flatten)]
    pub cache: CacheConfig,
    pub num_tokens: u32,
    pub injection_policy: InjectionPolicy,
}

/// Per-FPU operation latency table (§6 "per FPU: operation latencies").
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FpuConfig {
    #[serde(default)]
    pub op_latencies: std::collections::BTreeMap<String, u32>,
}

/// Top-level configuration for one grid.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub core: CoreConfig,
    pub icache: CacheConfig,
    pub dcache: CacheConfig,
    pub directory: DirectoryConfig,
    #[serde(default)]
    pub fpu: FpuConfig,
    /// Seed for the deterministic capability generator (`abi::ids`). Not a
    /// named key in §6's recognized list; added here because §3's
    /// capability must come from *somewhere* reproducible.
    #[serde(default)]
    pub seed: u64,
}

/// Failure to build a [`Config`] from a raw key-value map: either an
/// unrecognized key (caught by `deny_unknown_fields`) or a missing
/// required one (caught by `serde`'s required-field check). Per §6,
/// "Unknown keys are errors" — there is deliberately no silent
/// default-filling fallback.
#[derive(Debug, Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(#[from] serde_json::Error);

impl Config {
    /// Parses a configuration from a flat JSON object using object-path
    /// prefixes as section names, e.g. `{"core": {...}, "icache": {...}}`.
    pub fn from_json(raw: &serde_json::Value) -> Result<Self, ConfigError> {
        Ok(serde_json::from_value(raw.clone())?)
    }
}
