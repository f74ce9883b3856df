//! Internal tunables that are useful to adjust without recompiling.
//!
//! These mirror knobs that the original constraint-solver implementation exposes as
//! compile-time constants; here they are runtime-overridable environment parameters,
//! read once and cached for the lifetime of the process.

use env_param::EnvParam;

/// Tuple-count threshold above which [`crate::constraints::table::PositiveTable`] switches
/// from the single-word bitset representation to the long-bitset (multi-word) one.
pub static TABLE_BITSET_MAX_TUPLES: EnvParam<usize> = EnvParam::new("FDCP_TABLE_BITSET_MAX_TUPLES", "64");

/// Above this combined (arity * max domain span) the table constraint prefers the
/// hash-map-backed sparse representation over the long-bitset one, since per-value
/// dense arrays would otherwise waste memory on mostly-absent values.
pub static TABLE_SPARSE_DOMAIN_THRESHOLD: EnvParam<usize> = EnvParam::new("FDCP_TABLE_SPARSE_DOMAIN_THRESHOLD", "4096");
