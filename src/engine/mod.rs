//! Pure planning engines over in-memory snapshots.
//!
//! Every entry point takes explicit inputs (a map, an occupancy snapshot,
//! a selection) and returns a plan of assignments or actions. Validation
//! always completes over the whole request before a plan is emitted;
//! mutation and durability stay with the store and runtime.

/// Engine failure taxonomy.
pub mod error;
/// Display grouping from lineage, tags, and genetic identity.
pub mod grouping;
/// Empty-slot scans and anchored bulk distribution.
pub mod placement;
/// Rigid-body relocation of placed selections.
pub mod relocation;
/// Quantity splits, draws, discards, and recombination.
pub mod transfer;
