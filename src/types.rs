//! Shared primitive IDs and life-cycle enums.

use serde::{Deserialize, Serialize};

/// Monotonic batch identifier. Never reused, not even after deletion.
pub type BatchId = u64;
/// Monotonic operation sequence number.
pub type OpSeq = u64;
/// Grid map identifier.
pub type MapId = u64;
/// Physical room identifier.
pub type RoomId = u32;
/// Genetic/strain identifier.
pub type GeneticId = u32;

/// Linear cultivation life-cycle tag.
///
/// Read by grouping and display logic. Transitions are not validated as a
/// state machine; bulk edits may reassign the stage arbitrarily.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    /// Germinated, not yet established.
    Seedling,
    /// Vegetative growth.
    Vegetation,
    /// Flowering.
    Flowering,
    /// Post-harvest drying.
    Drying,
    /// Curing in containers.
    Curing,
    /// Finished and closed out.
    Completed,
}
