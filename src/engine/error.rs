use thiserror::Error;

use crate::grid::LabelError;

/// Failure modes shared by the planning engines.
///
/// Every engine operation is all-or-nothing: any of these aborts the
/// whole request and no partial plan is emitted. Units are never silently
/// dropped or rounded down; the caller decides whether to retry with
/// adjusted parameters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The grid has fewer free cells than requested units.
    #[error("grid holds {available} free cells, {requested} needed")]
    InsufficientCapacity {
        /// Units the request asked to place.
        requested: usize,
        /// Free cells available to the scan.
        available: usize,
    },
    /// Candidate batches supply fewer units than requested.
    #[error("candidates supply {available} units, {requested} needed")]
    InsufficientStock {
        /// Units requested.
        requested: u32,
        /// Units available across all candidates.
        available: u32,
    },
    /// A computed position falls outside the map bounds.
    #[error("computed cell (row {row}, col {col}) outside {rows}x{cols} grid")]
    OutOfBounds {
        /// Computed row; may be zero or negative after translation.
        row: i64,
        /// Computed column; may be zero or negative after translation.
        col: i64,
        /// Map row bound.
        rows: u32,
        /// Map column bound.
        cols: u32,
    },
    /// A computed position is already occupied.
    #[error("cell {label} is already occupied")]
    PositionConflict {
        /// Label of the contested cell.
        label: String,
    },
    /// A position string could not be decoded.
    #[error(transparent)]
    InvalidLabel(#[from] LabelError),
    /// A precondition on the input snapshot does not hold.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
}

impl EngineError {
    /// Units that could not be satisfied, for capacity and stock failures.
    pub fn shortfall(&self) -> Option<u64> {
        match self {
            Self::InsufficientCapacity {
                requested,
                available,
            } => Some((*requested as u64).saturating_sub(*available as u64)),
            Self::InsufficientStock {
                requested,
                available,
            } => Some(u64::from(*requested).saturating_sub(u64::from(*available))),
            _ => None,
        }
    }
}
