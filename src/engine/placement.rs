use hashbrown::HashMap;

use crate::{
    grid::{GridMap, GridPos},
    types::BatchId,
};

use super::error::EngineError;

/// One grid cell assigned to one unit of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitAssignment {
    /// Batch the unit belongs to.
    pub batch: BatchId,
    /// Cell assigned to the unit.
    pub pos: GridPos,
}

/// Collects the first `count` unoccupied cells, scanning row-major from
/// the top-left corner.
///
/// Fails with [`EngineError::InsufficientCapacity`] when fewer than
/// `count` cells are free; a partial list is never returned.
pub fn assign_to_first_empty(
    map: &GridMap,
    occupied: &HashMap<GridPos, BatchId>,
    count: usize,
) -> Result<Vec<GridPos>, EngineError> {
    let free: Vec<GridPos> = map
        .walk_from(GridPos::new(1, 1))
        .filter(|pos| !occupied.contains_key(pos))
        .take(count)
        .collect();

    if free.len() < count {
        return Err(EngineError::InsufficientCapacity {
            requested: count,
            available: free.len(),
        });
    }
    Ok(free)
}

/// Expands `requests` into a unit queue and assigns each unit to the next
/// free cell, walking row-major from `anchor_label` and skipping occupied
/// cells.
///
/// A request of quantity N contributes N consecutive unit slots for the
/// same batch; the caller materializes each slot as a split or a
/// whole-batch move. Capacity over the anchor-forward walk is checked
/// before any unit is assigned, so exhausting the grid mid-queue can never
/// leave a partial plan behind.
pub fn distribute_from_anchor(
    map: &GridMap,
    occupied: &HashMap<GridPos, BatchId>,
    anchor_label: &str,
    requests: &[(BatchId, u32)],
) -> Result<Vec<UnitAssignment>, EngineError> {
    let anchor = GridPos::parse(anchor_label)?;
    if !map.contains(anchor) {
        return Err(EngineError::OutOfBounds {
            row: i64::from(anchor.row),
            col: i64::from(anchor.col),
            rows: map.rows,
            cols: map.cols,
        });
    }

    let units: usize = requests.iter().map(|&(_, q)| q as usize).sum();
    let free: Vec<GridPos> = map
        .walk_from(anchor)
        .filter(|pos| !occupied.contains_key(pos))
        .collect();
    if free.len() < units {
        return Err(EngineError::InsufficientCapacity {
            requested: units,
            available: free.len(),
        });
    }

    let mut out = Vec::with_capacity(units);
    let mut cells = free.into_iter();
    for &(batch, quantity) in requests {
        for _ in 0..quantity {
            let Some(pos) = cells.next() else {
                // unreachable after the pre-check
                return Err(EngineError::InvariantViolation(format!(
                    "free-cell walk exhausted early for batch {batch}"
                )));
            };
            out.push(UnitAssignment { batch, pos });
        }
    }
    Ok(out)
}
