use hashbrown::HashMap;

use crate::{
    grid::{GridMap, GridPos},
    types::BatchId,
};

use super::{error::EngineError, placement::UnitAssignment};

/// Moves a placed selection so its top-left corner lands on
/// `target_label`, preserving the relative arrangement of every member.
///
/// The anchor is the minimum row and minimum column across the selection
/// (the corner, not a centroid). Each member is translated by the same
/// delta, bounds-checked, then collision-checked against
/// `occupied_others`, the occupancy of the map with the selection itself
/// removed. One member out of bounds or colliding aborts the whole move;
/// the engine never routes members around an obstacle individually.
pub fn relocate_selection(
    map: &GridMap,
    selection: &[(BatchId, GridPos)],
    occupied_others: &HashMap<GridPos, BatchId>,
    target_label: &str,
) -> Result<Vec<UnitAssignment>, EngineError> {
    let Some((anchor_row, anchor_col)) =
        selection
            .iter()
            .fold(None, |acc: Option<(u32, u32)>, &(_, pos)| {
                Some(match acc {
                    Some((r, c)) => (r.min(pos.row), c.min(pos.col)),
                    None => (pos.row, pos.col),
                })
            })
    else {
        return Ok(Vec::new());
    };

    let target = GridPos::parse(target_label)?;
    let row_delta = i64::from(target.row) - i64::from(anchor_row);
    let col_delta = i64::from(target.col) - i64::from(anchor_col);

    let mut moves = Vec::with_capacity(selection.len());
    for &(batch, old) in selection {
        let row = i64::from(old.row) + row_delta;
        let col = i64::from(old.col) + col_delta;
        if row < 1 || col < 1 || row > i64::from(map.rows) || col > i64::from(map.cols) {
            return Err(EngineError::OutOfBounds {
                row,
                col,
                rows: map.rows,
                cols: map.cols,
            });
        }
        moves.push(UnitAssignment {
            batch,
            pos: GridPos::new(row as u32, col as u32),
        });
    }

    for mv in &moves {
        if occupied_others.contains_key(&mv.pos) {
            return Err(EngineError::PositionConflict {
                label: mv.pos.label(),
            });
        }
    }

    Ok(moves)
}
