use hashbrown::HashMap;

use batchgrid::{
    engine::{
        error::EngineError,
        placement::{UnitAssignment, assign_to_first_empty, distribute_from_anchor},
    },
    grid::{GridMap, GridPos},
    types::BatchId,
};

fn map(rows: u32, cols: u32) -> GridMap {
    GridMap {
        id: 1,
        room_id: 1,
        rows,
        cols,
    }
}

fn occupied(labels: &[&str]) -> HashMap<GridPos, BatchId> {
    labels
        .iter()
        .enumerate()
        .map(|(i, l)| (GridPos::parse(l).expect("label"), 900 + i as u64))
        .collect()
}

#[test]
fn first_empty_scans_row_major() {
    let cells = assign_to_first_empty(&map(2, 3), &occupied(&[]), 3).expect("cells");
    let labels: Vec<String> = cells.iter().map(|p| p.label()).collect();
    assert_eq!(labels, ["A1", "A2", "A3"]);
}

#[test]
fn first_empty_skips_occupied_cells() {
    let cells = assign_to_first_empty(&map(2, 2), &occupied(&["A1"]), 2).expect("cells");
    let labels: Vec<String> = cells.iter().map(|p| p.label()).collect();
    assert_eq!(labels, ["A2", "B1"]);
}

#[test]
fn first_empty_never_partially_assigns() {
    let err = assign_to_first_empty(&map(2, 2), &occupied(&["A1", "A2", "B1"]), 2)
        .expect_err("over capacity");
    assert_eq!(
        err,
        EngineError::InsufficientCapacity {
            requested: 2,
            available: 1,
        }
    );
    assert_eq!(err.shortfall(), Some(1));
}

#[test]
fn distribute_walks_from_anchor_skipping_occupied() {
    // 2x2 grid, A1 and B2 taken: the two units of batch 7 must land on
    // A2 then B1
    let plan =
        distribute_from_anchor(&map(2, 2), &occupied(&["A1", "B2"]), "A1", &[(7, 2)])
            .expect("plan");
    assert_eq!(
        plan,
        vec![
            UnitAssignment {
                batch: 7,
                pos: GridPos::new(1, 2),
            },
            UnitAssignment {
                batch: 7,
                pos: GridPos::new(2, 1),
            },
        ]
    );
}

#[test]
fn distribute_fills_exact_capacity() {
    let plan =
        distribute_from_anchor(&map(2, 2), &occupied(&["A1", "B2"]), "A1", &[(7, 1), (8, 1)])
            .expect("plan");
    let labels: Vec<String> = plan.iter().map(|ua| ua.pos.label()).collect();
    assert_eq!(labels, ["A2", "B1"]);
}

#[test]
fn distribute_one_cell_short_fails_whole_request() {
    let err = distribute_from_anchor(&map(2, 2), &occupied(&["A1", "B2"]), "A1", &[(7, 3)])
        .expect_err("over capacity");
    assert_eq!(
        err,
        EngineError::InsufficientCapacity {
            requested: 3,
            available: 2,
        }
    );
}

#[test]
fn distribute_counts_only_anchor_forward() {
    // cells before the anchor never count, even when free
    let err =
        distribute_from_anchor(&map(2, 2), &occupied(&[]), "B1", &[(7, 3)]).expect_err("short");
    assert_eq!(
        err,
        EngineError::InsufficientCapacity {
            requested: 3,
            available: 2,
        }
    );
}

#[test]
fn distribute_expands_multi_batch_queue_in_order() {
    let plan = distribute_from_anchor(&map(2, 2), &occupied(&[]), "A1", &[(1, 1), (2, 2)])
        .expect("plan");
    let pairs: Vec<(u64, String)> = plan.iter().map(|ua| (ua.batch, ua.pos.label())).collect();
    assert_eq!(
        pairs,
        vec![
            (1, "A1".to_string()),
            (2, "A2".to_string()),
            (2, "B1".to_string()),
        ]
    );
}

#[test]
fn distribute_rejects_bad_anchor() {
    let err = distribute_from_anchor(&map(2, 2), &occupied(&[]), "5B", &[(1, 1)])
        .expect_err("label");
    assert!(matches!(err, EngineError::InvalidLabel(_)));

    let err = distribute_from_anchor(&map(2, 2), &occupied(&[]), "C1", &[(1, 1)])
        .expect_err("bounds");
    assert!(matches!(err, EngineError::OutOfBounds { .. }));
}
