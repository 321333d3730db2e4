use hashbrown::HashMap;

use batchgrid::{
    engine::{error::EngineError, relocation::relocate_selection},
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

fn sel(items: &[(BatchId, &str)]) -> Vec<(BatchId, GridPos)> {
    items
        .iter()
        .map(|&(id, l)| (id, GridPos::parse(l).expect("label")))
        .collect()
}

fn occupied(labels: &[&str]) -> HashMap<GridPos, BatchId> {
    labels
        .iter()
        .enumerate()
        .map(|(i, l)| (GridPos::parse(l).expect("label"), 900 + i as u64))
        .collect()
}

#[test]
fn selection_translates_as_rigid_body() {
    // anchor is (1,1); dropping it on B1 shifts everything one row down
    let moves = relocate_selection(
        &map(3, 3),
        &sel(&[(1, "A1"), (2, "A3")]),
        &occupied(&[]),
        "B1",
    )
    .expect("moves");
    let labels: Vec<(BatchId, String)> = moves.iter().map(|m| (m.batch, m.pos.label())).collect();
    assert_eq!(labels, vec![(1, "B1".to_string()), (2, "B3".to_string())]);
}

#[test]
fn anchor_is_corner_not_a_member() {
    // min row comes from one member, min col from another
    let moves = relocate_selection(
        &map(4, 4),
        &sel(&[(1, "A3"), (2, "B1")]),
        &occupied(&[]),
        "C2",
    )
    .expect("moves");
    let labels: Vec<String> = moves.iter().map(|m| m.pos.label()).collect();
    assert_eq!(labels, ["C4", "D2"]);
}

#[test]
fn shape_is_preserved_across_translation() {
    let moves = relocate_selection(
        &map(3, 3),
        &sel(&[(1, "A1"), (2, "A2"), (3, "B1")]),
        &occupied(&[]),
        "B2",
    )
    .expect("moves");
    let labels: Vec<String> = moves.iter().map(|m| m.pos.label()).collect();
    assert_eq!(labels, ["B2", "B3", "C2"]);
}

#[test]
fn one_conflict_aborts_everything_and_names_the_cell() {
    let err = relocate_selection(
        &map(3, 3),
        &sel(&[(1, "A1"), (2, "A3")]),
        &occupied(&["B3"]),
        "B1",
    )
    .expect_err("conflict");
    assert_eq!(
        err,
        EngineError::PositionConflict {
            label: "B3".to_string(),
        }
    );
}

#[test]
fn one_out_of_bounds_member_aborts_everything() {
    let err = relocate_selection(
        &map(2, 3),
        &sel(&[(1, "A1"), (2, "A3")]),
        &occupied(&[]),
        "B2",
    )
    .expect_err("bounds");
    assert_eq!(
        err,
        EngineError::OutOfBounds {
            row: 2,
            col: 4,
            rows: 2,
            cols: 3,
        }
    );
}

#[test]
fn selection_may_move_within_its_own_footprint() {
    // the vacated cells are not in occupied_others, so sliding along a
    // row over your own old position is legal
    let moves = relocate_selection(
        &map(1, 3),
        &sel(&[(1, "A1"), (2, "A2")]),
        &occupied(&[]),
        "A2",
    )
    .expect("moves");
    let labels: Vec<String> = moves.iter().map(|m| m.pos.label()).collect();
    assert_eq!(labels, ["A2", "A3"]);
}

#[test]
fn empty_selection_is_a_noop() {
    let moves = relocate_selection(&map(2, 2), &[], &occupied(&[]), "A1").expect("empty");
    assert!(moves.is_empty());
}

#[test]
fn bad_target_label_is_rejected() {
    let err = relocate_selection(&map(2, 2), &sel(&[(1, "A1")]), &occupied(&[]), "x")
        .expect_err("label");
    assert!(matches!(err, EngineError::InvalidLabel(_)));
}
