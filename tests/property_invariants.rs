use hashbrown::HashMap;
use proptest::prelude::*;

use batchgrid::{
    batch::{BatchDraft, Placement},
    core::store::BatchStore,
    engine::{
        placement::assign_to_first_empty,
        relocation::relocate_selection,
        transfer::{DiscardPlan, plan_discard},
    },
    grid::{GridMap, GridPos},
    op::PlacementMove,
    types::{BatchId, Stage},
};

const MAP: u64 = 1;

#[derive(Debug, Clone)]
enum Action {
    Sow { quantity: u8 },
    PlaceOne { pick: u8 },
    Relocate { pick: u8, row: u8, col: u8 },
    Discard { pick: u8, units: u8 },
}

fn action_strategy() -> impl Strategy<Value = Action> {
    prop_oneof![
        (1u8..6).prop_map(|quantity| Action::Sow { quantity }),
        (0u8..32).prop_map(|pick| Action::PlaceOne { pick }),
        (0u8..32, 1u8..7, 1u8..7).prop_map(|(pick, row, col)| Action::Relocate { pick, row, col }),
        (0u8..32, 1u8..6).prop_map(|(pick, units)| Action::Discard { pick, units }),
    ]
}

fn draft(quantity: u32) -> BatchDraft {
    BatchDraft {
        name: "Aurora".to_string(),
        genetic_id: Some(5),
        tracking_code: None,
        stage: Stage::Vegetation,
        quantity,
        room_id: Some(1),
        placement: None,
        notes: String::new(),
        created_ms: 1,
        start_ms: 1,
    }
}

fn stock_ids(store: &BatchStore) -> Vec<BatchId> {
    store
        .ordered_ids()
        .iter()
        .copied()
        .filter(|id| {
            store
                .get(*id)
                .is_some_and(|r| r.quantity > 0 && r.placement.is_none())
        })
        .collect()
}

fn placed_ids(store: &BatchStore) -> Vec<BatchId> {
    store
        .ordered_ids()
        .iter()
        .copied()
        .filter(|id| {
            store
                .get(*id)
                .is_some_and(|r| r.quantity > 0 && r.placement.is_some())
        })
        .collect()
}

fn live_ids(store: &BatchStore) -> Vec<BatchId> {
    store
        .ordered_ids()
        .iter()
        .copied()
        .filter(|id| store.get(*id).is_some_and(|r| r.quantity > 0))
        .collect()
}

/// Full occupancy scan; panics if two live batches share a cell.
fn occupancy_scan(store: &BatchStore) -> HashMap<GridPos, BatchId> {
    let mut out = HashMap::new();
    for &id in store.ordered_ids() {
        let Some(rec) = store.get(id) else { continue };
        if rec.quantity == 0 {
            continue;
        }
        if let Some(p) = rec.placement {
            assert_eq!(p.map_id, MAP);
            let prev = out.insert(p.pos, id);
            assert!(prev.is_none(), "two live batches share cell {}", p.pos);
        }
    }
    out
}

fn total_units(store: &BatchStore) -> i64 {
    store
        .ordered_ids()
        .iter()
        .filter_map(|id| store.get(*id))
        .map(|r| i64::from(r.quantity))
        .sum()
}

proptest! {
    #[test]
    fn random_sequences_preserve_grid_invariants(
        actions in prop::collection::vec(action_strategy(), 1..120)
    ) {
        let mut store = BatchStore::new();
        store
            .add_map(GridMap { id: MAP, room_id: 1, rows: 6, cols: 6 })
            .expect("map");
        let mut expected_units: i64 = 0;

        for action in actions {
            match action {
                Action::Sow { quantity } => {
                    let _ = store.sow(draft(u32::from(quantity))).expect("sow");
                    expected_units += i64::from(quantity);
                }
                Action::PlaceOne { pick } => {
                    let stock = stock_ids(&store);
                    if stock.is_empty() {
                        continue;
                    }
                    let id = stock[usize::from(pick) % stock.len()];
                    let map = store.map(MAP).cloned().expect("map");
                    let occupied = store.occupied(MAP);
                    let Ok(cells) = assign_to_first_empty(&map, &occupied, 1) else {
                        // grid full: nothing may change
                        continue;
                    };
                    let placement = Placement { map_id: MAP, pos: cells[0] };
                    let quantity = store.get(id).expect("rec").quantity;
                    if quantity > 1 {
                        let _ = store.split(id, 1, Some(placement)).expect("split");
                    } else {
                        store
                            .place(vec![PlacementMove { id, placement: Some(placement) }])
                            .expect("place");
                    }
                }
                Action::Relocate { pick, row, col } => {
                    let placed = placed_ids(&store);
                    if placed.is_empty() {
                        continue;
                    }
                    let mut sel_ids: Vec<BatchId> = Vec::new();
                    for i in 0..3usize {
                        let id = placed[(usize::from(pick) + i) % placed.len()];
                        if !sel_ids.contains(&id) {
                            sel_ids.push(id);
                        }
                    }
                    let selection: Vec<(BatchId, GridPos)> = sel_ids
                        .iter()
                        .map(|id| {
                            let p = store
                                .get(*id)
                                .and_then(|r| r.placement)
                                .expect("selection is placed");
                            (*id, p.pos)
                        })
                        .collect();
                    let mut occupied_others = store.occupied(MAP);
                    for (_, pos) in &selection {
                        occupied_others.remove(pos);
                    }
                    let map = store.map(MAP).cloned().expect("map");
                    let target = GridPos::new(u32::from(row), u32::from(col)).label();
                    let before = store.export_snapshot();

                    match relocate_selection(&map, &selection, &occupied_others, &target) {
                        Ok(moves) => {
                            store
                                .place(
                                    moves
                                        .iter()
                                        .map(|m| PlacementMove {
                                            id: m.batch,
                                            placement: Some(Placement {
                                                map_id: MAP,
                                                pos: m.pos,
                                            }),
                                        })
                                        .collect(),
                                )
                                .expect("validated moves apply");
                        }
                        Err(_) => {
                            // all-or-nothing: a rejected relocation leaves
                            // the store byte-for-byte unchanged
                            prop_assert_eq!(store.export_snapshot(), before);
                        }
                    }
                }
                Action::Discard { pick, units } => {
                    let live = live_ids(&store);
                    if live.is_empty() {
                        continue;
                    }
                    let id = live[usize::from(pick) % live.len()];
                    let rec = store.get_cloned(id).expect("rec");
                    match plan_discard(&rec, u32::from(units)) {
                        Ok(DiscardPlan::Decrement { units }) => {
                            store
                                .quantity_delta(id, -i64::from(units), "discarded")
                                .expect("delta");
                            expected_units -= i64::from(units);
                        }
                        Ok(DiscardPlan::Remove) => {
                            store.delete(id).expect("delete");
                            expected_units -= i64::from(rec.quantity);
                        }
                        Err(_) => {}
                    }
                }
            }

            let occupied = store.occupied(MAP);
            prop_assert!(occupied.len() <= store.map(MAP).expect("map").cell_count());
            prop_assert_eq!(occupied, occupancy_scan(&store));
            prop_assert_eq!(total_units(&store), expected_units);
        }
    }
}
