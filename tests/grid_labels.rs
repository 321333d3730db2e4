use proptest::prelude::*;

use batchgrid::grid::{GridMap, GridPos};

#[test]
fn encode_matches_spreadsheet_convention() {
    assert_eq!(GridPos::new(1, 1).label(), "A1");
    assert_eq!(GridPos::new(26, 26).label(), "Z26");
    assert_eq!(GridPos::new(27, 1).label(), "AA1");
    assert_eq!(GridPos::new(28, 5).label(), "AB5");
    assert_eq!(GridPos::new(702, 999).label(), "ZZ999");
    assert_eq!(GridPos::new(703, 1).label(), "AAA1");
}

#[test]
fn decode_accepts_known_labels() {
    assert_eq!(GridPos::parse("A1"), Ok(GridPos::new(1, 1)));
    assert_eq!(GridPos::parse("Z26"), Ok(GridPos::new(26, 26)));
    assert_eq!(GridPos::parse("AA1"), Ok(GridPos::new(27, 1)));
    assert_eq!(GridPos::parse("ab5"), Ok(GridPos::new(28, 5)));
    assert_eq!(GridPos::parse(" B2 "), Ok(GridPos::new(2, 2)));
}

#[test]
fn decode_rejects_malformed_labels() {
    for label in ["", "A", "7", "A0", "1A", "A-1", "A1B", "A 1", "Á1"] {
        assert!(GridPos::parse(label).is_err(), "accepted {label:?}");
    }
}

#[test]
fn walk_wraps_rows_and_stops_at_bounds() {
    let map = GridMap {
        id: 1,
        room_id: 1,
        rows: 2,
        cols: 2,
    };
    let cells: Vec<String> = map
        .walk_from(GridPos::new(1, 2))
        .map(|p| p.label())
        .collect();
    assert_eq!(cells, ["A2", "B1", "B2"]);
}

proptest! {
    #[test]
    fn labels_round_trip(row in 1u32..=20_000, col in 1u32..=20_000) {
        let pos = GridPos::new(row, col);
        prop_assert_eq!(GridPos::parse(&pos.label()), Ok(pos));
    }
}
