//! Bounded 2D grid maps and spreadsheet-style cell addressing.
//!
//! The letter math lives here and nowhere else: rows map to a base-26
//! letter run (1 → `A`, 26 → `Z`, 27 → `AA`), columns append as a plain
//! decimal, no separator. Row 28, column 5 encodes as `AB5`.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{MapId, RoomId};

/// Error returned when a cell label cannot be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot decode grid label `{label}`")]
pub struct LabelError {
    /// The offending label text.
    pub label: String,
}

/// One-based cell coordinate on a [`GridMap`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct GridPos {
    /// Row, starting at 1. Encoded as the leading letter run.
    pub row: u32,
    /// Column, starting at 1. Encoded as the decimal tail.
    pub col: u32,
}

impl GridPos {
    /// Builds a position from one-based row and column.
    pub fn new(row: u32, col: u32) -> Self {
        Self { row, col }
    }

    /// Encodes to a label such as `A1` or `AB5`.
    pub fn label(&self) -> String {
        let mut letters = String::new();
        let mut n = self.row;
        while n > 0 {
            n -= 1;
            letters.insert(0, char::from(b'A' + (n % 26) as u8));
            n /= 26;
        }
        format!("{letters}{}", self.col)
    }

    /// Decodes a label back into a position.
    ///
    /// The label must be a letter run followed by a digit run and nothing
    /// else; anything unparseable is an error, never a silent default.
    pub fn parse(label: &str) -> Result<Self, LabelError> {
        let err = || LabelError {
            label: label.to_string(),
        };

        let text = label.trim();
        let digits_at = text.find(|c: char| c.is_ascii_digit()).ok_or_else(err)?;
        let (letters, digits) = text.split_at(digits_at);

        if letters.is_empty()
            || digits.is_empty()
            || !letters.chars().all(|c| c.is_ascii_alphabetic())
            || !digits.chars().all(|c| c.is_ascii_digit())
        {
            return Err(err());
        }

        let mut row: u32 = 0;
        for c in letters.chars() {
            let v = u32::from(c.to_ascii_uppercase() as u8 - b'A') + 1;
            row = row
                .checked_mul(26)
                .and_then(|r| r.checked_add(v))
                .ok_or_else(err)?;
        }

        let col: u32 = digits.parse().map_err(|_| err())?;
        if col == 0 {
            return Err(err());
        }

        Ok(Self { row, col })
    }
}

impl fmt::Display for GridPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Bounded rectangular grid belonging to one room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridMap {
    /// Map identifier.
    pub id: MapId,
    /// Room that owns this map.
    pub room_id: RoomId,
    /// Row bound, at least 1.
    pub rows: u32,
    /// Column bound, at least 1.
    pub cols: u32,
}

impl GridMap {
    /// True when `pos` falls inside the bounds.
    pub fn contains(&self, pos: GridPos) -> bool {
        (1..=self.rows).contains(&pos.row) && (1..=self.cols).contains(&pos.col)
    }

    /// Total number of cells.
    pub fn cell_count(&self) -> usize {
        self.rows as usize * self.cols as usize
    }

    /// Row-major walk over every cell from `start` (inclusive) to the
    /// bottom-right corner, wrapping to column 1 at each row end.
    pub fn walk_from(&self, start: GridPos) -> impl Iterator<Item = GridPos> {
        let cols = self.cols;
        (start.row..=self.rows).flat_map(move |row| {
            let first = if row == start.row { start.col } else { 1 };
            (first..=cols).map(move |col| GridPos { row, col })
        })
    }
}
