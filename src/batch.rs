//! Batch domain record, draft, patch, and the embedded group tag.

use serde::{Deserialize, Serialize};

use crate::{
    grid::GridPos,
    types::{BatchId, GeneticId, MapId, RoomId, Stage},
};

/// Opening marker of the group tag embedded in free-text notes.
const GROUP_TAG_OPEN: &str = "[Grupo:";

/// Extracts the group-override tag from free-text notes.
///
/// The first well-formed `[Grupo: X]` occurrence wins and the tag text is
/// trimmed. Notes without a closing bracket or with an empty tag yield
/// `None`. Parsed once at write time and stored on the record, so grouping
/// never re-scans notes text.
pub fn parse_group_override(notes: &str) -> Option<String> {
    let start = notes.find(GROUP_TAG_OPEN)?;
    let rest = &notes[start + GROUP_TAG_OPEN.len()..];
    let end = rest.find(']')?;
    let name = rest[..end].trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Grid cell occupied by a placed batch.
///
/// A batch is either stock (no placement) or occupies exactly one cell;
/// the map and the cell cannot be set independently of each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    /// Map the cell belongs to.
    pub map_id: MapId,
    /// Occupied cell.
    pub pos: GridPos,
}

/// Fully materialized, authoritative batch record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRecord {
    /// Stable batch identifier.
    pub id: BatchId,
    /// Free-text display name; grouping fallback when `genetic_id` is absent.
    pub name: String,
    /// Genetic/strain reference, if any.
    pub genetic_id: Option<GeneticId>,
    /// Human-facing code. Never changes once assigned.
    pub tracking_code: String,
    /// Life-cycle tag.
    pub stage: Stage,
    /// Plant count. Zero means logically discarded.
    pub quantity: u32,
    /// Lineage back-reference, set only by split operations.
    pub parent_id: Option<BatchId>,
    /// Current physical room, once known.
    pub room_id: Option<RoomId>,
    /// Grid cell, when individualized out of stock.
    pub placement: Option<Placement>,
    /// Free text, including audit lines appended by quantity changes.
    pub notes: String,
    /// Group override parsed out of `notes` at write time.
    pub group_override: Option<String>,
    /// Creation timestamp in milliseconds since epoch.
    pub created_ms: u64,
    /// Cultivation start timestamp in milliseconds since epoch.
    pub start_ms: u64,
}

impl BatchRecord {
    /// Grouping identity: the genetic reference when present, the display
    /// name otherwise.
    pub fn genetic_key(&self) -> String {
        match self.genetic_id {
            Some(g) => format!("g{g}"),
            None => self.name.clone(),
        }
    }
}

/// Insert payload used to sow a new [`BatchRecord`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchDraft {
    /// Display name.
    pub name: String,
    /// Genetic/strain reference, if any.
    pub genetic_id: Option<GeneticId>,
    /// Tracking code; generated from the id when `None`.
    pub tracking_code: Option<String>,
    /// Initial life-cycle tag.
    pub stage: Stage,
    /// Initial plant count.
    pub quantity: u32,
    /// Destination room, if already known.
    pub room_id: Option<RoomId>,
    /// Direct-to-cell placement, or `None` for undifferentiated stock.
    pub placement: Option<Placement>,
    /// Free-text notes.
    pub notes: String,
    /// Creation timestamp in milliseconds since epoch.
    pub created_ms: u64,
    /// Cultivation start timestamp in milliseconds since epoch.
    pub start_ms: u64,
}

/// Sparse patch where each `Some` field overwrites the record value.
///
/// The tracking code, lineage, and placement are deliberately absent: the
/// code is immutable once assigned, lineage is established only by splits,
/// and placement changes go through placement and relocation ops.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BatchPatch {
    /// Optional replacement for the display name.
    pub name: Option<String>,
    /// Optional replacement for the genetic reference.
    pub genetic_id: Option<GeneticId>,
    /// Optional replacement for the life-cycle tag.
    pub stage: Option<Stage>,
    /// Optional replacement for the plant count (manual edit).
    pub quantity: Option<u32>,
    /// Optional replacement for the room.
    pub room_id: Option<RoomId>,
    /// Optional replacement for the notes text.
    pub notes: Option<String>,
    /// Optional replacement for the start timestamp.
    pub start_ms: Option<u64>,
}

impl BatchPatch {
    /// Returns true when no fields are set.
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Applies this patch in place to `rec`, re-deriving the group
    /// override when the notes change.
    pub fn apply_to(&self, rec: &mut BatchRecord) {
        if let Some(v) = &self.name {
            rec.name = v.clone();
        }
        if let Some(v) = self.genetic_id {
            rec.genetic_id = Some(v);
        }
        if let Some(v) = self.stage {
            rec.stage = v;
        }
        if let Some(v) = self.quantity {
            rec.quantity = v;
        }
        if let Some(v) = self.room_id {
            rec.room_id = Some(v);
        }
        if let Some(v) = &self.notes {
            rec.notes = v.clone();
            rec.group_override = parse_group_override(v);
        }
        if let Some(v) = self.start_ms {
            rec.start_ms = v;
        }
    }
}
