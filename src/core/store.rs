use std::time::{SystemTime, UNIX_EPOCH};

use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    batch::{BatchDraft, BatchPatch, BatchRecord, Placement, parse_group_override},
    core::indices::{CellIndex, VecIndex},
    grid::{GridMap, GridPos},
    op::{Op, PlacementMove, StoredOp},
    types::{BatchId, MapId, OpSeq, RoomId},
};

/// Storage-level failures.
///
/// These guard the structural invariants (known ids, one live batch per
/// cell, in-bounds placements, non-negative quantities) independently of
/// the planning engines.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// No batch with this id.
    #[error("unknown batch {0}")]
    MissingBatch(BatchId),
    /// No map with this id.
    #[error("unknown map {0}")]
    MissingMap(MapId),
    /// Batch id already present.
    #[error("batch {0} already exists")]
    BatchExists(BatchId),
    /// Map id already present.
    #[error("map {0} already exists")]
    MapExists(MapId),
    /// Map bounds must both be at least 1.
    #[error("map {0} has empty bounds")]
    EmptyMap(MapId),
    /// Target cell lies outside the map bounds.
    #[error("cell {pos} outside the bounds of map {map}")]
    OutOfBounds {
        /// Map the write addressed.
        map: MapId,
        /// Rejected cell.
        pos: GridPos,
    },
    /// Target cell is already held by a live batch.
    #[error("cell {pos} on map {map} already occupied by batch {occupant}")]
    CellOccupied {
        /// Map the write addressed.
        map: MapId,
        /// Contested cell.
        pos: GridPos,
        /// Batch currently holding the cell.
        occupant: BatchId,
    },
    /// Quantity change would drop below zero.
    #[error("batch {id} holds {have} units, change of {delta} rejected")]
    QuantityUnderflow {
        /// Batch id.
        id: BatchId,
        /// Units currently held.
        have: u32,
        /// Rejected signed change.
        delta: i64,
    },
    /// A discarded (zero-quantity) batch cannot occupy a cell.
    #[error("batch {0} has zero quantity and cannot be placed")]
    ZeroQuantity(BatchId),
    /// A split must leave at least one unit on the source.
    #[error("cannot split {units} units off batch {id} holding {have}")]
    SplitTooLarge {
        /// Source batch id.
        id: BatchId,
        /// Units currently held.
        have: u32,
        /// Rejected split size.
        units: u32,
    },
    /// One placement op may move each batch at most once.
    #[error("placement op moves batch {0} twice")]
    DuplicateMove(BatchId),
    /// One placement op may claim each cell at most once.
    #[error("placement op claims cell {pos} on map {map} twice")]
    DuplicateTarget {
        /// Map the write addressed.
        map: MapId,
        /// Cell claimed more than once.
        pos: GridPos,
    },
}

/// Serializable full-store snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSnapshotV1 {
    /// Next batch id to allocate.
    pub next_batch_id: BatchId,
    /// Next op sequence to allocate.
    pub next_op_seq: OpSeq,
    /// Insertion order of live batches.
    pub order: Vec<BatchId>,
    /// Live batch records.
    pub records: Vec<BatchRecord>,
    /// Registered grid maps.
    pub maps: Vec<GridMap>,
}

/// Authoritative in-memory store for batches and grid maps.
///
/// Records live in a flat arena keyed by id; the room and occupancy
/// indices are maintained on every write rather than stored on the
/// records. The occupancy index tracks only batches with quantity above
/// zero, so the one-live-batch-per-cell rule is enforced on every
/// placement-bearing op. Mutations append journal ops to a pending buffer
/// drained by the persistence layer.
#[derive(Debug, Default)]
pub struct BatchStore {
    records: HashMap<BatchId, BatchRecord>,
    maps: HashMap<MapId, GridMap>,
    order: Vec<BatchId>,
    by_room: VecIndex<RoomId>,
    cells: CellIndex,
    pending_ops: Vec<StoredOp>,
    next_op_seq: OpSeq,
    next_batch_id: BatchId,
}

impl BatchStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            next_op_seq: 1,
            next_batch_id: 1,
            ..Self::default()
        }
    }

    /// Rebuilds a store from a snapshot, reconstructing all indices.
    pub fn from_snapshot(snapshot: StoreSnapshotV1) -> Result<Self, StoreError> {
        let mut store = Self {
            next_batch_id: snapshot.next_batch_id,
            next_op_seq: snapshot.next_op_seq,
            order: snapshot.order,
            ..Self::default()
        };

        for map in snapshot.maps {
            if store.maps.contains_key(&map.id) {
                return Err(StoreError::MapExists(map.id));
            }
            store.maps.insert(map.id, map);
        }

        for rec in snapshot.records {
            store.index_record(&rec)?;
            store.records.insert(rec.id, rec);
        }

        Ok(store)
    }

    /// Exports a snapshot preserving insertion order.
    pub fn export_snapshot(&self) -> StoreSnapshotV1 {
        let records = self
            .order
            .iter()
            .filter_map(|id| self.records.get(id).cloned())
            .collect();

        let mut maps: Vec<GridMap> = self.maps.values().cloned().collect();
        maps.sort_by_key(|m| m.id);

        StoreSnapshotV1 {
            next_batch_id: self.next_batch_id,
            next_op_seq: self.next_op_seq,
            order: self.order.clone(),
            records,
            maps,
        }
    }

    /// Inserts a new batch from a draft, allocating its id and, when the
    /// draft carries none, its tracking code.
    pub fn sow(&mut self, draft: BatchDraft) -> Result<(BatchId, StoredOp), StoreError> {
        let id = self.next_batch_id;
        let tracking_code = draft
            .tracking_code
            .unwrap_or_else(|| format!("B{id:05}"));
        let group_override = parse_group_override(&draft.notes);

        let batch = BatchRecord {
            id,
            name: draft.name,
            genetic_id: draft.genetic_id,
            tracking_code,
            stage: draft.stage,
            quantity: draft.quantity,
            parent_id: None,
            room_id: draft.room_id,
            placement: draft.placement,
            notes: draft.notes,
            group_override,
            created_ms: draft.created_ms,
            start_ms: draft.start_ms,
        };

        let stored = self.apply_sow(batch)?;
        self.pending_ops.push(stored.clone());
        Ok((id, stored))
    }

    /// Patches a record's editable fields.
    pub fn patch(&mut self, id: BatchId, patch: BatchPatch) -> Result<StoredOp, StoreError> {
        let stored = self.apply_patch(id, patch)?;
        self.pending_ops.push(stored.clone());
        Ok(stored)
    }

    /// Registers a grid map.
    pub fn add_map(&mut self, map: GridMap) -> Result<StoredOp, StoreError> {
        let stored = self.apply_add_map(map)?;
        self.pending_ops.push(stored.clone());
        Ok(stored)
    }

    /// Applies a set of placement moves atomically.
    ///
    /// Validation runs over the whole set first (every batch known, every
    /// target in bounds and free once the cells vacated by this same op
    /// are accounted for), and only then is anything written. A rejected
    /// op leaves the store untouched.
    pub fn place(&mut self, moves: Vec<PlacementMove>) -> Result<StoredOp, StoreError> {
        let stored = self.apply_place(moves)?;
        self.pending_ops.push(stored.clone());
        Ok(stored)
    }

    /// Splits `units` off `source` into a new child batch.
    ///
    /// The child inherits name, genetics, stage, room, and start date; it
    /// gets a fresh id and tracking code (the source code is never
    /// copied), and `placement` when given.
    pub fn split(
        &mut self,
        source: BatchId,
        units: u32,
        placement: Option<Placement>,
    ) -> Result<(BatchId, StoredOp), StoreError> {
        let src = self
            .records
            .get(&source)
            .ok_or(StoreError::MissingBatch(source))?;

        let id = self.next_batch_id;
        let child = BatchRecord {
            id,
            name: src.name.clone(),
            genetic_id: src.genetic_id,
            tracking_code: format!("B{id:05}"),
            stage: src.stage,
            quantity: units,
            parent_id: Some(source),
            room_id: src.room_id,
            placement,
            notes: String::new(),
            group_override: None,
            created_ms: now_ms(),
            start_ms: src.start_ms,
        };

        let stored = self.apply_split(source, child)?;
        self.pending_ops.push(stored.clone());
        Ok((id, stored))
    }

    /// Adjusts a batch quantity, appending `note` as an audit line.
    ///
    /// Reaching zero clears the placement and frees the cell; the record
    /// itself stays until an explicit delete.
    pub fn quantity_delta(
        &mut self,
        id: BatchId,
        delta: i64,
        note: &str,
    ) -> Result<StoredOp, StoreError> {
        let stored = self.apply_quantity_delta(id, delta, note.to_string())?;
        self.pending_ops.push(stored.clone());
        Ok(stored)
    }

    /// Removes a batch entirely, freeing its cell and index entries.
    pub fn delete(&mut self, id: BatchId) -> Result<StoredOp, StoreError> {
        let stored = self.apply_delete(id)?;
        self.pending_ops.push(stored.clone());
        Ok(stored)
    }

    /// Replays a journaled op without buffering it again.
    pub fn apply_replayed_op(&mut self, stored: StoredOp) -> Result<(), StoreError> {
        let seq = stored.seq;
        match stored.op {
            Op::Sow { batch } => {
                self.apply_sow_with_seq(batch, seq)?;
            }
            Op::Patch { id, patch } => {
                self.apply_patch_with_seq(id, patch, seq)?;
            }
            Op::AddMap { map } => {
                self.apply_add_map_with_seq(map, seq)?;
            }
            Op::Place { moves } => {
                self.apply_place_with_seq(moves, seq)?;
            }
            Op::Split { source, child } => {
                self.apply_split_with_seq(source, child, seq)?;
            }
            Op::QuantityDelta { id, delta, note } => {
                self.apply_quantity_delta_with_seq(id, delta, note, seq)?;
            }
            Op::Delete { id } => {
                self.apply_delete_with_seq(id, seq)?;
            }
        }
        Ok(())
    }

    /// Returns a batch by id.
    pub fn get(&self, id: BatchId) -> Option<&BatchRecord> {
        self.records.get(&id)
    }

    /// Returns a cloned batch by id.
    pub fn get_cloned(&self, id: BatchId) -> Option<BatchRecord> {
        self.get(id).cloned()
    }

    /// Returns a registered map by id.
    pub fn map(&self, id: MapId) -> Option<&GridMap> {
        self.maps.get(&id)
    }

    /// All batches currently assigned to `room`, in insertion order.
    pub fn by_room(&self, room: RoomId) -> Vec<&BatchRecord> {
        self.by_room
            .get(&room)
            .into_iter()
            .flat_map(|ids| ids.iter())
            .filter_map(|id| self.records.get(id))
            .collect()
    }

    /// Cloned variant of [`Self::by_room`].
    pub fn by_room_cloned(&self, room: RoomId) -> Vec<BatchRecord> {
        self.by_room(room).into_iter().cloned().collect()
    }

    /// Live, unplaced batches in `room`, the candidates bulk placement
    /// draws from.
    pub fn stock_in_room(&self, room: RoomId) -> Vec<&BatchRecord> {
        self.by_room(room)
            .into_iter()
            .filter(|b| b.quantity > 0 && b.placement.is_none())
            .collect()
    }

    /// Occupancy snapshot of one map: cell to live-batch id.
    pub fn occupied(&self, map: MapId) -> HashMap<GridPos, BatchId> {
        self.cells.get(&map).cloned().unwrap_or_default()
    }

    /// Live batch holding `pos` on `map`, if any.
    pub fn batch_at(&self, map: MapId, pos: GridPos) -> Option<BatchId> {
        self.cells.get(&map).and_then(|c| c.get(&pos)).copied()
    }

    /// Batch ids in insertion order.
    pub fn ordered_ids(&self) -> &[BatchId] {
        &self.order
    }

    /// Takes all ops buffered since the last drain.
    pub fn drain_pending_ops(&mut self) -> Vec<StoredOp> {
        std::mem::take(&mut self.pending_ops)
    }

    /// Highest op sequence allocated so far.
    pub fn latest_op_seq(&self) -> OpSeq {
        self.next_op_seq.saturating_sub(1)
    }

    fn apply_sow(&mut self, batch: BatchRecord) -> Result<StoredOp, StoreError> {
        let seq = self.take_next_op_seq();
        self.apply_sow_with_seq(batch, seq)
    }

    fn apply_sow_with_seq(
        &mut self,
        batch: BatchRecord,
        seq: OpSeq,
    ) -> Result<StoredOp, StoreError> {
        if self.records.contains_key(&batch.id) {
            return Err(StoreError::BatchExists(batch.id));
        }
        if let Some(p) = batch.placement {
            if batch.quantity == 0 {
                return Err(StoreError::ZeroQuantity(batch.id));
            }
            self.check_cell_free(p)?;
        }

        let id = batch.id;
        self.next_batch_id = self.next_batch_id.max(id.saturating_add(1));
        self.index_record(&batch)?;
        self.order.push(id);
        self.records.insert(id, batch.clone());

        self.bump_next_seq_from(seq);
        Ok(StoredOp {
            seq,
            ts_ms: now_ms(),
            op: Op::Sow { batch },
        })
    }

    fn apply_patch(&mut self, id: BatchId, patch: BatchPatch) -> Result<StoredOp, StoreError> {
        let seq = self.take_next_op_seq();
        self.apply_patch_with_seq(id, patch, seq)
    }

    fn apply_patch_with_seq(
        &mut self,
        id: BatchId,
        patch: BatchPatch,
        seq: OpSeq,
    ) -> Result<StoredOp, StoreError> {
        let rec = self
            .records
            .get_mut(&id)
            .ok_or(StoreError::MissingBatch(id))?;

        let old_room = rec.room_id;
        patch.apply_to(rec);
        let new_room = rec.room_id;
        let freed = if rec.quantity == 0 {
            rec.placement.take()
        } else {
            None
        };

        if new_room != old_room {
            if let Some(room) = old_room {
                Self::remove_from_vec_index(self.by_room.entry(room).or_default(), id);
            }
            if let Some(room) = new_room {
                self.by_room.entry(room).or_default().push(id);
            }
        }
        if let Some(p) = freed {
            self.release_cell(p, id);
        }

        self.bump_next_seq_from(seq);
        Ok(StoredOp {
            seq,
            ts_ms: now_ms(),
            op: Op::Patch { id, patch },
        })
    }

    fn apply_add_map(&mut self, map: GridMap) -> Result<StoredOp, StoreError> {
        let seq = self.take_next_op_seq();
        self.apply_add_map_with_seq(map, seq)
    }

    fn apply_add_map_with_seq(
        &mut self,
        map: GridMap,
        seq: OpSeq,
    ) -> Result<StoredOp, StoreError> {
        if map.rows == 0 || map.cols == 0 {
            return Err(StoreError::EmptyMap(map.id));
        }
        if self.maps.contains_key(&map.id) {
            return Err(StoreError::MapExists(map.id));
        }

        self.maps.insert(map.id, map.clone());
        self.bump_next_seq_from(seq);
        Ok(StoredOp {
            seq,
            ts_ms: now_ms(),
            op: Op::AddMap { map },
        })
    }

    fn apply_place(&mut self, moves: Vec<PlacementMove>) -> Result<StoredOp, StoreError> {
        // validate before allocating a sequence so a rejected op leaves
        // the store byte-for-byte unchanged, counters included
        self.validate_place(&moves)?;
        let seq = self.take_next_op_seq();
        self.apply_place_with_seq(moves, seq)
    }

    fn validate_place(&self, moves: &[PlacementMove]) -> Result<(), StoreError> {
        let mut seen = HashSet::with_capacity(moves.len());
        let mut vacated: HashSet<(MapId, GridPos)> = HashSet::new();
        for mv in moves {
            if !seen.insert(mv.id) {
                return Err(StoreError::DuplicateMove(mv.id));
            }
            let rec = self
                .records
                .get(&mv.id)
                .ok_or(StoreError::MissingBatch(mv.id))?;
            if let Some(p) = rec.placement {
                vacated.insert((p.map_id, p.pos));
            }
            if let Some(p) = mv.placement {
                if rec.quantity == 0 {
                    return Err(StoreError::ZeroQuantity(mv.id));
                }
                let map = self
                    .maps
                    .get(&p.map_id)
                    .ok_or(StoreError::MissingMap(p.map_id))?;
                if !map.contains(p.pos) {
                    return Err(StoreError::OutOfBounds {
                        map: p.map_id,
                        pos: p.pos,
                    });
                }
            }
        }

        let mut claimed: HashSet<(MapId, GridPos)> = HashSet::new();
        for mv in moves {
            let Some(p) = mv.placement else { continue };
            if !claimed.insert((p.map_id, p.pos)) {
                return Err(StoreError::DuplicateTarget {
                    map: p.map_id,
                    pos: p.pos,
                });
            }
            if vacated.contains(&(p.map_id, p.pos)) {
                continue;
            }
            if let Some(&occupant) = self.cells.get(&p.map_id).and_then(|c| c.get(&p.pos)) {
                return Err(StoreError::CellOccupied {
                    map: p.map_id,
                    pos: p.pos,
                    occupant,
                });
            }
        }
        Ok(())
    }

    fn apply_place_with_seq(
        &mut self,
        moves: Vec<PlacementMove>,
        seq: OpSeq,
    ) -> Result<StoredOp, StoreError> {
        self.validate_place(&moves)?;

        // commit: release every old cell first so the set may shuffle
        // within its own footprint, then claim the new ones.
        for mv in &moves {
            let old = self
                .records
                .get_mut(&mv.id)
                .and_then(|rec| rec.placement.take());
            if let Some(p) = old {
                self.release_cell(p, mv.id);
            }
        }
        for mv in &moves {
            if let Some(rec) = self.records.get_mut(&mv.id) {
                rec.placement = mv.placement;
            }
            if let Some(p) = mv.placement {
                self.cells.entry(p.map_id).or_default().insert(p.pos, mv.id);
            }
        }

        self.bump_next_seq_from(seq);
        Ok(StoredOp {
            seq,
            ts_ms: now_ms(),
            op: Op::Place { moves },
        })
    }

    fn apply_split(
        &mut self,
        source: BatchId,
        child: BatchRecord,
    ) -> Result<StoredOp, StoreError> {
        let seq = self.take_next_op_seq();
        self.apply_split_with_seq(source, child, seq)
    }

    fn apply_split_with_seq(
        &mut self,
        source: BatchId,
        child: BatchRecord,
        seq: OpSeq,
    ) -> Result<StoredOp, StoreError> {
        let src = self
            .records
            .get(&source)
            .ok_or(StoreError::MissingBatch(source))?;
        if child.quantity == 0 || child.quantity >= src.quantity {
            return Err(StoreError::SplitTooLarge {
                id: source,
                have: src.quantity,
                units: child.quantity,
            });
        }
        if self.records.contains_key(&child.id) {
            return Err(StoreError::BatchExists(child.id));
        }
        if let Some(p) = child.placement {
            self.check_cell_free(p)?;
        }

        let id = child.id;
        self.next_batch_id = self.next_batch_id.max(id.saturating_add(1));
        let src = self
            .records
            .get_mut(&source)
            .ok_or(StoreError::MissingBatch(source))?;
        src.quantity -= child.quantity;

        self.index_record(&child)?;
        self.order.push(id);
        self.records.insert(id, child.clone());

        self.bump_next_seq_from(seq);
        Ok(StoredOp {
            seq,
            ts_ms: now_ms(),
            op: Op::Split { source, child },
        })
    }

    fn apply_quantity_delta(
        &mut self,
        id: BatchId,
        delta: i64,
        note: String,
    ) -> Result<StoredOp, StoreError> {
        let seq = self.take_next_op_seq();
        self.apply_quantity_delta_with_seq(id, delta, note, seq)
    }

    fn apply_quantity_delta_with_seq(
        &mut self,
        id: BatchId,
        delta: i64,
        note: String,
        seq: OpSeq,
    ) -> Result<StoredOp, StoreError> {
        let rec = self
            .records
            .get_mut(&id)
            .ok_or(StoreError::MissingBatch(id))?;

        let new_quantity = i64::from(rec.quantity)
            .checked_add(delta)
            .and_then(|q| u32::try_from(q).ok())
            .ok_or(StoreError::QuantityUnderflow {
                id,
                have: rec.quantity,
                delta,
            })?;

        rec.quantity = new_quantity;
        if !note.is_empty() {
            if !rec.notes.is_empty() {
                rec.notes.push('\n');
            }
            rec.notes.push_str(&note);
        }
        let freed = if rec.quantity == 0 {
            rec.placement.take()
        } else {
            None
        };
        if let Some(p) = freed {
            self.release_cell(p, id);
        }

        self.bump_next_seq_from(seq);
        Ok(StoredOp {
            seq,
            ts_ms: now_ms(),
            op: Op::QuantityDelta { id, delta, note },
        })
    }

    fn apply_delete(&mut self, id: BatchId) -> Result<StoredOp, StoreError> {
        let seq = self.take_next_op_seq();
        self.apply_delete_with_seq(id, seq)
    }

    fn apply_delete_with_seq(&mut self, id: BatchId, seq: OpSeq) -> Result<StoredOp, StoreError> {
        let rec = self
            .records
            .remove(&id)
            .ok_or(StoreError::MissingBatch(id))?;

        if let Some(room) = rec.room_id {
            Self::remove_from_vec_index(self.by_room.entry(room).or_default(), id);
        }
        if let Some(p) = rec.placement {
            self.release_cell(p, id);
        }
        if let Some(i) = self.order.iter().position(|x| *x == id) {
            self.order.remove(i);
        }

        self.bump_next_seq_from(seq);
        Ok(StoredOp {
            seq,
            ts_ms: now_ms(),
            op: Op::Delete { id },
        })
    }

    fn check_cell_free(&self, p: Placement) -> Result<(), StoreError> {
        let map = self
            .maps
            .get(&p.map_id)
            .ok_or(StoreError::MissingMap(p.map_id))?;
        if !map.contains(p.pos) {
            return Err(StoreError::OutOfBounds {
                map: p.map_id,
                pos: p.pos,
            });
        }
        if let Some(&occupant) = self.cells.get(&p.map_id).and_then(|c| c.get(&p.pos)) {
            return Err(StoreError::CellOccupied {
                map: p.map_id,
                pos: p.pos,
                occupant,
            });
        }
        Ok(())
    }

    fn index_record(&mut self, rec: &BatchRecord) -> Result<(), StoreError> {
        if let Some(room) = rec.room_id {
            self.by_room.entry(room).or_default().push(rec.id);
        }
        if rec.quantity > 0 {
            if let Some(p) = rec.placement {
                let cell = self.cells.entry(p.map_id).or_default();
                if let Some(&occupant) = cell.get(&p.pos) {
                    return Err(StoreError::CellOccupied {
                        map: p.map_id,
                        pos: p.pos,
                        occupant,
                    });
                }
                cell.insert(p.pos, rec.id);
            }
        }
        Ok(())
    }

    fn release_cell(&mut self, p: Placement, id: BatchId) {
        if let Some(cell) = self.cells.get_mut(&p.map_id) {
            if cell.get(&p.pos) == Some(&id) {
                cell.remove(&p.pos);
            }
        }
    }

    fn remove_from_vec_index(v: &mut Vec<BatchId>, id: BatchId) {
        if let Some(pos) = v.iter().position(|x| *x == id) {
            v.remove(pos);
        }
    }

    fn take_next_op_seq(&mut self) -> OpSeq {
        let seq = self.next_op_seq;
        self.next_op_seq += 1;
        seq
    }

    fn bump_next_seq_from(&mut self, seq: OpSeq) {
        self.next_op_seq = self.next_op_seq.max(seq.saturating_add(1));
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
