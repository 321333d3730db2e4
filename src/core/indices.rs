use hashbrown::HashMap;

use crate::{
    grid::GridPos,
    types::{BatchId, MapId},
};

/// Multi-valued index from a key to the batches carrying it.
pub type VecIndex<K> = HashMap<K, Vec<BatchId>>;

/// Per-map occupancy: which live batch holds which cell.
pub type CellIndex = HashMap<MapId, HashMap<GridPos, BatchId>>;
