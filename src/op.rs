//! Mutation operation model and persistence wrappers.

use serde::{Deserialize, Serialize};

use crate::{
    batch::{BatchPatch, BatchRecord, Placement},
    grid::GridMap,
    types::{BatchId, OpSeq},
};

/// Version number for serialized [`StoredOpEnvelope`] payloads.
pub const OP_FORMAT_VERSION: u16 = 1;

/// One batch's placement change inside an atomic [`Op::Place`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementMove {
    /// Batch to move.
    pub id: BatchId,
    /// New cell, or `None` to pull the batch back to stock.
    pub placement: Option<Placement>,
}

/// Immutable operation appended to the journal.
///
/// The journal is forward-only; every variant carries enough payload to be
/// replayed deterministically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    /// Insert a fully materialized batch.
    Sow {
        /// Inserted record.
        batch: BatchRecord,
    },
    /// Patch a record's editable fields.
    Patch {
        /// Batch id to mutate.
        id: BatchId,
        /// Forward patch.
        patch: BatchPatch,
    },
    /// Register a grid map.
    AddMap {
        /// Registered map.
        map: GridMap,
    },
    /// Apply a validated set of placement moves as one transaction.
    Place {
        /// Moves applied atomically.
        moves: Vec<PlacementMove>,
    },
    /// Split units off a source batch into a new child record.
    Split {
        /// Source batch; its quantity drops by the child quantity.
        source: BatchId,
        /// Fully materialized child, possibly already placed.
        child: BatchRecord,
    },
    /// Adjust a batch quantity and append an audit note.
    QuantityDelta {
        /// Batch id to mutate.
        id: BatchId,
        /// Signed quantity change.
        delta: i64,
        /// Audit note appended to the record notes.
        note: String,
    },
    /// Remove a batch entirely.
    Delete {
        /// Batch id to remove.
        id: BatchId,
    },
}

/// Journal row metadata plus operation payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredOp {
    /// Monotonic operation sequence.
    pub seq: OpSeq,
    /// Operation timestamp in milliseconds.
    pub ts_ms: u64,
    /// Operation body.
    pub op: Op,
}

/// Versioned wrapper for stable on-disk payload decoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredOpEnvelope {
    /// Payload format version.
    pub format_version: u16,
    /// Wrapped operation.
    pub stored: StoredOp,
}

impl StoredOpEnvelope {
    /// Constructs an envelope using [`OP_FORMAT_VERSION`].
    pub fn new(stored: StoredOp) -> Self {
        Self {
            format_version: OP_FORMAT_VERSION,
            stored,
        }
    }
}
