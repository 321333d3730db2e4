//! Runtime event stream payloads.

use crate::types::{BatchId, MapId, OpSeq};

/// Events emitted from the single-writer runtime loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchEvent {
    /// A new batch was sown.
    Sown {
        /// Sown batch id.
        id: BatchId,
    },
    /// An existing batch was edited.
    Updated {
        /// Edited batch id.
        id: BatchId,
    },
    /// A grid map was registered.
    MapAdded {
        /// Registered map id.
        id: MapId,
    },
    /// A child was split off a source batch.
    Split {
        /// Source batch id.
        source: BatchId,
        /// New child batch id.
        child: BatchId,
    },
    /// Units landed in grid cells.
    Placed {
        /// Batches now occupying new cells, split children included.
        ids: Vec<BatchId>,
    },
    /// A placed selection was moved.
    Relocated {
        /// Moved batch ids.
        ids: Vec<BatchId>,
    },
    /// Units were discarded from a batch.
    Discarded {
        /// Batch id.
        id: BatchId,
        /// Units discarded.
        units: u32,
    },
    /// A batch was removed entirely.
    Deleted {
        /// Removed batch id.
        id: BatchId,
    },
    /// Several batches were recombined into one.
    Merged {
        /// Surviving batch id.
        target: BatchId,
        /// Deleted member ids.
        absorbed: Vec<BatchId>,
    },
    /// Persistence has reached at least this op sequence.
    DurableUpTo {
        /// Highest sequence known durable.
        op_seq: OpSeq,
    },
}
