//! Persistence abstraction over the journal op stream.

pub mod sqlite;

use thiserror::Error;

use crate::{core::store::StoreSnapshotV1, op::StoredOp, types::OpSeq};

/// Persistence-layer failures.
#[derive(Debug, Error)]
pub enum PersistError {
    /// SQLite error.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Payload (de)serialization error.
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
    /// Anything else.
    #[error("{0}")]
    Message(String),
}

impl From<crate::core::store::StoreError> for PersistError {
    fn from(value: crate::core::store::StoreError) -> Self {
        Self::Message(format!("store error: {value}"))
    }
}

/// Result alias for persistence operations.
pub type PersistResult<T> = Result<T, PersistError>;

/// Durable sink for journal ops, with optional snapshot support.
///
/// One engine operation may span several ops (a distribution emits one
/// split per unit); the runtime drains and appends them together so a sink
/// can commit them in a single transaction.
pub trait OpSink: Send {
    /// Appends ops durably, returning the highest sequence written.
    fn append_ops(&mut self, ops: &[StoredOp]) -> PersistResult<OpSeq>;

    /// Flushes buffered writes.
    fn flush(&mut self) -> PersistResult<()> {
        Ok(())
    }

    /// Writes a full-store snapshot covering `last_seq`.
    fn write_snapshot(
        &mut self,
        _snapshot: &StoreSnapshotV1,
        _last_seq: OpSeq,
    ) -> PersistResult<()> {
        Ok(())
    }

    /// Deletes journal rows at or below `seq`.
    fn compact_through(&mut self, _seq: OpSeq) -> PersistResult<usize> {
        Ok(0)
    }
}
