//! Authoritative in-memory batch grid placement and lineage tracking with
//! append-only SQLite journaling.
//!
//! Batches are quantity-bearing cultivation units arranged on bounded 2D
//! grids. The store keeps the authoritative arena and indices; the pure
//! engines plan placements, relocations, groupings, and quantity
//! transfers over snapshots; the runtime applies validated plans and
//! journals every mutation.
//!
//! # Examples
//!
//! In-memory usage with [`core::store::BatchStore`] and the placement
//! engine:
//! ```
//! use batchgrid::{
//!     batch::BatchDraft,
//!     core::store::BatchStore,
//!     engine::placement,
//!     grid::{GridMap, GridPos},
//!     types::Stage,
//! };
//!
//! let mut store = BatchStore::new();
//! store.add_map(GridMap { id: 1, room_id: 1, rows: 4, cols: 8 }).expect("map");
//! let (id, _op) = store.sow(BatchDraft {
//!     name: "Aurora".to_string(),
//!     genetic_id: Some(7),
//!     tracking_code: None,
//!     stage: Stage::Seedling,
//!     quantity: 12,
//!     room_id: Some(1),
//!     placement: None,
//!     notes: String::new(),
//!     created_ms: 1,
//!     start_ms: 1,
//! }).expect("sow");
//! assert_eq!(id, 1);
//!
//! let map = store.map(1).cloned().expect("map");
//! let occupied = store.occupied(1);
//! let cells = placement::assign_to_first_empty(&map, &occupied, 3).expect("cells");
//! assert_eq!(cells[0], GridPos::new(1, 1));
//! ```
//!
//! Runtime usage with the SQLite journal sink:
//! ```no_run
//! use batchgrid::{
//!     batch::BatchDraft,
//!     core::store::BatchStore,
//!     grid::GridMap,
//!     persist::sqlite::SqliteOpSink,
//!     runtime::handle::{RuntimeConfig, spawn_batchgrid},
//!     types::Stage,
//! };
//!
//! # #[tokio::main]
//! # async fn main() {
//! let sink = SqliteOpSink::open("batches.db").expect("open sqlite");
//! let handle = spawn_batchgrid(BatchStore::new(), Some(Box::new(sink)), RuntimeConfig::default());
//! handle.add_map(GridMap { id: 1, room_id: 1, rows: 4, cols: 8 }).await.expect("map");
//! let id = handle.sow(BatchDraft {
//!     name: "Aurora".to_string(),
//!     genetic_id: Some(7),
//!     tracking_code: None,
//!     stage: Stage::Seedling,
//!     quantity: 3,
//!     room_id: Some(1),
//!     placement: None,
//!     notes: String::new(),
//!     created_ms: 1,
//!     start_ms: 1,
//! }).await.expect("sow");
//! let placed = handle.distribute(1, "A1", vec![(id, 3)]).await.expect("distribute");
//! assert_eq!(placed.len(), 3);
//! handle.shutdown().await.expect("shutdown");
//! # }
//! ```
#![deny(missing_docs)]

/// Batch domain records, drafts, patches, and the group tag.
pub mod batch;
/// Core in-memory store and index helpers.
pub mod core;
/// Pure planning engines: grouping, placement, relocation, transfer.
pub mod engine;
/// Grid maps and cell label addressing.
pub mod grid;
/// Mutation op model and persistence wrapper types.
pub mod op;
/// Persistence abstraction and SQLite implementation.
pub mod persist;
/// Single-writer runtime handle and events.
pub mod runtime;
/// Shared primitive types and enums.
pub mod types;
