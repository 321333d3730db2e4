use std::sync::Arc;

use hashbrown::HashMap;
use thiserror::Error;
use tokio::{
    sync::{Mutex, broadcast, mpsc, oneshot},
    time::{Duration, Instant},
};
use tracing::{debug, warn};

use crate::{
    batch::{BatchDraft, BatchPatch, BatchRecord, Placement},
    core::store::{BatchStore, StoreError},
    engine::{
        error::EngineError,
        grouping::{self, Group},
        placement::{self, UnitAssignment},
        relocation, transfer,
    },
    grid::{GridMap, GridPos},
    op::{Op, PlacementMove, StoredOp},
    persist::{OpSink, PersistError},
    types::{BatchId, MapId, OpSeq, RoomId},
};

use super::events::BatchEvent;

/// Failures surfaced by the runtime handle.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Storage rejected the command.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// An engine plan failed validation.
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// Persistence failed or backpressured.
    #[error(transparent)]
    Persist(#[from] PersistError),
    /// The runtime loop is gone.
    #[error("runtime channel closed")]
    ChannelClosed,
}

/// Tuning knobs for the single-writer loop and persistence worker.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Flush as soon as a placement-bearing op lands instead of waiting
    /// for the batch window.
    pub eager_flush: bool,
    /// Flush once this many ops are buffered.
    pub batch_max_ops: usize,
    /// Flush once the oldest buffered op is this old.
    pub batch_max_latency_ms: u64,
    /// Bound of the persistence queue; overflow surfaces as an error.
    pub persist_queue_bound: usize,
    /// Auto-checkpoint after this many ops; 0 disables.
    pub snapshot_every_ops: usize,
    /// Compact the journal after each snapshot.
    pub compact_after_snapshot: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            eager_flush: true,
            batch_max_ops: 32,
            batch_max_latency_ms: 75,
            persist_queue_bound: 64,
            snapshot_every_ops: 2000,
            compact_after_snapshot: false,
        }
    }
}

/// Cloneable handle to a spawned batch-grid runtime.
pub struct BatchGridHandle {
    cmd_tx: mpsc::Sender<Command>,
    events_tx: broadcast::Sender<BatchEvent>,
}

impl Clone for BatchGridHandle {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            events_tx: self.events_tx.clone(),
        }
    }
}

enum Command {
    Sow {
        draft: BatchDraft,
        resp: oneshot::Sender<Result<BatchId, RuntimeError>>,
    },
    Patch {
        id: BatchId,
        patch: BatchPatch,
        resp: oneshot::Sender<Result<(), RuntimeError>>,
    },
    AddMap {
        map: GridMap,
        resp: oneshot::Sender<Result<(), RuntimeError>>,
    },
    PlaceFirstEmpty {
        map_id: MapId,
        sources: Vec<BatchId>,
        count: u32,
        resp: oneshot::Sender<Result<Vec<UnitAssignment>, RuntimeError>>,
    },
    Distribute {
        map_id: MapId,
        anchor: String,
        requests: Vec<(BatchId, u32)>,
        resp: oneshot::Sender<Result<Vec<UnitAssignment>, RuntimeError>>,
    },
    Relocate {
        map_id: MapId,
        ids: Vec<BatchId>,
        target: String,
        resp: oneshot::Sender<Result<(), RuntimeError>>,
    },
    Discard {
        id: BatchId,
        units: u32,
        reason: String,
        resp: oneshot::Sender<Result<(), RuntimeError>>,
    },
    Merge {
        ids: Vec<BatchId>,
        resp: oneshot::Sender<Result<BatchId, RuntimeError>>,
    },
    Get {
        id: BatchId,
        resp: oneshot::Sender<Option<BatchRecord>>,
    },
    GetMap {
        id: MapId,
        resp: oneshot::Sender<Option<GridMap>>,
    },
    ByRoom {
        room: RoomId,
        resp: oneshot::Sender<Vec<BatchRecord>>,
    },
    Groups {
        room: RoomId,
        by_genetic: bool,
        resp: oneshot::Sender<Vec<Group>>,
    },
    Flush {
        resp: oneshot::Sender<Result<OpSeq, RuntimeError>>,
    },
    Checkpoint {
        resp: oneshot::Sender<Result<(), RuntimeError>>,
    },
    Shutdown {
        resp: oneshot::Sender<Result<(), RuntimeError>>,
    },
}

enum PersistMsg {
    Op(StoredOp),
    Flush {
        resp: oneshot::Sender<Result<OpSeq, PersistError>>,
    },
    Checkpoint {
        snapshot: crate::core::store::StoreSnapshotV1,
        last_seq: OpSeq,
        compact: bool,
        resp: oneshot::Sender<Result<(), PersistError>>,
    },
    Shutdown {
        resp: oneshot::Sender<()>,
    },
}

/// Spawns the single-writer runtime over `store`, journaling into `sink`
/// when one is given.
pub fn spawn_batchgrid(
    store: BatchStore,
    sink: Option<Box<dyn OpSink>>,
    config: RuntimeConfig,
) -> BatchGridHandle {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(256);
    let (events_tx, _) = broadcast::channel::<BatchEvent>(1024);

    let (persist_tx_opt, mut durable_rx) = if let Some(sink) = sink {
        let (persist_tx, persist_rx) = mpsc::channel::<PersistMsg>(config.persist_queue_bound);
        let (durable_tx, durable_rx) = mpsc::unbounded_channel::<Result<OpSeq, PersistError>>();
        spawn_persistence_worker(sink, persist_rx, durable_tx, config.clone());
        (Some(persist_tx), Some(durable_rx))
    } else {
        (None, None)
    };

    let events_tx_loop = events_tx.clone();

    tokio::spawn(async move {
        let mut store = store;
        let mut ops_since_snapshot = 0usize;

        loop {
            if let Some(rx) = durable_rx.as_mut() {
                tokio::select! {
                    cmd = cmd_rx.recv() => {
                        let Some(cmd) = cmd else { break; };
                        let done = handle_command(
                            cmd,
                            &mut store,
                            &events_tx_loop,
                            persist_tx_opt.as_ref(),
                            &config,
                            &mut ops_since_snapshot,
                        ).await;

                        if done {
                            break;
                        }
                    }
                    durable = rx.recv() => {
                        if let Some(Ok(op_seq)) = durable {
                            let _ = events_tx_loop.send(BatchEvent::DurableUpTo { op_seq });
                        }
                    }
                }
            } else {
                let Some(cmd) = cmd_rx.recv().await else { break; };
                let done = handle_command(
                    cmd,
                    &mut store,
                    &events_tx_loop,
                    persist_tx_opt.as_ref(),
                    &config,
                    &mut ops_since_snapshot,
                )
                .await;
                if done {
                    break;
                }
            }
        }
    });

    BatchGridHandle { cmd_tx, events_tx }
}

impl BatchGridHandle {
    /// Subscribes to the runtime event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.events_tx.subscribe()
    }

    /// Sows a new batch and returns its id.
    pub async fn sow(&self, draft: BatchDraft) -> Result<BatchId, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Sow { draft, resp: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    /// Patches a batch's editable fields.
    pub async fn patch(&self, id: BatchId, patch: BatchPatch) -> Result<(), RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Patch { id, patch, resp: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    /// Registers a grid map.
    pub async fn add_map(&self, map: GridMap) -> Result<(), RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::AddMap { map, resp: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    /// Places `count` units drawn from `sources` into the first free
    /// cells of `map_id`, splitting stock batches per unit as needed.
    pub async fn place_first_empty(
        &self,
        map_id: MapId,
        sources: Vec<BatchId>,
        count: u32,
    ) -> Result<Vec<UnitAssignment>, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::PlaceFirstEmpty {
                map_id,
                sources,
                count,
                resp: tx,
            })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    /// Distributes `requests` cell by cell, walking row-major from the
    /// `anchor` label and skipping occupied cells.
    pub async fn distribute(
        &self,
        map_id: MapId,
        anchor: impl Into<String>,
        requests: Vec<(BatchId, u32)>,
    ) -> Result<Vec<UnitAssignment>, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Distribute {
                map_id,
                anchor: anchor.into(),
                requests,
                resp: tx,
            })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    /// Relocates the placed selection `ids` so its top-left corner lands
    /// on the `target` label.
    pub async fn relocate(
        &self,
        map_id: MapId,
        ids: Vec<BatchId>,
        target: impl Into<String>,
    ) -> Result<(), RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Relocate {
                map_id,
                ids,
                target: target.into(),
                resp: tx,
            })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    /// Discards `units` from a batch; discarding the full quantity
    /// removes the record.
    pub async fn discard(
        &self,
        id: BatchId,
        units: u32,
        reason: impl Into<String>,
    ) -> Result<(), RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Discard {
                id,
                units,
                reason: reason.into(),
                resp: tx,
            })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    /// Recombines several batches into one, returning the survivor.
    pub async fn merge(&self, ids: Vec<BatchId>) -> Result<BatchId, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Merge { ids, resp: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    /// Fetches a batch by id.
    pub async fn get(&self, id: BatchId) -> Result<Option<BatchRecord>, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Get { id, resp: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    /// Fetches a registered map by id.
    pub async fn get_map(&self, id: MapId) -> Result<Option<GridMap>, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::GetMap { id, resp: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    /// Lists all batches in a room.
    pub async fn by_room(&self, room: RoomId) -> Result<Vec<BatchRecord>, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::ByRoom { room, resp: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    /// Computes display groups for a room.
    pub async fn groups(
        &self,
        room: RoomId,
        by_genetic: bool,
    ) -> Result<Vec<Group>, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Groups {
                room,
                by_genetic,
                resp: tx,
            })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    /// Forces a journal flush, returning the durable sequence.
    pub async fn flush(&self) -> Result<OpSeq, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Flush { resp: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    /// Writes a snapshot, optionally compacting the journal behind it.
    pub async fn checkpoint(&self) -> Result<(), RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Checkpoint { resp: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    /// Flushes, stops the persistence worker, and ends the loop.
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Shutdown { resp: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }
}

async fn handle_command(
    cmd: Command,
    store: &mut BatchStore,
    events_tx: &broadcast::Sender<BatchEvent>,
    persist_tx: Option<&mpsc::Sender<PersistMsg>>,
    config: &RuntimeConfig,
    ops_since_snapshot: &mut usize,
) -> bool {
    match cmd {
        Command::Sow { draft, resp } => {
            debug!(name = %draft.name, quantity = draft.quantity, "sow");
            let res = store
                .sow(draft)
                .map_err(RuntimeError::from)
                .map(|(id, _)| (id, vec![BatchEvent::Sown { id }]));
            let out = finish_mutation(res, store, events_tx, persist_tx, config, ops_since_snapshot)
                .await;
            let _ = resp.send(out);
        }
        Command::Patch { id, patch, resp } => {
            let res = store
                .patch(id, patch)
                .map_err(RuntimeError::from)
                .map(|_| ((), vec![BatchEvent::Updated { id }]));
            let out = finish_mutation(res, store, events_tx, persist_tx, config, ops_since_snapshot)
                .await;
            let _ = resp.send(out);
        }
        Command::AddMap { map, resp } => {
            let id = map.id;
            let res = store
                .add_map(map)
                .map_err(RuntimeError::from)
                .map(|_| ((), vec![BatchEvent::MapAdded { id }]));
            let out = finish_mutation(res, store, events_tx, persist_tx, config, ops_since_snapshot)
                .await;
            let _ = resp.send(out);
        }
        Command::PlaceFirstEmpty {
            map_id,
            sources,
            count,
            resp,
        } => {
            debug!(map_id, count, "place into first free cells");
            let res = exec_place_first_empty(store, map_id, &sources, count);
            let out = finish_mutation(res, store, events_tx, persist_tx, config, ops_since_snapshot)
                .await;
            let _ = resp.send(out);
        }
        Command::Distribute {
            map_id,
            anchor,
            requests,
            resp,
        } => {
            debug!(map_id, anchor = %anchor, "anchored distribution");
            let res = exec_distribute(store, map_id, &anchor, &requests);
            let out = finish_mutation(res, store, events_tx, persist_tx, config, ops_since_snapshot)
                .await;
            let _ = resp.send(out);
        }
        Command::Relocate {
            map_id,
            ids,
            target,
            resp,
        } => {
            debug!(map_id, target = %target, selected = ids.len(), "relocate selection");
            let res = exec_relocate(store, map_id, &ids, &target);
            let out = finish_mutation(res, store, events_tx, persist_tx, config, ops_since_snapshot)
                .await;
            let _ = resp.send(out);
        }
        Command::Discard {
            id,
            units,
            reason,
            resp,
        } => {
            let res = exec_discard(store, id, units, &reason);
            let out = finish_mutation(res, store, events_tx, persist_tx, config, ops_since_snapshot)
                .await;
            let _ = resp.send(out);
        }
        Command::Merge { ids, resp } => {
            let res = exec_merge(store, &ids);
            let out = finish_mutation(res, store, events_tx, persist_tx, config, ops_since_snapshot)
                .await;
            let _ = resp.send(out);
        }
        Command::Get { id, resp } => {
            let _ = resp.send(store.get_cloned(id));
        }
        Command::GetMap { id, resp } => {
            let _ = resp.send(store.map(id).cloned());
        }
        Command::ByRoom { room, resp } => {
            let _ = resp.send(store.by_room_cloned(room));
        }
        Command::Groups {
            room,
            by_genetic,
            resp,
        } => {
            let batches = store.by_room_cloned(room);
            let _ = resp.send(grouping::group_batches(&batches, by_genetic));
        }
        Command::Flush { resp } => {
            let out = if let Some(tx) = persist_tx {
                let (flush_tx, flush_rx) = oneshot::channel();
                if tx.send(PersistMsg::Flush { resp: flush_tx }).await.is_err() {
                    Err(RuntimeError::ChannelClosed)
                } else {
                    flush_rx
                        .await
                        .map_err(|_| RuntimeError::ChannelClosed)
                        .and_then(|r| r.map_err(RuntimeError::from))
                }
            } else {
                Ok(store.latest_op_seq())
            };
            let _ = resp.send(out);
        }
        Command::Checkpoint { resp } => {
            let out = if let Some(tx) = persist_tx {
                let snapshot = store.export_snapshot();
                let last_seq = store.latest_op_seq();
                let (cp_tx, cp_rx) = oneshot::channel();
                if tx
                    .send(PersistMsg::Checkpoint {
                        snapshot,
                        last_seq,
                        compact: config.compact_after_snapshot,
                        resp: cp_tx,
                    })
                    .await
                    .is_err()
                {
                    Err(RuntimeError::ChannelClosed)
                } else {
                    cp_rx
                        .await
                        .map_err(|_| RuntimeError::ChannelClosed)
                        .and_then(|r| r.map_err(RuntimeError::from))
                }
            } else {
                Ok(())
            };
            let _ = resp.send(out);
        }
        Command::Shutdown { resp } => {
            let out = if let Some(tx) = persist_tx {
                let (done_tx, done_rx) = oneshot::channel();
                let send_res = tx.send(PersistMsg::Shutdown { resp: done_tx }).await;
                if send_res.is_err() {
                    Err(RuntimeError::ChannelClosed)
                } else {
                    match done_rx.await {
                        Ok(()) => Ok(()),
                        Err(_) => Err(RuntimeError::ChannelClosed),
                    }
                }
            } else {
                Ok(())
            };
            let _ = resp.send(out);
            return true;
        }
    }

    false
}

/// Drains the ops a command buffered, hands them to the persistence
/// worker, and publishes the command's events on success.
///
/// Ops are drained even when the command failed: any op that reached the
/// buffer was applied to memory, and the journal must not diverge from
/// the in-memory state.
async fn finish_mutation<T>(
    res: Result<(T, Vec<BatchEvent>), RuntimeError>,
    store: &mut BatchStore,
    events_tx: &broadcast::Sender<BatchEvent>,
    persist_tx: Option<&mpsc::Sender<PersistMsg>>,
    config: &RuntimeConfig,
    ops_since_snapshot: &mut usize,
) -> Result<T, RuntimeError> {
    let ops = store.drain_pending_ops();
    let applied = ops.len();

    let mut enqueue_failure = None;
    if let Some(tx) = persist_tx {
        for stored in ops {
            if let Err(err) = enqueue_persist(tx, stored) {
                enqueue_failure = Some(err);
                break;
            }
        }
    } else if applied > 0 {
        let _ = events_tx.send(BatchEvent::DurableUpTo {
            op_seq: store.latest_op_seq(),
        });
    }

    let out = match res {
        Ok((value, events)) => {
            if let Some(err) = enqueue_failure {
                Err(err)
            } else {
                for event in events {
                    let _ = events_tx.send(event);
                }
                Ok(value)
            }
        }
        Err(err) => Err(err),
    };

    if out.is_ok() && applied > 0 {
        *ops_since_snapshot += applied;
        maybe_auto_checkpoint(store, persist_tx, config, ops_since_snapshot).await;
    }

    out
}

fn exec_place_first_empty(
    store: &mut BatchStore,
    map_id: MapId,
    sources: &[BatchId],
    count: u32,
) -> Result<(Vec<UnitAssignment>, Vec<BatchEvent>), RuntimeError> {
    let map = store
        .map(map_id)
        .cloned()
        .ok_or(StoreError::MissingMap(map_id))?;
    let occupied = store.occupied(map_id);

    let mut cands: Vec<BatchRecord> = Vec::with_capacity(sources.len());
    for &id in sources {
        let rec = store.get(id).ok_or(StoreError::MissingBatch(id))?;
        if rec.placement.is_some() {
            return Err(EngineError::InvariantViolation(format!(
                "source batch {id} is already placed"
            ))
            .into());
        }
        cands.push(rec.clone());
    }

    let refs: Vec<&BatchRecord> = cands.iter().collect();
    let draws = transfer::consume_candidates(&refs, count)?;
    let cells = placement::assign_to_first_empty(&map, &occupied, count as usize)?;

    materialize_units(store, map_id, draws, cells)
}

fn exec_distribute(
    store: &mut BatchStore,
    map_id: MapId,
    anchor: &str,
    requests: &[(BatchId, u32)],
) -> Result<(Vec<UnitAssignment>, Vec<BatchEvent>), RuntimeError> {
    let map = store
        .map(map_id)
        .cloned()
        .ok_or(StoreError::MissingMap(map_id))?;
    let occupied = store.occupied(map_id);

    // aggregate stock check before any plan or write
    let mut totals: HashMap<BatchId, u64> = HashMap::new();
    for &(id, quantity) in requests {
        *totals.entry(id).or_default() += u64::from(quantity);
    }
    for (&id, &total) in &totals {
        let rec = store.get(id).ok_or(StoreError::MissingBatch(id))?;
        if rec.placement.is_some() {
            return Err(EngineError::InvariantViolation(format!(
                "source batch {id} is already placed"
            ))
            .into());
        }
        if total > u64::from(rec.quantity) {
            return Err(EngineError::InsufficientStock {
                requested: total.min(u64::from(u32::MAX)) as u32,
                available: rec.quantity,
            }
            .into());
        }
    }

    let plan = placement::distribute_from_anchor(&map, &occupied, anchor, requests)?;

    // fold consecutive units of one batch back into draws so the
    // materializer sees each batch once per run
    let mut draws: Vec<transfer::Draw> = Vec::new();
    for ua in &plan {
        match draws.last_mut() {
            Some(last) if last.batch == ua.batch => last.units += 1,
            _ => draws.push(transfer::Draw {
                batch: ua.batch,
                units: 1,
            }),
        }
    }
    let cells: Vec<_> = plan.iter().map(|ua| ua.pos).collect();

    materialize_units(store, map_id, draws, cells)
}

/// Turns draws into store writes: each unit splits a quantity-1 child off
/// its batch, except the final unit of a fully consumed batch, which
/// moves the original record into its cell.
fn materialize_units(
    store: &mut BatchStore,
    map_id: MapId,
    draws: Vec<transfer::Draw>,
    cells: Vec<GridPos>,
) -> Result<(Vec<UnitAssignment>, Vec<BatchEvent>), RuntimeError> {
    let mut assignments = Vec::with_capacity(cells.len());
    let mut events = Vec::new();
    let mut placed_ids = Vec::new();
    let mut cell_iter = cells.into_iter();

    for draw in draws {
        let rec = store
            .get_cloned(draw.batch)
            .ok_or(StoreError::MissingBatch(draw.batch))?;
        let unit_plan = transfer::plan_units(&rec, draw.units)?;

        for unit in unit_plan {
            let Some(pos) = cell_iter.next() else {
                return Err(EngineError::InvariantViolation(
                    "cell plan shorter than unit plan".to_string(),
                )
                .into());
            };
            let placement = Placement { map_id, pos };
            match unit {
                transfer::UnitSource::Split { source } => {
                    let (child, _op) = store.split(source, 1, Some(placement))?;
                    events.push(BatchEvent::Split { source, child });
                    placed_ids.push(child);
                    assignments.push(UnitAssignment { batch: child, pos });
                }
                transfer::UnitSource::Whole { batch } => {
                    store.place(vec![PlacementMove {
                        id: batch,
                        placement: Some(placement),
                    }])?;
                    placed_ids.push(batch);
                    assignments.push(UnitAssignment { batch, pos });
                }
            }
        }
    }

    events.push(BatchEvent::Placed { ids: placed_ids });
    Ok((assignments, events))
}

fn exec_relocate(
    store: &mut BatchStore,
    map_id: MapId,
    ids: &[BatchId],
    target: &str,
) -> Result<((), Vec<BatchEvent>), RuntimeError> {
    let map = store
        .map(map_id)
        .cloned()
        .ok_or(StoreError::MissingMap(map_id))?;

    let mut selection = Vec::with_capacity(ids.len());
    for &id in ids {
        let rec = store.get(id).ok_or(StoreError::MissingBatch(id))?;
        match rec.placement {
            Some(p) if p.map_id == map_id => selection.push((id, p.pos)),
            _ => {
                return Err(EngineError::InvariantViolation(format!(
                    "batch {id} is not placed on map {map_id}"
                ))
                .into());
            }
        }
    }

    let mut occupied_others = store.occupied(map_id);
    for &(_, pos) in &selection {
        occupied_others.remove(&pos);
    }

    let moves = relocation::relocate_selection(&map, &selection, &occupied_others, target)?;
    if moves.is_empty() {
        return Ok(((), Vec::new()));
    }

    store.place(
        moves
            .iter()
            .map(|m| PlacementMove {
                id: m.batch,
                placement: Some(Placement {
                    map_id,
                    pos: m.pos,
                }),
            })
            .collect(),
    )?;

    Ok((
        (),
        vec![BatchEvent::Relocated {
            ids: moves.iter().map(|m| m.batch).collect(),
        }],
    ))
}

fn exec_discard(
    store: &mut BatchStore,
    id: BatchId,
    units: u32,
    reason: &str,
) -> Result<((), Vec<BatchEvent>), RuntimeError> {
    let rec = store.get_cloned(id).ok_or(StoreError::MissingBatch(id))?;

    match transfer::plan_discard(&rec, units)? {
        transfer::DiscardPlan::Decrement { units } => {
            let note = if reason.is_empty() {
                format!("discarded {units} of {} units", rec.quantity)
            } else {
                format!("discarded {units} of {} units: {reason}", rec.quantity)
            };
            store.quantity_delta(id, -i64::from(units), &note)?;
            Ok(((), vec![BatchEvent::Discarded { id, units }]))
        }
        transfer::DiscardPlan::Remove => {
            store.delete(id)?;
            Ok((
                (),
                vec![
                    BatchEvent::Discarded { id, units },
                    BatchEvent::Deleted { id },
                ],
            ))
        }
    }
}

fn exec_merge(
    store: &mut BatchStore,
    ids: &[BatchId],
) -> Result<(BatchId, Vec<BatchEvent>), RuntimeError> {
    let mut recs = Vec::with_capacity(ids.len());
    for &id in ids {
        recs.push(store.get_cloned(id).ok_or(StoreError::MissingBatch(id))?);
    }
    let refs: Vec<&BatchRecord> = recs.iter().collect();
    let plan = transfer::plan_merge(&refs)?;

    // survivor returns to stock before absorbing the rest
    let target_rec = store
        .get(plan.target)
        .ok_or(StoreError::MissingBatch(plan.target))?;
    if target_rec.placement.is_some() {
        store.place(vec![PlacementMove {
            id: plan.target,
            placement: None,
        }])?;
    }

    let mut events = Vec::new();
    for &absorbed_id in &plan.absorbed {
        let absorbed = store
            .get_cloned(absorbed_id)
            .ok_or(StoreError::MissingBatch(absorbed_id))?;
        let units = absorbed.quantity;
        store.quantity_delta(
            plan.target,
            i64::from(units),
            &format!("absorbed {units} units from {}", absorbed.tracking_code),
        )?;
        store.delete(absorbed_id)?;
        events.push(BatchEvent::Deleted { id: absorbed_id });
    }
    events.push(BatchEvent::Merged {
        target: plan.target,
        absorbed: plan.absorbed.clone(),
    });

    Ok((plan.target, events))
}

fn spawn_persistence_worker(
    sink: Box<dyn OpSink>,
    mut rx: mpsc::Receiver<PersistMsg>,
    durable_tx: mpsc::UnboundedSender<Result<OpSeq, PersistError>>,
    config: RuntimeConfig,
) {
    let sink = Arc::new(Mutex::new(sink));
    tokio::spawn(async move {
        let mut buf = Vec::<StoredOp>::new();
        let mut deadline = Instant::now() + Duration::from_millis(config.batch_max_latency_ms);
        let mut last_durable: OpSeq = 0;

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else {
                        let _ = flush_buf(&sink, &mut buf, &mut last_durable, &durable_tx, true).await;
                        break;
                    };

                    match msg {
                        PersistMsg::Op(stored) => {
                            let eager = is_priority_op(&stored.op);
                            buf.push(stored);

                            if buf.len() >= config.batch_max_ops || (config.eager_flush && eager) {
                                let _ = flush_buf(&sink, &mut buf, &mut last_durable, &durable_tx, true).await;
                                deadline = Instant::now() + Duration::from_millis(config.batch_max_latency_ms);
                            }
                        }
                        PersistMsg::Flush { resp } => {
                            let result = flush_buf(&sink, &mut buf, &mut last_durable, &durable_tx, true).await;
                            let _ = resp.send(result.map(|_| last_durable));
                            deadline = Instant::now() + Duration::from_millis(config.batch_max_latency_ms);
                        }
                        PersistMsg::Checkpoint { snapshot, last_seq, compact, resp } => {
                            let flush_result = flush_buf(&sink, &mut buf, &mut last_durable, &durable_tx, true).await;
                            let result = if let Err(err) = flush_result {
                                Err(err)
                            } else {
                                let sink_ref = Arc::clone(&sink);
                                match tokio::task::spawn_blocking(move || {
                                    let mut sink = sink_ref.blocking_lock();
                                    sink.write_snapshot(&snapshot, last_seq)?;
                                    if compact {
                                        let _ = sink.compact_through(last_seq)?;
                                    }
                                    Result::<(), PersistError>::Ok(())
                                }).await {
                                    Ok(inner) => inner,
                                    Err(e) => Err(PersistError::Message(format!("join error: {e}"))),
                                }
                            };
                            let _ = resp.send(result);
                            deadline = Instant::now() + Duration::from_millis(config.batch_max_latency_ms);
                        }
                        PersistMsg::Shutdown { resp } => {
                            let _ = flush_buf(&sink, &mut buf, &mut last_durable, &durable_tx, true).await;
                            let _ = resp.send(());
                            break;
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline), if !buf.is_empty() => {
                    let _ = flush_buf(&sink, &mut buf, &mut last_durable, &durable_tx, false).await;
                    deadline = Instant::now() + Duration::from_millis(config.batch_max_latency_ms);
                }
            }
        }
    });
}

fn is_priority_op(op: &Op) -> bool {
    matches!(
        op,
        Op::Sow { .. } | Op::Place { .. } | Op::Split { .. } | Op::Delete { .. }
    )
}

async fn flush_buf(
    sink: &Arc<Mutex<Box<dyn OpSink>>>,
    buf: &mut Vec<StoredOp>,
    last_durable: &mut OpSeq,
    durable_tx: &mpsc::UnboundedSender<Result<OpSeq, PersistError>>,
    call_flush: bool,
) -> Result<(), PersistError> {
    if buf.is_empty() {
        if call_flush {
            let sink_ref = Arc::clone(sink);
            tokio::task::spawn_blocking(move || {
                let mut sink = sink_ref.blocking_lock();
                sink.flush()
            })
            .await
            .map_err(|e| PersistError::Message(format!("join error: {e}")))??;
        }
        return Ok(());
    }

    let ops = std::mem::take(buf);
    let sink_ref = Arc::clone(sink);
    let append_res: Result<OpSeq, PersistError> = tokio::task::spawn_blocking(move || {
        let mut sink = sink_ref.blocking_lock();
        let seq = sink.append_ops(&ops)?;
        if call_flush {
            sink.flush()?;
        }
        Ok(seq)
    })
    .await
    .map_err(|e| PersistError::Message(format!("join error: {e}")))?;

    match append_res {
        Ok(seq) => {
            *last_durable = (*last_durable).max(seq);
            let _ = durable_tx.send(Ok(*last_durable));
            Ok(())
        }
        Err(err) => {
            warn!(error = %err, "journal append failed");
            let _ = durable_tx.send(Err(PersistError::Message(format!("append failed: {err}"))));
            Err(err)
        }
    }
}

async fn maybe_auto_checkpoint(
    store: &BatchStore,
    persist_tx: Option<&mpsc::Sender<PersistMsg>>,
    config: &RuntimeConfig,
    ops_since_snapshot: &mut usize,
) {
    if config.snapshot_every_ops == 0 || *ops_since_snapshot < config.snapshot_every_ops {
        return;
    }

    let Some(tx) = persist_tx else {
        return;
    };

    let snapshot = store.export_snapshot();
    let last_seq = store.latest_op_seq();
    let (cp_tx, cp_rx) = oneshot::channel();
    if tx
        .send(PersistMsg::Checkpoint {
            snapshot,
            last_seq,
            compact: config.compact_after_snapshot,
            resp: cp_tx,
        })
        .await
        .is_ok()
    {
        let _ = cp_rx.await;
        *ops_since_snapshot = 0;
    }
}

fn enqueue_persist(tx: &mpsc::Sender<PersistMsg>, stored: StoredOp) -> Result<(), RuntimeError> {
    tx.try_send(PersistMsg::Op(stored)).map_err(|err| {
        warn!(error = %err, "persist queue rejected op");
        RuntimeError::Persist(PersistError::Message(format!("persist queue error: {err}")))
    })
}
