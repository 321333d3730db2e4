use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use batchgrid::{
    batch::{BatchDraft, BatchPatch},
    core::store::BatchStore,
    grid::{GridMap, GridPos},
    persist::OpSink,
    runtime::{
        events::BatchEvent,
        handle::{RuntimeConfig, RuntimeError, spawn_batchgrid},
    },
    types::{OpSeq, Stage},
};

fn draft(name: &str, quantity: u32, created_ms: u64) -> BatchDraft {
    BatchDraft {
        name: name.to_string(),
        genetic_id: Some(5),
        tracking_code: None,
        stage: Stage::Seedling,
        quantity,
        room_id: Some(1),
        placement: None,
        notes: String::new(),
        created_ms,
        start_ms: created_ms,
    }
}

fn map() -> GridMap {
    GridMap {
        id: 1,
        room_id: 1,
        rows: 2,
        cols: 2,
    }
}

struct SlowSink {
    seen: Arc<Mutex<Vec<OpSeq>>>,
    delay: Duration,
}

impl OpSink for SlowSink {
    fn append_ops(
        &mut self,
        ops: &[batchgrid::op::StoredOp],
    ) -> batchgrid::persist::PersistResult<OpSeq> {
        std::thread::sleep(self.delay);
        let mut seen = self.seen.lock().expect("lock");
        for op in ops {
            seen.push(op.seq);
        }
        Ok(ops.last().map(|o| o.seq).unwrap_or(0))
    }
}

#[tokio::test]
async fn runtime_distribute_splits_and_events_are_ordered() {
    let handle = spawn_batchgrid(BatchStore::new(), None, RuntimeConfig::default());
    let mut sub = handle.subscribe();

    handle.add_map(map()).await.expect("map");
    let id = handle.sow(draft("Aurora", 3, 1)).await.expect("sow");

    let placed = handle
        .distribute(1, "A1", vec![(id, 3)])
        .await
        .expect("distribute");
    let labels: Vec<String> = placed.iter().map(|ua| ua.pos.label()).collect();
    assert_eq!(labels, ["A1", "A2", "B1"]);
    // two splits then the original takes the last cell
    assert_eq!(placed[2].batch, id);
    assert_ne!(placed[0].batch, id);

    let original = handle.get(id).await.expect("get").expect("record");
    assert_eq!(original.quantity, 1);
    assert_eq!(original.placement.map(|p| p.pos), Some(GridPos::new(2, 1)));

    let groups = handle.groups(1, false).await.expect("groups");
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].members.len(), 3);
    assert_eq!(groups[0].total_quantity, 3);

    let mut seen = Vec::new();
    while seen.len() < 5 {
        let evt = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("event")
            .expect("recv");
        if !matches!(evt, BatchEvent::DurableUpTo { .. }) {
            seen.push(evt);
        }
    }

    assert_eq!(seen[0], BatchEvent::MapAdded { id: 1 });
    assert_eq!(seen[1], BatchEvent::Sown { id });
    assert!(matches!(seen[2], BatchEvent::Split { source, .. } if source == id));
    assert!(matches!(seen[3], BatchEvent::Split { source, .. } if source == id));
    assert!(matches!(&seen[4], BatchEvent::Placed { ids } if ids.len() == 3));

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn runtime_relocate_is_all_or_nothing() {
    let handle = spawn_batchgrid(BatchStore::new(), None, RuntimeConfig::default());

    handle.add_map(map()).await.expect("map");
    let a = handle.sow(draft("Aurora", 1, 1)).await.expect("sow a");
    let b = handle.sow(draft("Borealis", 1, 2)).await.expect("sow b");
    handle
        .place_first_empty(1, vec![a, b], 2)
        .await
        .expect("place");

    // a at A1, b at A2; pushing the pair to B2 runs b off the grid
    let err = handle
        .relocate(1, vec![a, b], "B2")
        .await
        .expect_err("bounds");
    assert!(matches!(err, RuntimeError::Engine(_)));

    let rec_a = handle.get(a).await.expect("get").expect("a");
    let rec_b = handle.get(b).await.expect("get").expect("b");
    assert_eq!(rec_a.placement.map(|p| p.pos.label()), Some("A1".to_string()));
    assert_eq!(rec_b.placement.map(|p| p.pos.label()), Some("A2".to_string()));

    handle.relocate(1, vec![a, b], "B1").await.expect("fits");
    let rec_a = handle.get(a).await.expect("get").expect("a");
    assert_eq!(rec_a.placement.map(|p| p.pos.label()), Some("B1".to_string()));

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn runtime_patch_and_discard_round_trip() {
    let handle = spawn_batchgrid(BatchStore::new(), None, RuntimeConfig::default());

    handle.add_map(map()).await.expect("map");
    let id = handle.sow(draft("Aurora", 4, 1)).await.expect("sow");

    handle
        .patch(
            id,
            BatchPatch {
                stage: Some(Stage::Flowering),
                ..BatchPatch::default()
            },
        )
        .await
        .expect("patch");

    handle.discard(id, 3, "mold").await.expect("partial");
    let rec = handle.get(id).await.expect("get").expect("record");
    assert_eq!(rec.quantity, 1);
    assert_eq!(rec.stage, Stage::Flowering);
    assert!(rec.notes.contains("mold"));

    handle.discard(id, 1, "final").await.expect("full");
    assert!(handle.get(id).await.expect("get").is_none());

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn durable_event_advances_and_slow_sink_surfaces_queue_pressure() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = SlowSink {
        seen: Arc::clone(&seen),
        delay: Duration::from_millis(250),
    };

    let cfg = RuntimeConfig {
        eager_flush: true,
        batch_max_ops: 16,
        batch_max_latency_ms: 500,
        persist_queue_bound: 1,
        snapshot_every_ops: 0,
        compact_after_snapshot: false,
    };

    let handle = spawn_batchgrid(BatchStore::new(), Some(Box::new(sink)), cfg);
    let mut sub = handle.subscribe();

    let id = handle.sow(draft("Aurora", 1, 1)).await.expect("sow");
    assert_eq!(id, 1);

    let mut durable_seen = false;
    for _ in 0..5 {
        let evt = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("recv timeout")
            .expect("recv");
        if matches!(evt, BatchEvent::DurableUpTo { .. }) {
            durable_seen = true;
            break;
        }
    }
    assert!(durable_seen, "expected DurableUpTo event");

    let mut queue_error_seen = false;
    for i in 0..12u64 {
        let r = handle.sow(draft(&format!("Lote {i}"), 1, i + 2)).await;
        if let Err(RuntimeError::Persist(_)) = r {
            queue_error_seen = true;
            break;
        }
    }
    assert!(
        queue_error_seen,
        "expected persistence queue pressure to surface as error"
    );

    handle.shutdown().await.expect("shutdown");
    assert!(!seen.lock().expect("lock").is_empty());
}
