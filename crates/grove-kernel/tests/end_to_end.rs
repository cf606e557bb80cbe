//! End-to-end scenarios over the assembled kernel: write path through the
//! event log, compaction, time travel, view routing, and cache behaviour.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use grove_kernel::prelude::*;
use grove_kernel::{GraphKernel, KernelConfig};
use grove_store_core::StorageBackend;
use grove_store_memory::MemoryStore;
use grove_txn::{TransactionalStore, run_in_transaction};

fn update_count(n: i64) -> Option<Value> {
    Some(Value::map([("updateCount", Value::Int(n))]))
}

async fn open_kernel() -> GraphKernel {
    let store = Arc::new(MemoryStore::new());
    GraphKernel::open(KernelConfig::new(store, "graph")).await.unwrap()
}

#[tokio::test]
async fn dedup_fold_through_kernel() {
    // 50 entities x (1 CREATE + 3 UPDATE): 200 events, 50 survivors, every
    // final state carries updateCount = 3.
    let kernel = open_kernel().await;
    for i in 0..50 {
        let target = format!("user:u{i:02}");
        kernel
            .record(Event::new(1_000 + i, Op::Create, target.clone(), update_count(0)))
            .await
            .unwrap();
        for step in 1..=3 {
            kernel
                .record(Event::new(
                    1_000 + i + step * 1_000,
                    Op::Update,
                    target.clone(),
                    update_count(step),
                ))
                .await
                .unwrap();
        }
    }
    kernel.flush().await.unwrap();

    let report = kernel.compact(10_000, true, None).await.unwrap();
    assert_eq!(report.events_processed, 200);
    assert_eq!(report.entity_count, 50);
    assert!(report.snapshot_path.is_some());

    for i in 0..50 {
        let record = kernel
            .get_entity(&format!("user:u{i:02}"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            record.state.as_ref().and_then(|s| s.get("updateCount")),
            Some(&Value::Int(3))
        );
    }
}

#[tokio::test]
async fn delete_then_recreate_with_time_travel() {
    let kernel = open_kernel().await;
    kernel
        .record(Event::new(1_000, Op::Create, "user:a", Some(Value::map([("name", Value::Str("v1".into()))]))))
        .await
        .unwrap();
    kernel.record(Event::new(2_000, Op::Delete, "user:a", None)).await.unwrap();
    kernel
        .record(Event::new(3_000, Op::Create, "user:a", Some(Value::map([("name", Value::Str("v2".into()))]))))
        .await
        .unwrap();
    kernel.flush().await.unwrap();

    let report = kernel.compact(5_000, false, None).await.unwrap();
    assert_eq!(report.entity_count, 1);

    let current = kernel.get_entity("user:a").await.unwrap().unwrap();
    assert_eq!(
        current.state.as_ref().and_then(|s| s.get("name")),
        Some(&Value::Str("v2".into()))
    );

    // Between the delete and the recreate the entity did not exist.
    let between = kernel.entity_at("user:a", 2_500).await.unwrap();
    assert!(!between.existed);

    // History shows all three transitions regardless of range queries.
    let history = kernel.history("user:a", HistoryRange::default()).await.unwrap();
    assert_eq!(history.len(), 3);
}

#[tokio::test]
async fn out_of_order_timestamps_resolved_by_compaction() {
    let kernel = open_kernel().await;
    kernel
        .record_batch(vec![
            Event::new(3_000, Op::Update, "user:x", update_count(3)),
            Event::new(1_000, Op::Create, "user:x", update_count(1)),
            Event::new(2_000, Op::Update, "user:x", update_count(2)),
        ])
        .await
        .unwrap();
    kernel.flush().await.unwrap();
    kernel.compact(9_000, false, None).await.unwrap();

    let record = kernel.get_entity("user:x").await.unwrap().unwrap();
    assert_eq!(record.last_event_ts, 3_000);
    assert_eq!(
        record.state.as_ref().and_then(|s| s.get("updateCount")),
        Some(&Value::Int(3))
    );
}

#[tokio::test]
async fn lru_eviction_with_stats() {
    // Capacity 3: insert K1..K3, touch K1, insert K4; K2 is the evictee.
    let evicted: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = evicted.clone();

    let store = Arc::new(MemoryStore::new());
    let mut config = KernelConfig::new(store, "graph");
    config.max_cache_size = 3;
    config.on_cache_evict = Some(Box::new(move |key, _record: &StateRecord| {
        seen.lock().unwrap().push(key.to_string());
    }));
    let kernel = GraphKernel::open(config).await.unwrap();

    for (ts, target) in [(100, "user:k1"), (200, "user:k2"), (300, "user:k3")] {
        kernel.record(Event::new(ts, Op::Create, target, update_count(0))).await.unwrap();
    }
    kernel.flush().await.unwrap();

    // Populate the cache in K1..K3 order.
    for target in ["user:k1", "user:k2", "user:k3"] {
        kernel.get_entity(target).await.unwrap();
    }
    // Promote K1.
    kernel.get_entity("user:k1").await.unwrap();

    // A fourth entity forces one eviction: K2.
    kernel.record(Event::new(400, Op::Create, "user:k4", update_count(0))).await.unwrap();
    kernel.get_entity("user:k4").await.unwrap();

    assert_eq!(*evicted.lock().unwrap(), vec!["user:k2"]);
    let stats = kernel.cache_stats().await;
    assert_eq!(stats.evictions, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.size, 3);
}

#[tokio::test]
async fn view_handlers_receive_sealed_batches() {
    struct Collector {
        namespaces: Vec<String>,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ViewHandler for Collector {
        fn name(&self) -> &str {
            "collector"
        }

        fn source_namespaces(&self) -> &[String] {
            &self.namespaces
        }

        async fn process(&self, events: &[Event]) -> anyhow::Result<()> {
            self.seen
                .lock()
                .unwrap()
                .extend(events.iter().map(|e| e.target.clone()));
            Ok(())
        }
    }

    let kernel = open_kernel().await;
    let handler = Arc::new(Collector {
        namespaces: vec!["user".to_string()],
        seen: Mutex::new(Vec::new()),
    });
    kernel.register_view(handler.clone()).await;

    kernel.record(Event::new(100, Op::Create, "user:a", update_count(0))).await.unwrap();
    kernel.record(Event::new(200, Op::Create, "doc:readme", update_count(0))).await.unwrap();

    // Nothing delivered before the commit point.
    assert!(handler.seen.lock().unwrap().is_empty());
    kernel.flush().await.unwrap();

    assert_eq!(*handler.seen.lock().unwrap(), vec!["user:a"]);
}

#[tokio::test]
async fn transactional_overlay_over_kernel_storage() {
    // The kernel's storage composes with the transactional overlay: a
    // rolled-back transaction leaves no trace, a committed one lands.
    let base: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let store = TransactionalStore::wrap(base.clone());

    let failed: Result<(), _> = run_in_transaction(&store, |tx| async move {
        tx.write("graph/aux/pending.json", b"{}").await?;
        Err(grove_store_core::StoreError::FileNotFound { path: "forced".into() })
    })
    .await;
    assert!(failed.is_err());
    assert!(!base.exists("graph/aux/pending.json").await.unwrap());

    run_in_transaction(&store, |tx| async move {
        tx.write("graph/aux/committed.json", b"{}").await?;
        Ok(())
    })
    .await
    .unwrap();
    assert!(base.exists("graph/aux/committed.json").await.unwrap());
}

#[tokio::test]
async fn snapshot_accelerated_time_travel() {
    let kernel = open_kernel().await;
    for i in 1..=150 {
        kernel
            .record(Event::new(i * 10, Op::Update, "user:hot", update_count(i)))
            .await
            .unwrap();
    }
    kernel.flush().await.unwrap();

    // First query replays everything and persists a snapshot (threshold
    // 100 in the default tuning).
    let first = kernel.entity_at("user:hot", 1_500).await.unwrap();
    assert!(first.existed);
    assert_eq!(first.events_replayed, 150);
    assert_eq!(kernel.snapshots().list().await.unwrap(), vec![1_500]);

    // The second query starts from the snapshot.
    let second = kernel.entity_at("user:hot", 1_500).await.unwrap();
    assert!(second.used_snapshot);
    assert_eq!(second.snapshot_ts, Some(1_500));
    assert_eq!(second.events_from_snapshot, Some(0));
    assert_eq!(
        second.state.as_ref().and_then(|s| s.get("updateCount")),
        Some(&Value::Int(150))
    );
}
