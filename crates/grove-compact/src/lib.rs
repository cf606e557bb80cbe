#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **grove-compact** – Compaction engine for Grove.
//!
//! Compaction reads a prefix of the event log up to a watermark, folds it
//! into keyed entity and relationship state, and emits the result through a
//! pluggable [`StateWriter`] plus an optional immutable snapshot. The run is
//! all-or-nothing: a malformed row fails the whole compaction, the manifest
//! is untouched, and the error carries a resume cursor pointing at the last
//! fully processed segment.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use grove_log::EventLog;
use grove_types::EventId;

pub mod fold;
pub mod snapshot;

pub use fold::{FoldState, StateRecord, sort_events};
pub use snapshot::{Snapshot, SnapshotStore};

//─────────────────────────────
//  Error type
//─────────────────────────────

/// Errors produced by the compaction engine.
#[derive(Debug, thiserror::Error)]
pub enum CompactError {
    /// A segment could not be decoded. `resume_from` is the seq of the
    /// last fully processed segment; a retry starts after it.
    #[error("corrupt segment {segment_seq} (resume from {resume_from}): {message}")]
    CorruptSegment {
        /// Segment that failed.
        segment_seq: u64,
        /// Last fully processed segment seq (0 when none).
        resume_from: u64,
        /// Decoder diagnostic.
        message: String,
    },
    /// An event inside a segment violated the target grammar.
    #[error("malformed event {event_id} (resume from {resume_from}): {message}")]
    MalformedEvent {
        /// Offending event.
        event_id: EventId,
        /// Last fully processed segment seq (0 when none).
        resume_from: u64,
        /// What was wrong.
        message: String,
    },
    /// The pluggable state writer failed.
    #[error("state writer failed: {source}")]
    StateWriter {
        /// Writer error.
        #[source]
        source: anyhow::Error,
    },
    /// A snapshot could not be encoded or decoded.
    #[error("snapshot {path}: {message}")]
    Snapshot {
        /// Snapshot path.
        path: String,
        /// Codec diagnostic.
        message: String,
    },
    /// The run was cancelled between suspension points; no state was
    /// emitted.
    #[error("compaction cancelled")]
    Cancelled,
    /// Event-log failure.
    #[error(transparent)]
    Log(#[from] grove_log::LogError),
    /// Storage failure.
    #[error(transparent)]
    Store(#[from] grove_store_core::StoreError),
}

/// Result alias for this crate.
pub type Result<T, E = CompactError> = std::result::Result<T, E>;

//─────────────────────────────
//  State writer
//─────────────────────────────

/// Destination for compacted state, e.g. columnar table files. Records
/// arrive in ascending key order and only for existing targets.
#[async_trait]
pub trait StateWriter: Send + Sync {
    /// Write the entity states.
    async fn write_entities(&self, records: &[StateRecord]) -> anyhow::Result<()>;

    /// Write the relationship states.
    async fn write_relationships(&self, records: &[StateRecord]) -> anyhow::Result<()>;
}

//─────────────────────────────
//  Compaction engine
//─────────────────────────────

/// Options for one compaction run.
#[derive(Clone, Default)]
pub struct CompactionOptions {
    /// Watermark: only events with `ts <= through_ts` are folded.
    pub through_ts: i64,
    /// Destination for the folded state.
    pub state_writer: Option<Arc<dyn StateWriter>>,
    /// Persist a snapshot at `snapshots/<through_ts>`.
    pub emit_snapshot: bool,
    /// Cooperative cancellation; checked between segment reads.
    pub cancel: Option<CancellationToken>,
}

/// Outcome of a compaction run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompactionReport {
    /// Events folded (those with `ts <= through_ts` across the listed
    /// segments).
    pub events_processed: usize,
    /// Keys with `exists = true` in the entity map.
    pub entity_count: usize,
    /// Keys with `exists = true` in the relationship map.
    pub relationship_count: usize,
    /// Seqs of the segments that contributed events.
    pub segments_compacted: Vec<u64>,
    /// Path of the emitted snapshot, when requested.
    pub snapshot_path: Option<String>,
}

/// The compaction engine over one event log.
pub struct Compactor {
    log: Arc<EventLog>,
    snapshots: SnapshotStore,
}

impl Compactor {
    /// Build a compactor over `log`, persisting snapshots beside it.
    pub fn new(log: Arc<EventLog>, store: Arc<dyn grove_store_core::StorageBackend>) -> Self {
        let snapshots = SnapshotStore::new(store, log.dataset());
        Self { log, snapshots }
    }

    /// The snapshot store used for emitted snapshots.
    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    /// Run one compaction. See the crate docs for the all-or-nothing and
    /// resume-cursor semantics.
    pub async fn compact(&self, opts: CompactionOptions) -> Result<(CompactionReport, FoldState)> {
        let segments = self.log.list_segments().await;
        let eligible: Vec<_> = segments
            .into_iter()
            .filter(|s| s.min_ts <= opts.through_ts)
            .collect();
        debug!(
            through_ts = opts.through_ts,
            segments = eligible.len(),
            "compaction started"
        );

        let mut kept = Vec::new();
        let mut resume_from = 0;
        let mut segments_compacted = Vec::new();
        for meta in &eligible {
            if let Some(cancel) = &opts.cancel {
                if cancel.is_cancelled() {
                    return Err(CompactError::Cancelled);
                }
            }
            let events = self.log.open_segment(meta.seq).await.map_err(|e| match e {
                grove_log::LogError::Corrupt { message, .. } => CompactError::CorruptSegment {
                    segment_seq: meta.seq,
                    resume_from,
                    message,
                },
                other => CompactError::Log(other),
            })?;
            kept.extend(events.into_iter().filter(|e| e.ts <= opts.through_ts));
            resume_from = meta.seq;
            segments_compacted.push(meta.seq);
        }

        sort_events(&mut kept);
        let mut fold = FoldState::default();
        fold.apply_all(&kept).map_err(|e| match e {
            CompactError::MalformedEvent { event_id, message, .. } => {
                CompactError::MalformedEvent { event_id, resume_from, message }
            }
            other => other,
        })?;

        let entities = fold.existing_entities();
        let relationships = fold.existing_relationships();
        if let Some(writer) = &opts.state_writer {
            writer
                .write_entities(&entities)
                .await
                .map_err(|source| CompactError::StateWriter { source })?;
            writer
                .write_relationships(&relationships)
                .await
                .map_err(|source| CompactError::StateWriter { source })?;
        }

        let snapshot_path = if opts.emit_snapshot {
            let snapshot = Snapshot::from_fold(opts.through_ts, &fold);
            Some(self.snapshots.save(&snapshot).await?)
        } else {
            None
        };

        let report = CompactionReport {
            events_processed: kept.len(),
            entity_count: fold.entity_count(),
            relationship_count: fold.relationship_count(),
            segments_compacted,
            snapshot_path,
        };
        info!(
            events = report.events_processed,
            entities = report.entity_count,
            relationships = report.relationship_count,
            "compaction finished"
        );
        Ok((report, fold))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grove_log::{ScanOptions, SegmentLimits};
    use grove_store_core::StorageBackend;
    use grove_store_memory::MemoryStore;
    use grove_types::{Event, Op, Value};
    use std::sync::Mutex;

    async fn log_with_limits(max_rows: usize) -> (Arc<MemoryStore>, Arc<EventLog>) {
        let store = Arc::new(MemoryStore::new());
        let log = EventLog::open(
            store.clone(),
            "ds",
            SegmentLimits { max_rows, max_bytes: 1 << 20 },
        )
        .await
        .unwrap();
        (store, Arc::new(log))
    }

    fn update_count(n: i64) -> Option<Value> {
        Some(Value::map([("updateCount", Value::Int(n))]))
    }

    #[tokio::test]
    async fn test_dedup_fold_scenario() {
        // 50 entities x (1 CREATE + 3 UPDATE) = 200 events.
        let (store, log) = log_with_limits(64).await;
        for i in 0..50 {
            let target = format!("user:u{i:02}");
            log.append(Event::new(1000 + i, Op::Create, target.clone(), update_count(0)))
                .await
                .unwrap();
            for step in 1..=3 {
                log.append(Event::new(
                    1000 + i + step * 1000,
                    Op::Update,
                    target.clone(),
                    update_count(step),
                ))
                .await
                .unwrap();
            }
        }
        log.flush().await.unwrap();

        let compactor = Compactor::new(log, store);
        let (report, fold) = compactor
            .compact(CompactionOptions { through_ts: 10_000, ..Default::default() })
            .await
            .unwrap();

        assert_eq!(report.events_processed, 200);
        assert_eq!(report.entity_count, 50);
        assert_eq!(report.relationship_count, 0);
        for record in fold.existing_entities() {
            assert_eq!(
                record.state.as_ref().and_then(|s| s.get("updateCount")),
                Some(&Value::Int(3)),
                "{}",
                record.key
            );
        }
    }

    #[tokio::test]
    async fn test_delete_then_recreate() {
        let (store, log) = log_with_limits(64).await;
        log.append(Event::new(1000, Op::Create, "user:a", Some(Value::map([("name", Value::Str("v1".into()))]))))
            .await
            .unwrap();
        log.append(Event::new(2000, Op::Delete, "user:a", None)).await.unwrap();
        log.append(Event::new(3000, Op::Create, "user:a", Some(Value::map([("name", Value::Str("v2".into()))]))))
            .await
            .unwrap();
        log.flush().await.unwrap();

        let compactor = Compactor::new(log, store);
        let (report, fold) = compactor
            .compact(CompactionOptions { through_ts: 5000, ..Default::default() })
            .await
            .unwrap();

        assert_eq!(report.entity_count, 1);
        let record = &fold.entities["user:a"];
        assert_eq!(
            record.state.as_ref().and_then(|s| s.get("name")),
            Some(&Value::Str("v2".into()))
        );
    }

    #[tokio::test]
    async fn test_out_of_order_within_segment() {
        let (store, log) = log_with_limits(64).await;
        log.append_batch(vec![
            Event::new(3000, Op::Update, "user:a", update_count(3)),
            Event::new(1000, Op::Create, "user:a", update_count(1)),
            Event::new(2000, Op::Update, "user:a", update_count(2)),
        ])
        .await
        .unwrap();
        log.flush().await.unwrap();

        let compactor = Compactor::new(log, store);
        let (_, fold) = compactor
            .compact(CompactionOptions { through_ts: 9000, ..Default::default() })
            .await
            .unwrap();

        let record = &fold.entities["user:a"];
        assert_eq!(record.last_event_ts, 3000);
        assert_eq!(
            record.state.as_ref().and_then(|s| s.get("updateCount")),
            Some(&Value::Int(3))
        );
    }

    #[tokio::test]
    async fn test_watermark_filters_and_counts() {
        let (store, log) = log_with_limits(2).await;
        for ts in [100, 200, 300, 400, 500] {
            log.append(Event::new(ts, Op::Create, format!("user:t{ts}"), update_count(0)))
                .await
                .unwrap();
        }
        log.flush().await.unwrap();

        let compactor = Compactor::new(log, store);
        let (report, _) = compactor
            .compact(CompactionOptions { through_ts: 350, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(report.events_processed, 3);
        assert_eq!(report.entity_count, 3);
    }

    #[tokio::test]
    async fn test_empty_log_compacts_to_zero() {
        let (store, log) = log_with_limits(8).await;
        let compactor = Compactor::new(log, store);
        let (report, fold) = compactor
            .compact(CompactionOptions { through_ts: 1000, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(report, CompactionReport::default());
        assert_eq!(fold, FoldState::default());
    }

    #[tokio::test]
    async fn test_snapshot_emission() {
        let (store, log) = log_with_limits(8).await;
        log.append(Event::new(100, Op::Create, "user:a", update_count(0))).await.unwrap();
        log.flush().await.unwrap();

        let compactor = Compactor::new(log, store);
        let (report, _) = compactor
            .compact(CompactionOptions { through_ts: 500, emit_snapshot: true, ..Default::default() })
            .await
            .unwrap();

        assert_eq!(report.snapshot_path.as_deref(), Some("ds/snapshots/500"));
        let snapshot = compactor.snapshots().load(500).await.unwrap();
        assert_eq!(snapshot.entities.len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_segment_aborts_with_resume_cursor() {
        let (store, log) = log_with_limits(2).await;
        for i in 0..6 {
            log.append(Event::new(i, Op::Create, format!("user:u{i}"), update_count(0)))
                .await
                .unwrap();
        }
        // Corrupt the middle segment file behind the log's back.
        let segments = log.list_segments().await;
        assert_eq!(segments.len(), 3);
        store
            .write(
                &segments[1].path,
                b"garbage",
                grove_store_core::WriteOptions::default(),
            )
            .await
            .unwrap();

        let compactor = Compactor::new(log, store);
        match compactor
            .compact(CompactionOptions { through_ts: 100, ..Default::default() })
            .await
        {
            Err(CompactError::CorruptSegment { segment_seq, resume_from, .. }) => {
                assert_eq!(segment_seq, 2);
                assert_eq!(resume_from, 1);
            }
            other => panic!("expected CorruptSegment, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_event_aborts_with_resume_cursor() {
        let (store, log) = log_with_limits(2).await;
        for i in 0..4 {
            log.append(Event::new(i, Op::Create, format!("user:u{i}"), update_count(0)))
                .await
                .unwrap();
        }
        // Replace the first segment with one holding a row whose target
        // fails the grammar; decoding still succeeds, the fold does not.
        let segments = log.list_segments().await;
        assert_eq!(segments.len(), 2);
        let bad_rows = vec![Event::new(0, Op::Create, "no-colon", update_count(0))];
        store
            .write(
                &segments[0].path,
                &grove_log::segment::encode_segment(&bad_rows).unwrap(),
                grove_store_core::WriteOptions::default(),
            )
            .await
            .unwrap();

        let compactor = Compactor::new(log, store);
        match compactor
            .compact(CompactionOptions { through_ts: 100, ..Default::default() })
            .await
        {
            Err(CompactError::MalformedEvent { resume_from, .. }) => {
                // Both segments were fully read before the fold ran.
                assert_eq!(resume_from, 2);
            }
            other => panic!("expected MalformedEvent, got {other:?}"),
        }
        assert!(compactor.snapshots().list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_state_writer_receives_sorted_existing_records() {
        struct Capture {
            entities: Mutex<Vec<String>>,
        }

        #[async_trait]
        impl StateWriter for Capture {
            async fn write_entities(&self, records: &[StateRecord]) -> anyhow::Result<()> {
                let mut keys = self.entities.lock().unwrap();
                *keys = records.iter().map(|r| r.key.clone()).collect();
                Ok(())
            }

            async fn write_relationships(&self, _records: &[StateRecord]) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let (store, log) = log_with_limits(16).await;
        for target in ["user:c", "user:a", "user:b"] {
            log.append(Event::new(1, Op::Create, target, update_count(0))).await.unwrap();
        }
        log.append(Event::new(2, Op::Delete, "user:b", None)).await.unwrap();
        log.flush().await.unwrap();

        let writer = Arc::new(Capture { entities: Mutex::new(Vec::new()) });
        let compactor = Compactor::new(log, store);
        compactor
            .compact(CompactionOptions {
                through_ts: 10,
                state_writer: Some(writer.clone()),
                ..Default::default()
            })
            .await
            .unwrap();

        // Ascending key order, deleted entity excluded.
        assert_eq!(*writer.entities.lock().unwrap(), vec!["user:a", "user:c"]);
    }

    #[tokio::test]
    async fn test_cancellation_leaves_no_side_effects() {
        let (store, log) = log_with_limits(2).await;
        for i in 0..4 {
            log.append(Event::new(i, Op::Create, format!("user:u{i}"), update_count(0)))
                .await
                .unwrap();
        }
        let cancel = CancellationToken::new();
        cancel.cancel();

        let compactor = Compactor::new(log.clone(), store);
        assert!(matches!(
            compactor
                .compact(CompactionOptions {
                    through_ts: 100,
                    emit_snapshot: true,
                    cancel: Some(cancel),
                    ..Default::default()
                })
                .await,
            Err(CompactError::Cancelled)
        ));
        assert!(compactor.snapshots().list().await.unwrap().is_empty());
        // The log itself is untouched.
        assert_eq!(log.scan_collect(ScanOptions::default()).await.unwrap().len(), 4);
    }
}
