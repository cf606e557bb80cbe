#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **grove-kernel** – Storage kernel facade for Grove.
//!
//! A [`GraphKernel`] owns everything one storage scope needs: the event
//! log, the compaction engine, the time-travel replayer, the LRU entity
//! cache, and the materialized-view router. Reads go to the cache first,
//! fall through to the latest compacted state, and finish with replay over
//! the events past the compaction watermark, so a caller always observes
//! its own recorded events.
//!
//! There is no process-global state; every collaborator is owned by the
//! kernel and scoped to its dataset.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use grove_cache::{CacheStats, EvictCallback, LruCache};
use grove_compact::{
    CompactionOptions, CompactionReport, Compactor, FoldState, SnapshotStore, StateRecord,
    StateWriter, sort_events,
};
use grove_log::{ContentSampler, EventLog, SamplingConfig, ScanOptions, SegmentLimits, ViewHandler, ViewRouter};
use grove_replay::{HistoryRange, ReplayOptions, ReplayOutcome, Replayer, StateVersion};
use grove_store_core::StorageBackend;
use grove_types::{Event, TargetKey};

//─────────────────────────────
//  Error type
//─────────────────────────────

/// Errors surfaced by the kernel facade.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// Event-log failure.
    #[error(transparent)]
    Log(#[from] grove_log::LogError),
    /// Compaction failure.
    #[error(transparent)]
    Compact(#[from] grove_compact::CompactError),
    /// Replay failure.
    #[error(transparent)]
    Replay(#[from] grove_replay::ReplayError),
    /// Storage failure.
    #[error(transparent)]
    Store(#[from] grove_store_core::StoreError),
    /// A target string failed the grammar.
    #[error("invalid target {target:?}")]
    BadTarget {
        /// Offending target.
        target: String,
        /// Grammar violation.
        #[source]
        source: grove_types::InvalidTarget,
    },
}

/// Result alias for this crate.
pub type Result<T, E = KernelError> = std::result::Result<T, E>;

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Compaction and segment tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct CompactionTuning {
    /// Seal a segment after this many rows.
    pub segment_max_rows: usize,
    /// Seal a segment after this many bytes.
    pub segment_max_bytes: usize,
    /// Replay event count past which a snapshot is persisted.
    pub snapshot_threshold: usize,
}

impl Default for CompactionTuning {
    fn default() -> Self {
        Self {
            segment_max_rows: 1024,
            segment_max_bytes: 4 * 1024 * 1024,
            snapshot_threshold: 100,
        }
    }
}

/// Kernel configuration for one storage scope.
pub struct KernelConfig {
    /// Storage backend every component runs on.
    pub storage: Arc<dyn StorageBackend>,
    /// Dataset prefix inside the backend.
    pub dataset: String,
    /// Entity-cache capacity; 0 means unbounded.
    pub max_cache_size: usize,
    /// Optional synchronous eviction callback.
    pub on_cache_evict: Option<EvictCallback<StateRecord>>,
    /// Compaction and segment tuning.
    pub compaction: CompactionTuning,
    /// Content sampling for materialized-view handlers.
    pub sampling: SamplingConfig,
}

impl KernelConfig {
    /// Minimal configuration over a backend and dataset.
    pub fn new(storage: Arc<dyn StorageBackend>, dataset: impl Into<String>) -> Self {
        Self {
            storage,
            dataset: dataset.into(),
            max_cache_size: 0,
            on_cache_evict: None,
            compaction: CompactionTuning::default(),
            sampling: SamplingConfig::default(),
        }
    }
}

//─────────────────────────────
//  Kernel
//─────────────────────────────

/// The assembled storage kernel for one scope.
pub struct GraphKernel {
    log: Arc<EventLog>,
    compactor: Compactor,
    replayer: Replayer,
    router: Arc<ViewRouter>,
    sampler: ContentSampler,
    cache: Mutex<LruCache<StateRecord>>,
    // Latest compacted fold plus its watermark; reads replay only past it.
    latest: Mutex<Option<(i64, FoldState)>>,
    snapshot_threshold: usize,
}

impl GraphKernel {
    /// Assemble a kernel from its configuration.
    pub async fn open(config: KernelConfig) -> Result<Self> {
        let router = Arc::new(ViewRouter::new());
        let limits = SegmentLimits {
            max_rows: config.compaction.segment_max_rows,
            max_bytes: config.compaction.segment_max_bytes,
        };
        let log = Arc::new(
            EventLog::open(config.storage.clone(), config.dataset.clone(), limits)
                .await?
                .with_router(router.clone()),
        );
        let compactor = Compactor::new(log.clone(), config.storage.clone());
        let replayer = Replayer::new(log.clone());
        let mut cache = LruCache::new(config.max_cache_size);
        if let Some(callback) = config.on_cache_evict {
            cache = cache.with_callback(callback);
        }
        Ok(Self {
            log,
            compactor,
            replayer,
            router,
            sampler: ContentSampler::new(config.sampling),
            cache: Mutex::new(cache),
            latest: Mutex::new(None),
            snapshot_threshold: config.compaction.snapshot_threshold,
        })
    }

    /// The event log, for direct CDC access (`scan`, `list_segments`).
    pub fn log(&self) -> &Arc<EventLog> {
        &self.log
    }

    /// The content sampler configured for view handlers.
    pub fn sampler(&self) -> &ContentSampler {
        &self.sampler
    }

    /// Snapshot storage beside the dataset.
    pub fn snapshots(&self) -> &SnapshotStore {
        self.compactor.snapshots()
    }

    /// Register a materialized-view handler.
    pub async fn register_view(&self, handler: Arc<dyn ViewHandler>) {
        self.router.register(handler).await;
    }

    /// Record one event. The write path invalidates the cached entry for
    /// the event's target.
    pub async fn record(&self, event: Event) -> Result<()> {
        let target = event.target.clone();
        self.log.append(event).await?;
        self.cache.lock().await.remove(&target);
        Ok(())
    }

    /// Record a batch of events.
    pub async fn record_batch(&self, events: Vec<Event>) -> Result<usize> {
        let targets: Vec<String> = events.iter().map(|e| e.target.clone()).collect();
        let appended = self.log.append_batch(events).await?;
        let mut cache = self.cache.lock().await;
        for target in targets.iter().take(appended) {
            cache.remove(target);
        }
        Ok(appended)
    }

    /// Flush buffered events into a sealed segment.
    pub async fn flush(&self) -> Result<()> {
        Ok(self.log.flush().await?)
    }

    /// Fold the log through `through_ts` into authoritative state,
    /// optionally emitting a snapshot and writing through `state_writer`.
    pub async fn compact(
        &self,
        through_ts: i64,
        emit_snapshot: bool,
        state_writer: Option<Arc<dyn StateWriter>>,
    ) -> Result<CompactionReport> {
        let (report, fold) = self
            .compactor
            .compact(CompactionOptions {
                through_ts,
                state_writer,
                emit_snapshot,
                ..Default::default()
            })
            .await?;
        *self.latest.lock().await = Some((through_ts, fold));
        Ok(report)
    }

    /// Current state of a target: cache, then latest compacted state plus
    /// the events past its watermark (buffered ones included). Returns
    /// `None` for absent or deleted targets.
    pub async fn get_entity(&self, target: &str) -> Result<Option<StateRecord>> {
        let key = TargetKey::parse(target).map_err(|source| KernelError::BadTarget {
            target: target.to_string(),
            source,
        })?;

        {
            let mut cache = self.cache.lock().await;
            if let Some(record) = cache.get(target) {
                return Ok(Some(record.clone()));
            }
        }

        let record = self.materialize(target, &key).await?;
        if let Some(record) = &record {
            self.cache.lock().await.set(target, record.clone());
        }
        Ok(record)
    }

    /// State of a target at an arbitrary point in the past.
    pub async fn entity_at(&self, target: &str, at: i64) -> Result<ReplayOutcome> {
        let opts = ReplayOptions {
            at,
            snapshots: Some(self.compactor.snapshots().clone()),
            create_snapshot: true,
            snapshot_threshold: self.snapshot_threshold,
            ..Default::default()
        };
        Ok(self.replayer.replay_entity(target, &opts).await?)
    }

    /// Full state history of a target.
    pub async fn history(&self, target: &str, range: HistoryRange) -> Result<Vec<StateVersion>> {
        Ok(self.replayer.state_history(target, range).await?)
    }

    /// Cache statistics for this scope.
    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.lock().await.stats()
    }

    /// Drop cached entries whose key starts with `prefix`.
    pub async fn invalidate_cache_prefix(&self, prefix: &str) -> usize {
        self.cache.lock().await.invalidate_by_prefix(prefix)
    }

    /// Materialize the current state of one target: seed from the latest
    /// compacted fold, then apply newer events in `(ts, id)` order.
    async fn materialize(&self, target: &str, key: &TargetKey) -> Result<Option<StateRecord>> {
        let (seed, since_ts) = {
            let latest = self.latest.lock().await;
            match &*latest {
                Some((watermark, fold)) => (
                    fold.entities
                        .get(target)
                        .or_else(|| fold.relationships.get(target))
                        .cloned(),
                    *watermark,
                ),
                None => (None, i64::MIN),
            }
        };

        let mut tail: Vec<Event> = self
            .log
            .scan_collect(ScanOptions::default())
            .await?
            .into_iter()
            .chain(self.log.pending_events().await)
            .filter(|e| e.target == target && e.ts > since_ts)
            .collect();
        sort_events(&mut tail);

        if tail.is_empty() {
            return Ok(seed.filter(|r| r.exists));
        }

        let mut fold = FoldState::default();
        if let Some(record) = seed {
            if key.is_entity() {
                fold.entities.insert(target.to_string(), record);
            } else {
                fold.relationships.insert(target.to_string(), record);
            }
        }
        for event in &tail {
            fold.apply(event)?;
        }
        debug!(target, applied = tail.len(), "materialized entity");
        let record = fold
            .entities
            .get(target)
            .or_else(|| fold.relationships.get(target))
            .cloned();
        Ok(record.filter(|r| r.exists))
    }
}

//─────────────────────────────
//  Convenience re-exports
//─────────────────────────────

/// Convenient prelude for embedding the kernel.
pub mod prelude {
    pub use super::{CompactionTuning, GraphKernel, KernelConfig, KernelError};
    pub use grove_cache::CacheStats;
    pub use grove_compact::{CompactionReport, StateRecord, StateWriter};
    pub use grove_log::{SamplingConfig, ViewHandler};
    pub use grove_replay::{HistoryRange, ReplayOutcome};
    pub use grove_types::prelude::*;
}

#[cfg(test)]
mod tests {
    use super::*;
    use grove_store_memory::MemoryStore;
    use grove_types::{Op, Value};

    async fn kernel() -> GraphKernel {
        let store = Arc::new(MemoryStore::new());
        GraphKernel::open(KernelConfig::new(store, "ds")).await.unwrap()
    }

    fn named(n: i64) -> Option<Value> {
        Some(Value::map([("n", Value::Int(n))]))
    }

    #[tokio::test]
    async fn test_read_your_own_writes_before_flush() {
        let kernel = kernel().await;
        kernel
            .record(Event::new(100, Op::Create, "user:a", named(1)))
            .await
            .unwrap();

        // Not flushed yet, still visible.
        let record = kernel.get_entity("user:a").await.unwrap().unwrap();
        assert_eq!(record.state, named(1));
    }

    #[tokio::test]
    async fn test_read_path_after_compaction() {
        let kernel = kernel().await;
        kernel.record(Event::new(100, Op::Create, "user:a", named(1))).await.unwrap();
        kernel.record(Event::new(200, Op::Update, "user:a", named(2))).await.unwrap();
        kernel.flush().await.unwrap();
        kernel.compact(150, false, None).await.unwrap();

        // Compacted state holds n=1; the event at 200 replays on top.
        let record = kernel.get_entity("user:a").await.unwrap().unwrap();
        assert_eq!(record.state, named(2));
    }

    #[tokio::test]
    async fn test_deleted_entity_reads_as_none() {
        let kernel = kernel().await;
        kernel.record(Event::new(100, Op::Create, "user:a", named(1))).await.unwrap();
        kernel.record(Event::new(200, Op::Delete, "user:a", None)).await.unwrap();
        assert!(kernel.get_entity("user:a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cache_hit_and_invalidation_on_write() {
        let kernel = kernel().await;
        kernel.record(Event::new(100, Op::Create, "user:a", named(1))).await.unwrap();

        let _ = kernel.get_entity("user:a").await.unwrap();
        let _ = kernel.get_entity("user:a").await.unwrap();
        let stats = kernel.cache_stats().await;
        assert_eq!(stats.hits, 1);

        // A new write invalidates the cached entry.
        kernel.record(Event::new(200, Op::Update, "user:a", named(2))).await.unwrap();
        let record = kernel.get_entity("user:a").await.unwrap().unwrap();
        assert_eq!(record.state, named(2));
    }

    #[tokio::test]
    async fn test_bad_target_rejected() {
        let kernel = kernel().await;
        assert!(matches!(
            kernel.get_entity("not-a-target").await,
            Err(KernelError::BadTarget { .. })
        ));
    }
}
