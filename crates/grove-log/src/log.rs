//! The append-side of the log: active segment buffer, sealing, and the
//! conditional manifest update with bounded backoff.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, Stream, StreamExt, TryStreamExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use grove_store_core::StorageBackend;
use grove_types::Event;

use crate::segment::{self, Manifest, SegmentMeta};
use crate::views::ViewRouter;
use crate::{LogError, Result};

/// Retry budget for conditional manifest updates.
const MANIFEST_RETRIES: usize = 5;

/// Base delay of the exponential backoff between manifest retries.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(10);

/// Thresholds at which the active segment buffer is sealed.
#[derive(Debug, Clone, Copy)]
pub struct SegmentLimits {
    /// Seal after this many buffered rows.
    pub max_rows: usize,
    /// Seal after this many buffered bytes.
    pub max_bytes: usize,
}

impl Default for SegmentLimits {
    fn default() -> Self {
        Self { max_rows: 1024, max_bytes: 4 * 1024 * 1024 }
    }
}

/// Options for [`EventLog::scan`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanOptions {
    /// Skip segments with seq below this.
    pub from_seq: Option<u64>,
    /// Drop events with ts above this.
    pub through_ts: Option<i64>,
}

struct LogInner {
    buffer: Vec<Event>,
    buffer_bytes: usize,
    manifest: Manifest,
    etag: Option<String>,
}

/// The event log: accepts CDC events, seals them into segments, and exposes
/// them as a write-ordered stream.
pub struct EventLog {
    store: Arc<dyn StorageBackend>,
    dataset: String,
    limits: SegmentLimits,
    router: Option<Arc<ViewRouter>>,
    inner: Mutex<LogInner>,
}

impl EventLog {
    /// Open the log of `dataset`, loading the manifest when one exists. A
    /// dataset with no manifest starts from the empty manifest at
    /// generation 0.
    pub async fn open(
        store: Arc<dyn StorageBackend>,
        dataset: impl Into<String>,
        limits: SegmentLimits,
    ) -> Result<Self> {
        let dataset = dataset.into();
        let manifest_path = manifest_path(&dataset);
        let (manifest, etag) = match store.stat(&manifest_path).await? {
            Some(stat) => {
                let bytes = store.read(&manifest_path).await?;
                (Manifest::from_bytes(&manifest_path, &bytes)?, Some(stat.etag))
            }
            None => (Manifest::default(), None),
        };
        Ok(Self {
            store,
            dataset,
            limits,
            router: None,
            inner: Mutex::new(LogInner {
                buffer: Vec::new(),
                buffer_bytes: 0,
                manifest,
                etag,
            }),
        })
    }

    /// Attach a materialized-view router; each sealed batch is delivered to
    /// it once durable.
    pub fn with_router(mut self, router: Arc<ViewRouter>) -> Self {
        self.router = Some(router);
        self
    }

    /// Dataset path this log writes under.
    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    /// Append a single event. The event is validated, buffered, and sealed
    /// into a segment once a threshold is crossed.
    pub async fn append(&self, event: Event) -> Result<()> {
        event.validate()?;
        let sealed = {
            let mut inner = self.inner.lock().await;
            self.buffer_event(&mut inner, event)?;
            self.maybe_seal(&mut inner).await?
        };
        self.notify(sealed).await;
        Ok(())
    }

    /// Append a batch. Validation is per event: an invalid event fails the
    /// call at that point, leaving earlier events of the batch appended.
    pub async fn append_batch(&self, events: Vec<Event>) -> Result<usize> {
        let mut sealed_batches = Vec::new();
        let mut appended = 0;
        {
            let mut inner = self.inner.lock().await;
            for event in events {
                event.validate()?;
                self.buffer_event(&mut inner, event)?;
                appended += 1;
                if let Some(batch) = self.maybe_seal(&mut inner).await? {
                    sealed_batches.push(batch);
                }
            }
        }
        for batch in sealed_batches {
            self.notify(Some(batch)).await;
        }
        Ok(appended)
    }

    /// Seal the active buffer regardless of thresholds.
    pub async fn flush(&self) -> Result<()> {
        let sealed = {
            let mut inner = self.inner.lock().await;
            self.seal(&mut inner).await?
        };
        self.notify(sealed).await;
        Ok(())
    }

    /// Live segments in increasing seq order.
    pub async fn list_segments(&self) -> Vec<SegmentMeta> {
        self.inner.lock().await.manifest.segments.clone()
    }

    /// Current manifest generation token.
    pub async fn manifest_generation(&self) -> u64 {
        self.inner.lock().await.manifest.generation
    }

    /// Number of events buffered but not yet sealed.
    pub async fn buffered_len(&self) -> usize {
        self.inner.lock().await.buffer.len()
    }

    /// Copies of the buffered, not-yet-sealed events in write order. Lets
    /// read paths see their own writes before the next seal.
    pub async fn pending_events(&self) -> Vec<Event> {
        self.inner.lock().await.buffer.clone()
    }

    /// Read the rows of one segment in file order.
    pub async fn open_segment(&self, seq: u64) -> Result<Vec<Event>> {
        let meta = {
            let inner = self.inner.lock().await;
            inner
                .manifest
                .segments
                .iter()
                .find(|s| s.seq == seq)
                .cloned()
                .ok_or(LogError::UnknownSegment { seq })?
        };
        let bytes = self.store.read(&meta.path).await?;
        segment::decode_segment(&meta.path, &bytes)
    }

    /// Lazy stream of events in write order, delivered segment by segment.
    ///
    /// `through_ts` filters rows by timestamp but does not reorder them;
    /// time-ordered semantics belong to compaction and replay.
    pub async fn scan(
        &self,
        opts: ScanOptions,
    ) -> Result<impl Stream<Item = Result<Event>> + Send + 'static> {
        let metas: Vec<SegmentMeta> = {
            let inner = self.inner.lock().await;
            inner
                .manifest
                .segments
                .iter()
                .filter(|s| opts.from_seq.map_or(true, |from| s.seq >= from))
                .cloned()
                .collect()
        };
        let store = self.store.clone();
        let through = opts.through_ts;
        let stream = stream::iter(metas)
            .then(move |meta| {
                let store = store.clone();
                async move {
                    let bytes = store.read(&meta.path).await?;
                    let mut events = segment::decode_segment(&meta.path, &bytes)?;
                    if let Some(t) = through {
                        events.retain(|e| e.ts <= t);
                    }
                    Ok::<_, LogError>(stream::iter(events.into_iter().map(Ok)))
                }
            })
            .try_flatten();
        Ok(stream)
    }

    /// Collect a scan into memory. Convenience for callers that want the
    /// whole prefix anyway.
    pub async fn scan_collect(&self, opts: ScanOptions) -> Result<Vec<Event>> {
        self.scan(opts).await?.try_collect().await
    }

    /// Drop segments whose seq is at or below `through_seq` from the
    /// manifest and delete their files. Only call with a watermark at or
    /// below the latest compacted state; the log does not re-derive that
    /// invariant.
    pub async fn remove_segments_below(&self, through_seq: u64) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        let doomed: Vec<SegmentMeta> = inner
            .manifest
            .segments
            .iter()
            .filter(|s| s.seq <= through_seq)
            .cloned()
            .collect();
        if doomed.is_empty() {
            return Ok(0);
        }

        for attempt in 0..MANIFEST_RETRIES {
            let mut candidate = inner.manifest.clone();
            candidate.segments.retain(|s| s.seq > through_seq);
            candidate.generation += 1;
            let bytes = candidate.to_bytes()?;
            match self
                .store
                .write_conditional(&manifest_path(&self.dataset), &bytes, inner.etag.as_deref())
                .await
            {
                Ok(result) => {
                    inner.manifest = candidate;
                    inner.etag = Some(result.etag);
                    for meta in &doomed {
                        let _ = self.store.delete(&meta.path).await;
                    }
                    info!(dataset = %self.dataset, removed = doomed.len(), "segments garbage collected");
                    return Ok(doomed.len());
                }
                Err(e) if e.is_retryable() => {
                    self.reload_manifest(&mut inner).await?;
                    tokio::time::sleep(RETRY_BASE_DELAY * (1u32 << attempt)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(LogError::RetriesExhausted {
            path: manifest_path(&self.dataset),
            attempts: MANIFEST_RETRIES,
        })
    }

    fn buffer_event(&self, inner: &mut LogInner, event: Event) -> Result<()> {
        // The estimate mirrors the sealed encoding closely enough for
        // thresholding.
        let estimate = rmp_serde::to_vec_named(&event)
            .map(|b| b.len())
            .unwrap_or(64);
        inner.buffer.push(event);
        inner.buffer_bytes += estimate;
        Ok(())
    }

    async fn maybe_seal(&self, inner: &mut LogInner) -> Result<Option<Vec<Event>>> {
        if inner.buffer.len() >= self.limits.max_rows || inner.buffer_bytes >= self.limits.max_bytes
        {
            self.seal(inner).await
        } else {
            Ok(None)
        }
    }

    /// Seal the buffer into a segment file and publish it through the
    /// manifest. On a lost conditional write the manifest is reloaded, the
    /// segment is re-assigned the next free seq (rewriting its file), and
    /// the update retries with exponential backoff.
    async fn seal(&self, inner: &mut LogInner) -> Result<Option<Vec<Event>>> {
        if inner.buffer.is_empty() {
            return Ok(None);
        }
        let events = std::mem::take(&mut inner.buffer);
        inner.buffer_bytes = 0;

        let bytes = segment::encode_segment(&events)?;
        let min_ts = events.iter().map(|e| e.ts).min().unwrap_or(0);
        let max_ts = events.iter().map(|e| e.ts).max().unwrap_or(0);

        // Claiming the path with a create-only write keeps concurrent
        // writers from clobbering each other's sealed files.
        let (mut seq, mut path) = self
            .claim_segment_path(inner.manifest.max_seq() + 1, &bytes)
            .await?;

        for attempt in 0..MANIFEST_RETRIES {
            let mut candidate = inner.manifest.clone();
            candidate.segments.push(SegmentMeta {
                seq,
                path: path.clone(),
                min_ts,
                max_ts,
                row_count: events.len() as u64,
                byte_size: bytes.len() as u64,
                created_at: chrono::Utc::now(),
            });
            candidate.generation += 1;
            let manifest_bytes = candidate.to_bytes()?;
            match self
                .store
                .write_conditional(
                    &manifest_path(&self.dataset),
                    &manifest_bytes,
                    inner.etag.as_deref(),
                )
                .await
            {
                Ok(result) => {
                    inner.manifest = candidate;
                    inner.etag = Some(result.etag);
                    info!(
                        dataset = %self.dataset,
                        seq,
                        rows = events.len(),
                        bytes = bytes.len(),
                        "segment sealed"
                    );
                    return Ok(Some(events));
                }
                Err(e) if e.is_retryable() => {
                    debug!(dataset = %self.dataset, seq, attempt, "manifest update lost, reloading");
                    self.reload_manifest(&mut *inner).await?;
                    if inner.manifest.max_seq() >= seq {
                        // Another writer published a segment at or past our
                        // seq; reassign to current-max+1 and move our file.
                        // The old claim is ours alone, so deleting it is
                        // safe.
                        let (new_seq, new_path) = self
                            .claim_segment_path(inner.manifest.max_seq() + 1, &bytes)
                            .await?;
                        let _ = self.store.delete(&path).await;
                        seq = new_seq;
                        path = new_path;
                    }
                    tokio::time::sleep(RETRY_BASE_DELAY * (1u32 << attempt)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(LogError::RetriesExhausted {
            path: manifest_path(&self.dataset),
            attempts: MANIFEST_RETRIES,
        })
    }

    /// Write the sealed bytes at the first free `seg-<seq>` path at or
    /// after `start_seq`. Create-only semantics make the claim exclusive.
    async fn claim_segment_path(&self, start_seq: u64, bytes: &[u8]) -> Result<(u64, String)> {
        let mut seq = start_seq;
        loop {
            let path = segment_path(&self.dataset, seq);
            match self
                .store
                .write(&path, bytes, grove_store_core::WriteOptions { if_none_match: true })
                .await
            {
                Ok(_) => return Ok((seq, path)),
                Err(grove_store_core::StoreError::FileExists { .. }) => {
                    seq += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn reload_manifest(&self, inner: &mut LogInner) -> Result<()> {
        let path = manifest_path(&self.dataset);
        match self.store.stat(&path).await? {
            Some(stat) => {
                let bytes = self.store.read(&path).await?;
                inner.manifest = Manifest::from_bytes(&path, &bytes)?;
                inner.etag = Some(stat.etag);
            }
            None => {
                inner.manifest = Manifest::default();
                inner.etag = None;
            }
        }
        Ok(())
    }

    async fn notify(&self, sealed: Option<Vec<Event>>) {
        let (Some(router), Some(events)) = (&self.router, sealed) else {
            return;
        };
        if let Err(error) = router.dispatch(&events).await {
            // Durability is already achieved; handlers are idempotent under
            // at-least-once redelivery.
            warn!(dataset = %self.dataset, %error, "view dispatch failed");
        }
    }
}

fn manifest_path(dataset: &str) -> String {
    format!("{dataset}/manifest.json")
}

fn segment_path(dataset: &str, seq: u64) -> String {
    format!("{dataset}/events/seg-{seq:04}.bin")
}

#[cfg(test)]
mod tests {
    use super::*;
    use grove_store_memory::MemoryStore;
    use grove_types::{Op, Value};

    async fn small_log() -> EventLog {
        let store = Arc::new(MemoryStore::new());
        EventLog::open(store, "ds", SegmentLimits { max_rows: 3, max_bytes: 1 << 20 })
            .await
            .unwrap()
    }

    fn event(ts: i64, target: &str, n: i64) -> Event {
        Event::new(ts, Op::Create, target, Some(Value::Int(n)))
    }

    #[tokio::test]
    async fn test_seal_at_row_threshold() {
        let log = small_log().await;
        for i in 0..7 {
            log.append(event(i, "user:a", i)).await.unwrap();
        }
        let segments = log.list_segments().await;
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].seq, 1);
        assert_eq!(segments[1].seq, 2);
        assert_eq!(segments[0].row_count, 3);
        assert_eq!(log.buffered_len().await, 1);

        log.flush().await.unwrap();
        assert_eq!(log.list_segments().await.len(), 3);
        assert_eq!(log.buffered_len().await, 0);
    }

    #[tokio::test]
    async fn test_flush_on_empty_buffer_is_noop() {
        let log = small_log().await;
        log.flush().await.unwrap();
        assert!(log.list_segments().await.is_empty());
        assert_eq!(log.manifest_generation().await, 0);
    }

    #[tokio::test]
    async fn test_segment_paths_and_metadata() {
        let log = small_log().await;
        log.append_batch(vec![
            event(30, "user:a", 1),
            event(10, "user:b", 2),
            event(20, "user:c", 3),
        ])
        .await
        .unwrap();
        let segments = log.list_segments().await;
        assert_eq!(segments.len(), 1);
        let seg = &segments[0];
        assert_eq!(seg.path, "ds/events/seg-0001.bin");
        assert_eq!(seg.min_ts, 10);
        assert_eq!(seg.max_ts, 30);
        assert_eq!(seg.row_count, 3);
    }

    #[tokio::test]
    async fn test_invalid_event_rejected_per_event() {
        let log = small_log().await;
        let bad = Event::new(5, Op::Update, "user:x", None);
        let result = log
            .append_batch(vec![event(1, "user:a", 1), bad, event(2, "user:b", 2)])
            .await;
        assert!(matches!(result, Err(LogError::InvalidEvent(_))));
        // The valid prefix stays buffered.
        assert_eq!(log.buffered_len().await, 1);
    }

    #[tokio::test]
    async fn test_scan_write_order_and_filters() {
        let log = small_log().await;
        for i in 0..6 {
            log.append(event(100 - i, "user:a", i)).await.unwrap();
        }
        log.flush().await.unwrap();

        let all = log.scan_collect(ScanOptions::default()).await.unwrap();
        assert_eq!(all.len(), 6);
        // Write order, not timestamp order.
        let timestamps: Vec<i64> = all.iter().map(|e| e.ts).collect();
        assert_eq!(timestamps, vec![100, 99, 98, 97, 96, 95]);

        let from_second = log
            .scan_collect(ScanOptions { from_seq: Some(2), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(from_second.len(), 3);

        let capped = log
            .scan_collect(ScanOptions { through_ts: Some(97), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(capped.len(), 3);
    }

    #[tokio::test]
    async fn test_open_segment_unknown_seq() {
        let log = small_log().await;
        assert!(matches!(
            log.open_segment(9).await,
            Err(LogError::UnknownSegment { seq: 9 })
        ));
    }

    #[tokio::test]
    async fn test_manifest_survives_reopen() {
        let store = Arc::new(MemoryStore::new());
        {
            let log = EventLog::open(
                store.clone(),
                "ds",
                SegmentLimits { max_rows: 2, max_bytes: 1 << 20 },
            )
            .await
            .unwrap();
            log.append_batch(vec![event(1, "user:a", 1), event(2, "user:b", 2)])
                .await
                .unwrap();
        }
        let reopened = EventLog::open(store, "ds", SegmentLimits::default()).await.unwrap();
        assert_eq!(reopened.list_segments().await.len(), 1);
        let events = reopened.open_segment(1).await.unwrap();
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_writers_reassign_seq() {
        // Two logs over the same store and dataset race on the manifest;
        // both segments must land with distinct seqs.
        let store = Arc::new(MemoryStore::new());
        let limits = SegmentLimits { max_rows: 100, max_bytes: 1 << 20 };
        let log_a = EventLog::open(store.clone(), "ds", limits).await.unwrap();
        let log_b = EventLog::open(store.clone(), "ds", limits).await.unwrap();

        log_a.append(event(1, "user:a", 1)).await.unwrap();
        log_b.append(event(2, "user:b", 2)).await.unwrap();
        log_a.flush().await.unwrap();
        log_b.flush().await.unwrap();

        let fresh = EventLog::open(store, "ds", limits).await.unwrap();
        let segments = fresh.list_segments().await;
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].seq, 1);
        assert_eq!(segments[1].seq, 2);
        assert_eq!(fresh.scan_collect(ScanOptions::default()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_remove_segments_below() {
        let log = small_log().await;
        for i in 0..9 {
            log.append(event(i, "user:a", i)).await.unwrap();
        }
        assert_eq!(log.list_segments().await.len(), 3);

        let removed = log.remove_segments_below(2).await.unwrap();
        assert_eq!(removed, 2);
        let segments = log.list_segments().await;
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].seq, 3);

        // Files are gone too.
        let remaining = log.scan_collect(ScanOptions::default()).await.unwrap();
        assert_eq!(remaining.len(), 3);
    }
}
