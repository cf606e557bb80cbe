//! Persisted state snapshots.
//!
//! A snapshot is an immutable pair of entity/relationship state arrays at a
//! specific timestamp, stored at `<dataset>/snapshots/<ts>`. The encoding is
//! MessagePack; the only contract is that it round-trips with what the
//! compactor emits, so replay can start from it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use grove_store_core::{ListOptions, StorageBackend, StoreError};

use crate::fold::{FoldState, StateRecord};
use crate::{CompactError, Result};

/// A materialization of entity and relationship state at one timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Timestamp the snapshot reflects (inclusive).
    pub ts: i64,
    /// Existing entities in ascending key order.
    pub entities: Vec<StateRecord>,
    /// Existing relationships in ascending key order.
    pub relationships: Vec<StateRecord>,
}

impl Snapshot {
    /// Build a snapshot from a fold at `ts`.
    pub fn from_fold(ts: i64, fold: &FoldState) -> Self {
        Self {
            ts,
            entities: fold.existing_entities(),
            relationships: fold.existing_relationships(),
        }
    }

    /// Seed a fold with the snapshot's state, for replay continuation.
    pub fn to_fold(&self) -> FoldState {
        let mut fold = FoldState::default();
        for record in &self.entities {
            fold.entities.insert(record.key.clone(), record.clone());
        }
        for record in &self.relationships {
            fold.relationships.insert(record.key.clone(), record.clone());
        }
        fold
    }
}

/// Snapshot persistence under a dataset prefix.
#[derive(Clone)]
pub struct SnapshotStore {
    store: Arc<dyn StorageBackend>,
    dataset: String,
}

impl SnapshotStore {
    /// Snapshot store for `dataset`.
    pub fn new(store: Arc<dyn StorageBackend>, dataset: impl Into<String>) -> Self {
        Self { store, dataset: dataset.into() }
    }

    fn path(&self, ts: i64) -> String {
        format!("{}/snapshots/{ts}", self.dataset)
    }

    /// Persist a snapshot at its timestamp. Snapshots are immutable; an
    /// existing file at the same timestamp is left untouched.
    pub async fn save(&self, snapshot: &Snapshot) -> Result<String> {
        let path = self.path(snapshot.ts);
        if self.store.exists(&path).await? {
            return Ok(path);
        }
        let bytes = rmp_serde::to_vec_named(snapshot).map_err(|e| CompactError::Snapshot {
            path: path.clone(),
            message: e.to_string(),
        })?;
        self.store.write_atomic(&path, &bytes).await?;
        debug!(path, entities = snapshot.entities.len(), "snapshot persisted");
        Ok(path)
    }

    /// Load the snapshot at exactly `ts`.
    pub async fn load(&self, ts: i64) -> Result<Snapshot> {
        let path = self.path(ts);
        let bytes = self.store.read(&path).await?;
        rmp_serde::from_slice(&bytes).map_err(|e| CompactError::Snapshot {
            path,
            message: e.to_string(),
        })
    }

    /// Timestamps of all snapshots, ascending.
    pub async fn list(&self) -> Result<Vec<i64>> {
        let prefix = format!("{}/snapshots/", self.dataset);
        let page = match self.store.list(&prefix, ListOptions::default()).await {
            Ok(page) => page,
            Err(StoreError::FileNotFound { .. }) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut timestamps: Vec<i64> = page
            .files
            .iter()
            .filter_map(|entry| entry.path.rsplit('/').next()?.parse().ok())
            .collect();
        timestamps.sort_unstable();
        Ok(timestamps)
    }

    /// The newest snapshot with `ts <= at`, when one exists.
    pub async fn latest_at(&self, at: i64) -> Result<Option<Snapshot>> {
        let best = self.list().await?.into_iter().filter(|ts| *ts <= at).max();
        match best {
            Some(ts) => Ok(Some(self.load(ts).await?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grove_store_memory::MemoryStore;
    use grove_types::{Event, Op, Value};

    fn store() -> SnapshotStore {
        SnapshotStore::new(Arc::new(MemoryStore::new()), "ds")
    }

    fn fold_with(entries: &[(&str, i64)]) -> FoldState {
        let mut fold = FoldState::default();
        for (target, n) in entries {
            fold.apply(&Event::new(*n, Op::Create, *target, Some(Value::Int(*n))))
                .unwrap();
        }
        fold
    }

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let snapshots = store();
        let fold = fold_with(&[("user:a", 1), ("user:b", 2)]);
        let snapshot = Snapshot::from_fold(100, &fold);

        let path = snapshots.save(&snapshot).await.unwrap();
        assert_eq!(path, "ds/snapshots/100");

        let loaded = snapshots.load(100).await.unwrap();
        assert_eq!(loaded, snapshot);
        assert_eq!(loaded.to_fold(), fold);
    }

    #[tokio::test]
    async fn test_latest_at_picks_newest_not_after() {
        let snapshots = store();
        for ts in [100, 200, 300] {
            let snapshot = Snapshot::from_fold(ts, &fold_with(&[("user:a", ts)]));
            snapshots.save(&snapshot).await.unwrap();
        }

        assert_eq!(snapshots.list().await.unwrap(), vec![100, 200, 300]);
        assert_eq!(snapshots.latest_at(250).await.unwrap().unwrap().ts, 200);
        assert_eq!(snapshots.latest_at(300).await.unwrap().unwrap().ts, 300);
        assert!(snapshots.latest_at(99).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_snapshots_are_immutable() {
        let snapshots = store();
        let first = Snapshot::from_fold(100, &fold_with(&[("user:a", 1)]));
        snapshots.save(&first).await.unwrap();

        let second = Snapshot::from_fold(100, &fold_with(&[("user:b", 2)]));
        snapshots.save(&second).await.unwrap();

        // The original content wins.
        assert_eq!(snapshots.load(100).await.unwrap(), first);
    }
}
