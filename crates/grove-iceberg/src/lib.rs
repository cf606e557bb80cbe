#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **grove-iceberg** – Iceberg-style table adapter for Grove.
//!
//! Tables live under `warehouse/<database>/<table>/` with base and
//! equality-delete files in `data/` and manifests plus the append-only
//! snapshot list in `metadata/`. A hard delete writes an equality-delete
//! file recording the removed primary keys, a manifest referencing it, and
//! a new snapshot labelled `delete` — current scans stop returning the rows
//! while scans at earlier snapshots still do. History is never rewritten.
//!
//! File payloads are MessagePack behind the table-format naming contract;
//! the adapter's semantics live entirely at the row level.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use grove_store_core::{StorageBackend, StoreError};
use grove_types::Value;

/// Retry budget for the snapshot-list conditional write.
const SNAPSHOT_LIST_RETRIES: usize = 3;

/// One table row: column name to value.
pub type Row = BTreeMap<String, Value>;

//─────────────────────────────
//  Error type
//─────────────────────────────

/// Errors produced by the table adapter.
#[derive(Debug, thiserror::Error)]
pub enum TableError {
    /// A table file could not be encoded or decoded.
    #[error("codec failure on {path}: {message}")]
    Codec {
        /// Offending path.
        path: String,
        /// Codec diagnostic.
        message: String,
    },
    /// The requested snapshot id does not exist.
    #[error("unknown snapshot {snapshot_id}")]
    UnknownSnapshot {
        /// Requested id.
        snapshot_id: u64,
    },
    /// A row is missing the table's primary-key column.
    #[error("row is missing key column {column:?}")]
    MissingKey {
        /// Configured key column.
        column: String,
    },
    /// The snapshot list kept moving under concurrent committers.
    #[error("snapshot list contention after {attempts} attempts")]
    Contention {
        /// Attempts made.
        attempts: usize,
    },
    /// Storage failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result alias for this crate.
pub type Result<T, E = TableError> = std::result::Result<T, E>;

//─────────────────────────────
//  Metadata records
//─────────────────────────────

/// Operation label carried by a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotOperation {
    /// New data files were added.
    Append,
    /// Data files were replaced.
    Overwrite,
    /// Rows were removed via equality deletes.
    Delete,
}

/// One entry in the snapshot list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSnapshot {
    /// Monotonically increasing snapshot id.
    pub snapshot_id: u64,
    /// Commit time in epoch milliseconds.
    pub timestamp_ms: i64,
    /// What the snapshot did.
    pub operation: SnapshotOperation,
    /// Manifest files this snapshot added.
    pub manifests: Vec<String>,
}

/// Content kind of a file referenced by a manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileContent {
    /// Base data rows.
    Data,
    /// Equality-delete keys.
    EqualityDeletes,
}

/// One file reference inside a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path of the referenced file, relative to the store root.
    pub file_path: String,
    /// Data or equality deletes.
    pub content: FileContent,
    /// Rows (or keys) in the file.
    pub record_count: u64,
}

/// A manifest: the list of files one snapshot added.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ManifestFile {
    /// Entries in write order.
    pub entries: Vec<ManifestEntry>,
}

/// Options for [`IcebergTable::scan`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanOptions {
    /// Scan as of this snapshot; `None` means the current snapshot.
    pub snapshot_id: Option<u64>,
    /// Soft-delete visibility flag. Hard-deleted rows are never returned,
    /// whatever this is set to.
    pub include_deleted: bool,
}

//─────────────────────────────
//  Table adapter
//─────────────────────────────

/// Identity and layout of one table.
#[derive(Debug, Clone)]
pub struct TableConfig {
    /// Warehouse root prefix.
    pub warehouse: String,
    /// Database name.
    pub database: String,
    /// Table name.
    pub table: String,
    /// Primary-key column used by equality deletes.
    pub key_column: String,
}

/// Handle on one table.
pub struct IcebergTable {
    store: Arc<dyn StorageBackend>,
    config: TableConfig,
}

impl IcebergTable {
    /// Open (or create on first commit) the configured table.
    pub fn new(store: Arc<dyn StorageBackend>, config: TableConfig) -> Self {
        Self { store, config }
    }

    fn root(&self) -> String {
        format!(
            "{}/{}/{}",
            self.config.warehouse, self.config.database, self.config.table
        )
    }

    fn snapshot_list_path(&self) -> String {
        format!("{}/metadata/snapshots.json", self.root())
    }

    fn manifest_path(&self, snapshot_id: u64) -> String {
        format!("{}/metadata/manifest-{snapshot_id:08}.avro", self.root())
    }

    fn data_path(&self, snapshot_id: u64) -> String {
        format!("{}/data/part-{snapshot_id:08}.parquet", self.root())
    }

    fn delete_path(&self, snapshot_id: u64) -> String {
        format!("{}/data/del-{snapshot_id:08}-delete.parquet", self.root())
    }

    /// The ordered snapshot list, oldest first.
    pub async fn snapshots(&self) -> Result<Vec<TableSnapshot>> {
        let path = self.snapshot_list_path();
        match self.store.read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| TableError::Codec {
                path,
                message: e.to_string(),
            }),
            Err(StoreError::FileNotFound { .. }) => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Append rows as a new data file plus manifest plus snapshot.
    pub async fn append(&self, rows: Vec<Row>) -> Result<TableSnapshot> {
        for row in &rows {
            if !row.contains_key(&self.config.key_column) {
                return Err(TableError::MissingKey { column: self.config.key_column.clone() });
            }
        }
        self.commit(SnapshotOperation::Append, |table, snapshot_id| {
            let data_path = table.data_path(snapshot_id);
            let payload = encode(&data_path, &rows)?;
            let entry = ManifestEntry {
                file_path: data_path.clone(),
                content: FileContent::Data,
                record_count: rows.len() as u64,
            };
            Ok((data_path, payload, entry))
        })
        .await
    }

    /// Hard-delete the rows whose primary keys are in `keys`: a new
    /// equality-delete file, a manifest referencing it, and a `delete`
    /// snapshot. Earlier snapshots are untouched.
    pub async fn hard_delete(&self, keys: Vec<Value>) -> Result<TableSnapshot> {
        self.commit(SnapshotOperation::Delete, |table, snapshot_id| {
            let delete_path = table.delete_path(snapshot_id);
            let payload = encode(&delete_path, &keys)?;
            let entry = ManifestEntry {
                file_path: delete_path.clone(),
                content: FileContent::EqualityDeletes,
                record_count: keys.len() as u64,
            };
            Ok((delete_path, payload, entry))
        })
        .await
    }

    /// Scan the table at a snapshot (current when `None`), reconstructing
    /// exactly the file view of that snapshot.
    pub async fn scan(&self, opts: ScanOptions) -> Result<Vec<Row>> {
        let snapshots = self.snapshots().await?;
        let through = match opts.snapshot_id {
            Some(id) => {
                if !snapshots.iter().any(|s| s.snapshot_id == id) {
                    return Err(TableError::UnknownSnapshot { snapshot_id: id });
                }
                id
            }
            None => match snapshots.last() {
                Some(last) => last.snapshot_id,
                None => return Ok(Vec::new()),
            },
        };

        let mut rows: Vec<Row> = Vec::new();
        let mut deleted_keys: Vec<Value> = Vec::new();
        for snapshot in snapshots.iter().filter(|s| s.snapshot_id <= through) {
            for manifest_path in &snapshot.manifests {
                let manifest: ManifestFile =
                    decode(manifest_path, &self.store.read(manifest_path).await?)?;
                for entry in &manifest.entries {
                    let bytes = self.store.read(&entry.file_path).await?;
                    match entry.content {
                        FileContent::Data => {
                            let mut batch: Vec<Row> = decode(&entry.file_path, &bytes)?;
                            rows.append(&mut batch);
                        }
                        FileContent::EqualityDeletes => {
                            let mut keys: Vec<Value> = decode(&entry.file_path, &bytes)?;
                            deleted_keys.append(&mut keys);
                        }
                    }
                }
            }
        }

        // Hard deletes win regardless of include_deleted.
        let key_column = &self.config.key_column;
        rows.retain(|row| {
            row.get(key_column)
                .map_or(true, |key| !deleted_keys.iter().any(|deleted| deleted == key))
        });
        debug!(
            table = %self.root(),
            snapshot = through,
            rows = rows.len(),
            "table scan"
        );
        Ok(rows)
    }

    /// Shared commit path: write the payload file, its manifest, and the
    /// extended snapshot list (conditionally, so concurrent committers
    /// linearize).
    async fn commit(
        &self,
        operation: SnapshotOperation,
        build: impl Fn(&Self, u64) -> Result<(String, Vec<u8>, ManifestEntry)>,
    ) -> Result<TableSnapshot> {
        for attempt in 0..SNAPSHOT_LIST_RETRIES {
            let list_path = self.snapshot_list_path();
            let (snapshots, etag) = match self.store.stat(&list_path).await? {
                Some(stat) => {
                    let bytes = self.store.read(&list_path).await?;
                    let list: Vec<TableSnapshot> =
                        serde_json::from_slice(&bytes).map_err(|e| TableError::Codec {
                            path: list_path.clone(),
                            message: e.to_string(),
                        })?;
                    (list, Some(stat.etag))
                }
                None => (Vec::new(), None),
            };
            let snapshot_id = snapshots.last().map(|s| s.snapshot_id + 1).unwrap_or(1);

            let (payload_path, payload, entry) = build(self, snapshot_id)?;
            self.store.write_atomic(&payload_path, &payload).await?;

            let manifest_path = self.manifest_path(snapshot_id);
            let manifest = ManifestFile { entries: vec![entry] };
            self.store
                .write_atomic(&manifest_path, &rmp_serde::to_vec_named(&manifest).map_err(|e| {
                    TableError::Codec { path: manifest_path.clone(), message: e.to_string() }
                })?)
                .await?;

            let snapshot = TableSnapshot {
                snapshot_id,
                timestamp_ms: chrono::Utc::now().timestamp_millis(),
                operation,
                manifests: vec![manifest_path],
            };
            let mut extended = snapshots;
            extended.push(snapshot.clone());
            let list_bytes = serde_json::to_vec_pretty(&extended).map_err(|e| {
                TableError::Codec { path: list_path.clone(), message: e.to_string() }
            })?;
            match self
                .store
                .write_conditional(&list_path, &list_bytes, etag.as_deref())
                .await
            {
                Ok(_) => {
                    info!(
                        table = %self.root(),
                        snapshot_id,
                        ?operation,
                        "snapshot committed"
                    );
                    return Ok(snapshot);
                }
                Err(e) if e.is_retryable() => {
                    // Another committer won this id; orphan our files and
                    // rebuild against the fresh list.
                    let _ = self.store.delete(&payload_path).await;
                    let _ = self.store.delete(&snapshot.manifests[0]).await;
                    debug!(table = %self.root(), snapshot_id, attempt, "snapshot list moved, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(TableError::Contention { attempts: SNAPSHOT_LIST_RETRIES })
    }
}

fn encode<T: Serialize>(path: &str, value: &T) -> Result<Vec<u8>> {
    rmp_serde::to_vec_named(value).map_err(|e| TableError::Codec {
        path: path.to_string(),
        message: e.to_string(),
    })
}

fn decode<T: for<'de> Deserialize<'de>>(path: &str, bytes: &[u8]) -> Result<T> {
    rmp_serde::from_slice(bytes).map_err(|e| TableError::Codec {
        path: path.to_string(),
        message: e.to_string(),
    })
}
