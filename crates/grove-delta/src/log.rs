//! Versioned commit log over a storage backend.
//!
//! A commit is claimed by conditionally creating its version file, so N
//! concurrent committers targeting the same version produce exactly one
//! winner; the losers observe [`DeltaError::CommitConflict`] and retry at
//! the next version.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use grove_store_core::{ListOptions, StorageBackend, StoreError};

use crate::{
    Action, AddAction, DeltaError, MetadataAction, ProtocolAction, Result, log_path,
    parse_commit, parse_commit_file_name, serialize_commit, validate,
};

/// Retry budget for `commit_next` when racing other committers.
const COMMIT_RETRIES: usize = 5;

//─────────────────────────────
//  Delta log
//─────────────────────────────

/// Handle on a table's `_delta_log/` directory.
pub struct DeltaLog {
    store: Arc<dyn StorageBackend>,
    table_path: String,
}

impl DeltaLog {
    /// Open the log of the table rooted at `table_path`.
    pub fn new(store: Arc<dyn StorageBackend>, table_path: impl Into<String>) -> Self {
        Self { store, table_path: table_path.into() }
    }

    /// Table root this log belongs to.
    pub fn table_path(&self) -> &str {
        &self.table_path
    }

    /// Highest committed version, or `None` for an empty log.
    pub async fn latest_version(&self) -> Result<Option<u64>> {
        let prefix = format!("{}/_delta_log/", self.table_path);
        let page = self
            .store
            .list(&prefix, ListOptions { pattern: Some("*.json".into()), ..Default::default() })
            .await?;
        let mut latest = None;
        for entry in &page.files {
            let name = entry.path.rsplit('/').next().unwrap_or(&entry.path);
            if let Ok(version) = parse_commit_file_name(name) {
                latest = latest.max(Some(version));
            }
        }
        Ok(latest)
    }

    /// Read and parse one commit file.
    pub async fn read_commit(&self, version: u64) -> Result<Vec<Action>> {
        let raw = self.store.read(&log_path(&self.table_path, version)).await?;
        parse_commit(&String::from_utf8_lossy(&raw))
    }

    /// Commit `actions` at exactly `version`. Every action is validated
    /// first; the whole commit is one atomic file creation.
    pub async fn commit_at(&self, version: u64, actions: &[Action]) -> Result<()> {
        for action in actions {
            validate::check(action)?;
        }
        let body = serialize_commit(actions)?;
        let path = log_path(&self.table_path, version);
        match self.store.write_conditional(&path, body.as_bytes(), None).await {
            Ok(_) => {
                debug!(table = %self.table_path, version, actions = actions.len(), "commit written");
                Ok(())
            }
            Err(StoreError::VersionMismatch { .. }) | Err(StoreError::ConcurrentWrite { .. }) => {
                Err(DeltaError::CommitConflict { version })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Commit `actions` at the next available version, retrying a bounded
    /// number of times when other writers land first. Returns the version
    /// that was won.
    pub async fn commit_next(&self, actions: &[Action]) -> Result<u64> {
        let mut last_conflict = 0;
        for _ in 0..COMMIT_RETRIES {
            let version = match self.latest_version().await? {
                Some(latest) => latest + 1,
                None => 0,
            };
            match self.commit_at(version, actions).await {
                Ok(()) => return Ok(version),
                Err(DeltaError::CommitConflict { version }) => {
                    debug!(table = %self.table_path, version, "commit conflict, retrying");
                    last_conflict = version;
                }
                Err(e) => return Err(e),
            }
        }
        Err(DeltaError::CommitConflict { version: last_conflict })
    }

    /// Reconstruct the table state as of `version` (or the latest version
    /// when `None`): the set of live data files plus the most recent
    /// metadata and protocol actions.
    pub async fn snapshot(&self, version: Option<u64>) -> Result<TableSnapshot> {
        let latest = self.latest_version().await?;
        let through = match (version, latest) {
            (Some(v), Some(latest)) => v.min(latest),
            (Some(v), None) => {
                return Err(DeltaError::BadVersion { name: v.to_string() });
            }
            (None, Some(latest)) => latest,
            (None, None) => {
                return Ok(TableSnapshot {
                    version: None,
                    files: Vec::new(),
                    metadata: None,
                    protocol: None,
                });
            }
        };

        let mut files: BTreeMap<String, AddAction> = BTreeMap::new();
        let mut metadata = None;
        let mut protocol = None;
        for v in 0..=through {
            // Version gaps are impossible under conditional creation, but a
            // missing intermediate file still fails loudly here.
            for action in self.read_commit(v).await? {
                match action {
                    Action::Add(add) => {
                        files.insert(add.path.clone(), add);
                    }
                    Action::Remove(remove) => {
                        files.remove(&remove.path);
                    }
                    Action::Metadata(meta) => metadata = Some(meta),
                    Action::Protocol(proto) => protocol = Some(proto),
                    Action::CommitInfo(_) => {}
                }
            }
        }
        Ok(TableSnapshot {
            version: Some(through),
            files: files.into_values().collect(),
            metadata,
            protocol,
        })
    }
}

/// Table state reconstructed from a prefix of the log.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSnapshot {
    /// Version this snapshot reflects, `None` for an empty log.
    pub version: Option<u64>,
    /// Live data files in path order.
    pub files: Vec<AddAction>,
    /// Most recent table metadata.
    pub metadata: Option<MetadataAction>,
    /// Most recent protocol declaration.
    pub protocol: Option<ProtocolAction>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CommitInfoAction, Format, RemoveAction};
    use grove_store_memory::MemoryStore;
    use std::collections::HashMap;

    fn log() -> DeltaLog {
        DeltaLog::new(Arc::new(MemoryStore::new()), "warehouse/docs")
    }

    fn add(path: &str) -> Action {
        Action::Add(AddAction {
            path: path.into(),
            partition_values: HashMap::new(),
            size: 100,
            modification_time: 0,
            data_change: true,
            stats: None,
        })
    }

    fn remove(path: &str) -> Action {
        Action::Remove(RemoveAction {
            path: path.into(),
            deletion_timestamp: Some(0),
            data_change: true,
        })
    }

    fn bootstrap() -> Vec<Action> {
        vec![
            Action::Protocol(ProtocolAction { min_reader_version: 1, min_writer_version: 2 }),
            Action::Metadata(MetadataAction {
                id: "t-1".into(),
                name: None,
                format: Format::default(),
                schema_string: r#"{"type":"struct","fields":[]}"#.into(),
                partition_columns: Vec::new(),
                configuration: HashMap::new(),
                created_time: None,
            }),
        ]
    }

    #[tokio::test]
    async fn test_commit_sequence_and_latest_version() {
        let log = log();
        assert_eq!(log.latest_version().await.unwrap(), None);

        assert_eq!(log.commit_next(&bootstrap()).await.unwrap(), 0);
        assert_eq!(log.commit_next(&[add("a.parquet")]).await.unwrap(), 1);
        assert_eq!(log.latest_version().await.unwrap(), Some(1));

        let actions = log.read_commit(1).await.unwrap();
        assert_eq!(actions, vec![add("a.parquet")]);
    }

    #[tokio::test]
    async fn test_commit_at_conflict() {
        let log = log();
        log.commit_at(0, &bootstrap()).await.unwrap();
        assert!(matches!(
            log.commit_at(0, &[add("x.parquet")]).await,
            Err(DeltaError::CommitConflict { version: 0 })
        ));
    }

    #[tokio::test]
    async fn test_invalid_action_rejected_before_write() {
        let log = log();
        let bad = add("../escape.parquet");
        assert!(matches!(
            log.commit_at(0, &[bad]).await,
            Err(DeltaError::InvalidAction { .. })
        ));
        assert_eq!(log.latest_version().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_snapshot_time_travel() {
        let log = log();
        log.commit_next(&bootstrap()).await.unwrap();
        log.commit_next(&[add("a.parquet")]).await.unwrap();
        log.commit_next(&[remove("a.parquet"), add("b.parquet"), add("c.parquet")])
            .await
            .unwrap();

        let current = log.snapshot(None).await.unwrap();
        assert_eq!(current.version, Some(2));
        let paths: Vec<&str> = current.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["b.parquet", "c.parquet"]);
        assert!(current.metadata.is_some());
        assert!(current.protocol.is_some());

        let old = log.snapshot(Some(1)).await.unwrap();
        let old_paths: Vec<&str> = old.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(old_paths, vec!["a.parquet"]);
    }

    #[tokio::test]
    async fn test_commit_info_passthrough() {
        let log = log();
        let info = Action::CommitInfo(CommitInfoAction {
            timestamp: 1_700_000_000_000,
            operation: "WRITE".into(),
            operation_parameters: BTreeMap::new(),
            read_version: None,
        });
        log.commit_next(std::slice::from_ref(&info)).await.unwrap();
        assert_eq!(log.read_commit(0).await.unwrap(), vec![info]);
    }
}
