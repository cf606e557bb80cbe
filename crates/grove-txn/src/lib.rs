#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **grove-txn** – Transactional overlay for Grove storage backends.
//!
//! Wraps any [`StorageBackend`] with per-transaction in-memory write and
//! delete buffers. Reads inside a transaction see the pending sets first and
//! fall through to the base backend; writes and deletes touch the base only
//! at commit, in deterministic order, using atomic writes where the base
//! provides them.
//!
//! Transactions are independent of each other: pending sets are invisible
//! across transactions, and base reads are live, so two concurrent
//! transactions observe each other's already-committed changes. There is no
//! MVCC snapshot.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use grove_store_core::{
    FileStat, ListOptions, ListPage, Result, StorageBackend, StoreError, WriteOptions,
    WriteResult, validate_path,
};

//─────────────────────────────
//  Transactional store
//─────────────────────────────

/// A [`StorageBackend`] decorator that can mint transactions.
///
/// Non-transactional operations delegate straight to the base backend, so
/// the overlay can be layered anywhere a backend is expected. Wrapping an
/// already-wrapped store just adds a pass-through layer and changes no
/// behaviour.
pub struct TransactionalStore {
    base: Arc<dyn StorageBackend>,
}

impl TransactionalStore {
    /// Wrap a base backend with transaction support.
    pub fn wrap(base: Arc<dyn StorageBackend>) -> Arc<Self> {
        Arc::new(Self { base })
    }

    /// Begin a new, empty transaction.
    pub fn begin(&self) -> Transaction {
        let id = Uuid::new_v4();
        debug!(%id, "transaction started");
        Transaction {
            id,
            base: self.base.clone(),
            state: Mutex::new(TxState {
                status: TxStatus::Open,
                writes: BTreeMap::new(),
                deletes: BTreeSet::new(),
            }),
        }
    }

    /// The wrapped base backend.
    pub fn base(&self) -> &Arc<dyn StorageBackend> {
        &self.base
    }
}

#[async_trait]
impl StorageBackend for TransactionalStore {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.base.read(path).await
    }

    async fn read_range(&self, path: &str, start: u64, end: u64) -> Result<Vec<u8>> {
        self.base.read_range(path, start, end).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.base.exists(path).await
    }

    async fn stat(&self, path: &str) -> Result<Option<FileStat>> {
        self.base.stat(path).await
    }

    async fn write(&self, path: &str, bytes: &[u8], opts: WriteOptions) -> Result<WriteResult> {
        self.base.write(path, bytes, opts).await
    }

    async fn write_atomic(&self, path: &str, bytes: &[u8]) -> Result<WriteResult> {
        self.base.write_atomic(path, bytes).await
    }

    async fn write_conditional(
        &self,
        path: &str,
        bytes: &[u8],
        expected_etag: Option<&str>,
    ) -> Result<WriteResult> {
        self.base.write_conditional(path, bytes, expected_etag).await
    }

    async fn append(&self, path: &str, bytes: &[u8]) -> Result<WriteResult> {
        self.base.append(path, bytes).await
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        self.base.delete(path).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        self.base.delete_prefix(prefix).await
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        self.base.mkdir(path).await
    }

    async fn rmdir(&self, path: &str, recursive: bool) -> Result<()> {
        self.base.rmdir(path, recursive).await
    }

    async fn list(&self, prefix: &str, opts: ListOptions) -> Result<ListPage> {
        self.base.list(prefix, opts).await
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<()> {
        self.base.copy(src, dst).await
    }

    async fn rename(&self, src: &str, dst: &str) -> Result<()> {
        self.base.rename(src, dst).await
    }
}

//─────────────────────────────
//  Transactions
//─────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxStatus {
    Open,
    Committed,
    RolledBack,
}

struct TxState {
    status: TxStatus,
    writes: BTreeMap<String, Vec<u8>>,
    deletes: BTreeSet<String>,
}

impl TxState {
    fn ensure_open(&self, id: Uuid) -> Result<()> {
        match self.status {
            TxStatus::Open => Ok(()),
            TxStatus::Committed => Err(StoreError::Transaction {
                id,
                message: "already committed".into(),
            }),
            TxStatus::RolledBack => Err(StoreError::Transaction {
                id,
                message: "already rolled back".into(),
            }),
        }
    }
}

/// A live transaction over a base backend.
///
/// Buffered bytes are copied on write and returned as fresh copies on read,
/// so callers can never alias or mutate the pending state.
pub struct Transaction {
    id: Uuid,
    base: Arc<dyn StorageBackend>,
    state: Mutex<TxState>,
}

impl Transaction {
    /// Unique identifier of this transaction.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Read through the pending sets: buffered writes win, buffered deletes
    /// surface [`StoreError::FileNotFound`], anything else falls through to
    /// the base backend.
    pub async fn read(&self, path: &str) -> Result<Vec<u8>> {
        validate_path(path)?;
        {
            let state = self.state.lock().await;
            state.ensure_open(self.id)?;
            if let Some(bytes) = state.writes.get(path) {
                return Ok(bytes.clone());
            }
            if state.deletes.contains(path) {
                return Err(StoreError::FileNotFound { path: path.to_string() });
            }
        }
        self.base.read(path).await
    }

    /// Whether `path` is visible inside this transaction.
    pub async fn exists(&self, path: &str) -> Result<bool> {
        validate_path(path)?;
        {
            let state = self.state.lock().await;
            state.ensure_open(self.id)?;
            if state.writes.contains_key(path) {
                return Ok(true);
            }
            if state.deletes.contains(path) {
                return Ok(false);
            }
        }
        self.base.exists(path).await
    }

    /// Buffer a write. The base backend is untouched until commit.
    pub async fn write(&self, path: &str, bytes: &[u8]) -> Result<()> {
        validate_path(path)?;
        let mut state = self.state.lock().await;
        state.ensure_open(self.id)?;
        state.deletes.remove(path);
        state.writes.insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    /// Buffer a delete. The base backend is untouched until commit.
    pub async fn delete(&self, path: &str) -> Result<()> {
        validate_path(path)?;
        let mut state = self.state.lock().await;
        state.ensure_open(self.id)?;
        state.writes.remove(path);
        state.deletes.insert(path.to_string());
        Ok(())
    }

    /// Number of buffered mutations (writes + deletes).
    pub async fn pending_len(&self) -> usize {
        let state = self.state.lock().await;
        state.writes.len() + state.deletes.len()
    }

    /// Apply the pending writes (atomically, in ascending key order) and
    /// then the pending deletes (ascending key order, missing files are
    /// ignored). The transaction is closed afterwards even on error, so a
    /// failed commit cannot be retried against half-applied state.
    pub async fn commit(&self) -> Result<()> {
        let (writes, deletes) = {
            let mut state = self.state.lock().await;
            state.ensure_open(self.id)?;
            state.status = TxStatus::Committed;
            (std::mem::take(&mut state.writes), std::mem::take(&mut state.deletes))
        };

        for (path, bytes) in &writes {
            self.base.write_atomic(path, bytes).await?;
        }
        for path in &deletes {
            self.base.delete(path).await?;
        }
        debug!(id = %self.id, writes = writes.len(), deletes = deletes.len(), "transaction committed");
        Ok(())
    }

    /// Discard the pending sets and close the transaction.
    pub async fn rollback(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_open(self.id)?;
        state.status = TxStatus::RolledBack;
        state.writes.clear();
        state.deletes.clear();
        debug!(id = %self.id, "transaction rolled back");
        Ok(())
    }
}

//─────────────────────────────
//  Helpers
//─────────────────────────────

/// Run `op` inside a fresh transaction: commit on success, roll back when
/// `op` returns an error.
pub async fn run_in_transaction<F, Fut, T>(store: &TransactionalStore, op: F) -> Result<T>
where
    F: FnOnce(Arc<Transaction>) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let tx = Arc::new(store.begin());
    match op(tx.clone()).await {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(error) => {
            let _ = tx.rollback().await;
            Err(error)
        }
    }
}
