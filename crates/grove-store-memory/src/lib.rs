#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **grove-store-memory** – In-memory storage driver for Grove.
//!
//! This crate provides a fast, non-persistent storage backend suitable for
//! testing, development, and scenarios where persistence is not required.
//! All data is stored in memory and lost when the process terminates.
//!
//! Conditional writes are linearized through the store's write lock, so the
//! exactly-one-winner contract holds for any number of concurrent writers.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use grove_store_core::{
    FileStat, ListOptions, ListPage, Result, StorageBackend, StoreError, WriteOptions,
    WriteResult, paginate, validate_path,
};

//─────────────────────────────
//  In-memory storage backend
//─────────────────────────────

#[derive(Debug, Clone)]
struct FileEntry {
    bytes: Vec<u8>,
    mtime: DateTime<Utc>,
    etag: String,
}

impl From<FileEntry> for FileStat {
    fn from(entry: FileEntry) -> Self {
        FileStat {
            size: entry.bytes.len() as u64,
            mtime: entry.mtime,
            etag: entry.etag,
            is_directory: false,
        }
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    files: BTreeMap<String, FileEntry>,
    dirs: BTreeSet<String>,
}

impl MemoryInner {
    fn is_dir(&self, path: &str) -> bool {
        let dir_prefix = format!("{path}/");
        self.dirs.contains(path)
            || self
                .files
                .range(dir_prefix.clone()..)
                .next()
                .is_some_and(|(p, _)| p.starts_with(&dir_prefix))
    }
}

/// An in-memory, non-persistent storage backend.
///
/// Cloning is cheap and shares the underlying namespace, mirroring how a
/// handle to a remote store behaves.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<MemoryInner>>,
    revision: Arc<AtomicU64>,
}

impl MemoryStore {
    /// Creates a new, empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of files currently stored.
    pub async fn file_count(&self) -> usize {
        self.inner.read().await.files.len()
    }

    /// Drop every file and directory.
    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        inner.files.clear();
        inner.dirs.clear();
    }

    fn make_etag(&self, bytes: &[u8]) -> String {
        // Revision prefix keeps etags distinct even when identical content
        // is rewritten; the hash keeps them content-addressed.
        let rev = self.revision.fetch_add(1, Ordering::Relaxed);
        let hash = blake3::hash(bytes);
        format!("{rev:012x}-{}", &hash.to_hex()[..16])
    }

    fn store_file(&self, inner: &mut MemoryInner, path: &str, bytes: &[u8]) -> WriteResult {
        let etag = self.make_etag(bytes);
        inner.files.insert(
            path.to_string(),
            FileEntry { bytes: bytes.to_vec(), mtime: Utc::now(), etag: etag.clone() },
        );
        WriteResult { size: bytes.len() as u64, etag }
    }
}

#[async_trait]
impl StorageBackend for MemoryStore {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        validate_path(path)?;
        let inner = self.inner.read().await;
        inner
            .files
            .get(path)
            .map(|entry| entry.bytes.clone())
            .ok_or_else(|| StoreError::FileNotFound { path: path.to_string() })
    }

    async fn read_range(&self, path: &str, start: u64, end: u64) -> Result<Vec<u8>> {
        validate_path(path)?;
        if start > end {
            return Err(StoreError::InvalidRange { path: path.to_string(), start, end });
        }
        let inner = self.inner.read().await;
        let entry = inner
            .files
            .get(path)
            .ok_or_else(|| StoreError::FileNotFound { path: path.to_string() })?;
        let len = entry.bytes.len() as u64;
        let start = start.min(len) as usize;
        let end = end.min(len) as usize;
        Ok(entry.bytes[start..end].to_vec())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        validate_path(path)?;
        let inner = self.inner.read().await;
        Ok(inner.files.contains_key(path) || inner.is_dir(path))
    }

    async fn stat(&self, path: &str) -> Result<Option<FileStat>> {
        validate_path(path)?;
        let inner = self.inner.read().await;
        if let Some(entry) = inner.files.get(path) {
            return Ok(Some(entry.clone().into()));
        }
        if inner.is_dir(path) {
            return Ok(Some(FileStat {
                size: 0,
                mtime: Utc::now(),
                etag: String::new(),
                is_directory: true,
            }));
        }
        Ok(None)
    }

    async fn write(&self, path: &str, bytes: &[u8], opts: WriteOptions) -> Result<WriteResult> {
        validate_path(path)?;
        let mut inner = self.inner.write().await;
        if opts.if_none_match && inner.files.contains_key(path) {
            return Err(StoreError::FileExists { path: path.to_string() });
        }
        Ok(self.store_file(&mut inner, path, bytes))
    }

    async fn write_atomic(&self, path: &str, bytes: &[u8]) -> Result<WriteResult> {
        // A single write-lock section is already all-or-nothing in memory.
        self.write(path, bytes, WriteOptions::default()).await
    }

    async fn write_conditional(
        &self,
        path: &str,
        bytes: &[u8],
        expected_etag: Option<&str>,
    ) -> Result<WriteResult> {
        validate_path(path)?;
        let mut inner = self.inner.write().await;
        let actual = inner.files.get(path).map(|entry| entry.etag.clone());
        match (expected_etag, actual.as_deref()) {
            (None, None) => {}
            (Some(expected), Some(current)) if expected == current => {}
            _ => {
                return Err(StoreError::VersionMismatch {
                    path: path.to_string(),
                    expected: expected_etag.map(str::to_string),
                    actual,
                });
            }
        }
        Ok(self.store_file(&mut inner, path, bytes))
    }

    async fn append(&self, path: &str, bytes: &[u8]) -> Result<WriteResult> {
        validate_path(path)?;
        let mut inner = self.inner.write().await;
        let mut combined = inner
            .files
            .get(path)
            .map(|entry| entry.bytes.clone())
            .unwrap_or_default();
        combined.extend_from_slice(bytes);
        Ok(self.store_file(&mut inner, path, &combined))
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        validate_path(path)?;
        let mut inner = self.inner.write().await;
        Ok(inner.files.remove(path).is_some())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        if !prefix.is_empty() {
            validate_path(prefix)?;
        }
        let mut inner = self.inner.write().await;
        let doomed: Vec<String> = inner
            .files
            .range(prefix.to_string()..)
            .take_while(|(p, _)| p.starts_with(prefix))
            .map(|(p, _)| p.clone())
            .collect();
        for path in &doomed {
            inner.files.remove(path);
        }
        Ok(doomed.len())
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        validate_path(path)?;
        let mut inner = self.inner.write().await;
        let mut accumulated = String::new();
        for segment in path.split('/') {
            if !accumulated.is_empty() {
                accumulated.push('/');
            }
            accumulated.push_str(segment);
            inner.dirs.insert(accumulated.clone());
        }
        Ok(())
    }

    async fn rmdir(&self, path: &str, recursive: bool) -> Result<()> {
        validate_path(path)?;
        let mut inner = self.inner.write().await;
        if !inner.dirs.contains(path) && !inner.is_dir(path) {
            return Err(StoreError::FileNotFound { path: path.to_string() });
        }
        let dir_prefix = format!("{path}/");
        let has_children = inner
            .files
            .range(dir_prefix.clone()..)
            .next()
            .is_some_and(|(p, _)| p.starts_with(&dir_prefix))
            || inner
                .dirs
                .range(dir_prefix.clone()..)
                .next()
                .is_some_and(|p| p.starts_with(&dir_prefix));
        if has_children && !recursive {
            return Err(StoreError::DirectoryNotEmpty { path: path.to_string() });
        }
        if recursive {
            let doomed: Vec<String> = inner
                .files
                .range(dir_prefix.clone()..)
                .take_while(|(p, _)| p.starts_with(&dir_prefix))
                .map(|(p, _)| p.clone())
                .collect();
            for file in doomed {
                inner.files.remove(&file);
            }
            let doomed_dirs: Vec<String> = inner
                .dirs
                .range(dir_prefix.clone()..)
                .take_while(|p| p.starts_with(&dir_prefix))
                .cloned()
                .collect();
            for dir in doomed_dirs {
                inner.dirs.remove(&dir);
            }
        }
        inner.dirs.remove(path);
        Ok(())
    }

    async fn list(&self, prefix: &str, opts: ListOptions) -> Result<ListPage> {
        if !prefix.is_empty() {
            validate_path(prefix)?;
        }
        let inner = self.inner.read().await;
        Ok(paginate(prefix, &inner.files, &opts))
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<()> {
        validate_path(src)?;
        validate_path(dst)?;
        let mut inner = self.inner.write().await;
        let bytes = inner
            .files
            .get(src)
            .map(|entry| entry.bytes.clone())
            .ok_or_else(|| StoreError::FileNotFound { path: src.to_string() })?;
        self.store_file(&mut inner, dst, &bytes);
        Ok(())
    }

    async fn rename(&self, src: &str, dst: &str) -> Result<()> {
        validate_path(src)?;
        validate_path(dst)?;
        let mut inner = self.inner.write().await;
        let entry = inner
            .files
            .remove(src)
            .ok_or_else(|| StoreError::FileNotFound { path: src.to_string() })?;
        inner.files.insert(dst.to_string(), entry);
        Ok(())
    }
}
