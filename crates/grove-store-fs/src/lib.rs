#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **grove-store-fs** – Filesystem storage driver for Grove.
//!
//! This crate provides a durable storage backend rooted at a directory.
//! Atomic writes go through a unique temporary file plus rename, and
//! conditional writes hold an OS-level advisory lock for the whole
//! stat-compare-write sequence so concurrent writers (including other
//! processes on the same host) serialize on the compare-and-swap.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs4::fs_std::FileExt as FileLockExt;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use grove_store_core::{
    FileStat, ListOptions, ListPage, Result, StorageBackend, StoreError, WriteOptions,
    WriteResult, paginate, validate_path,
};

/// Name of the lock file guarding conditional writes, kept directly under
/// the store root and never visible through the public namespace.
const CAS_LOCK_FILE: &str = ".grove-cas.lock";

//─────────────────────────────
//  Filesystem storage backend
//─────────────────────────────

/// A storage backend rooted at a local directory.
///
/// All public paths are relative to the root and validated against the
/// traversal rules before touching the filesystem.
#[derive(Debug)]
pub struct FsStore {
    root: PathBuf,
    // In-process writers serialize here; cross-process writers serialize on
    // the advisory lock file.
    cas_guard: Mutex<()>,
}

impl FsStore {
    /// Opens a store rooted at `root`, creating the directory when missing.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| StoreError::io(root.display().to_string(), e))?;
        Ok(Self { root, cas_guard: Mutex::new(()) })
    }

    /// The root directory of this store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        validate_path(path)?;
        Ok(self.root.join(path))
    }

    fn etag_of(bytes: &[u8]) -> String {
        blake3::hash(bytes).to_hex().to_string()
    }

    async fn ensure_parent(&self, abs: &Path, path: &str) -> Result<()> {
        if let Some(parent) = abs.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(path, e))?;
        }
        Ok(())
    }

    async fn write_via_temp(&self, abs: &Path, path: &str, bytes: &[u8]) -> Result<WriteResult> {
        self.ensure_parent(abs, path).await?;
        let temp = abs.with_file_name(format!(".tmp-{}", Uuid::new_v4()));
        tokio::fs::write(&temp, bytes)
            .await
            .map_err(|e| StoreError::io(path, e))?;
        if let Err(e) = tokio::fs::rename(&temp, abs).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(StoreError::io(path, e));
        }
        Ok(WriteResult { size: bytes.len() as u64, etag: Self::etag_of(bytes) })
    }

    /// Collect `(relative-path, metadata)` for every file under `dir`.
    async fn walk(&self, dir: PathBuf) -> Result<Vec<(String, std::fs::Metadata)>> {
        let mut found = Vec::new();
        let mut stack = vec![dir];
        while let Some(current) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&current).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StoreError::io(current.display().to_string(), e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| StoreError::io(current.display().to_string(), e))?
            {
                let meta = entry
                    .metadata()
                    .await
                    .map_err(|e| StoreError::io(current.display().to_string(), e))?;
                if meta.is_dir() {
                    stack.push(entry.path());
                } else {
                    let rel = entry
                        .path()
                        .strip_prefix(&self.root)
                        .map(|p| p.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/"))
                        .unwrap_or_default();
                    let name = rel.rsplit('/').next().unwrap_or("");
                    if name.starts_with(".tmp-") || rel == CAS_LOCK_FILE {
                        continue;
                    }
                    found.push((rel, meta));
                }
            }
        }
        Ok(found)
    }
}

fn mtime_of(meta: &std::fs::Metadata) -> DateTime<Utc> {
    meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| {
        DateTime::<Utc>::from(SystemTime::UNIX_EPOCH)
    })
}

#[async_trait]
impl StorageBackend for FsStore {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let abs = self.resolve(path)?;
        match tokio::fs::read(&abs).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::FileNotFound { path: path.to_string() })
            }
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    async fn read_range(&self, path: &str, start: u64, end: u64) -> Result<Vec<u8>> {
        let abs = self.resolve(path)?;
        if start > end {
            return Err(StoreError::InvalidRange { path: path.to_string(), start, end });
        }
        let mut file = match tokio::fs::File::open(&abs).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::FileNotFound { path: path.to_string() });
            }
            Err(e) => return Err(StoreError::io(path, e)),
        };
        let len = file
            .metadata()
            .await
            .map_err(|e| StoreError::io(path, e))?
            .len();
        let start = start.min(len);
        let end = end.min(len);
        let mut buf = vec![0u8; (end - start) as usize];
        file.seek(std::io::SeekFrom::Start(start))
            .await
            .map_err(|e| StoreError::io(path, e))?;
        file.read_exact(&mut buf)
            .await
            .map_err(|e| StoreError::io(path, e))?;
        Ok(buf)
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let abs = self.resolve(path)?;
        tokio::fs::try_exists(&abs)
            .await
            .map_err(|e| StoreError::io(path, e))
    }

    async fn stat(&self, path: &str) -> Result<Option<FileStat>> {
        let abs = self.resolve(path)?;
        let meta = match tokio::fs::metadata(&abs).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(path, e)),
        };
        if meta.is_dir() {
            return Ok(Some(FileStat {
                size: 0,
                mtime: mtime_of(&meta),
                etag: String::new(),
                is_directory: true,
            }));
        }
        let bytes = tokio::fs::read(&abs)
            .await
            .map_err(|e| StoreError::io(path, e))?;
        Ok(Some(FileStat {
            size: meta.len(),
            mtime: mtime_of(&meta),
            etag: Self::etag_of(&bytes),
            is_directory: false,
        }))
    }

    async fn write(&self, path: &str, bytes: &[u8], opts: WriteOptions) -> Result<WriteResult> {
        let abs = self.resolve(path)?;
        self.ensure_parent(&abs, path).await?;
        if opts.if_none_match {
            // create_new closes the check-then-write race at the OS level.
            let mut file = match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&abs)
                .await
            {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    return Err(StoreError::FileExists { path: path.to_string() });
                }
                Err(e) => return Err(StoreError::io(path, e)),
            };
            file.write_all(bytes).await.map_err(|e| StoreError::io(path, e))?;
            file.flush().await.map_err(|e| StoreError::io(path, e))?;
            return Ok(WriteResult { size: bytes.len() as u64, etag: Self::etag_of(bytes) });
        }
        tokio::fs::write(&abs, bytes)
            .await
            .map_err(|e| StoreError::io(path, e))?;
        Ok(WriteResult { size: bytes.len() as u64, etag: Self::etag_of(bytes) })
    }

    async fn write_atomic(&self, path: &str, bytes: &[u8]) -> Result<WriteResult> {
        let abs = self.resolve(path)?;
        self.write_via_temp(&abs, path, bytes).await
    }

    async fn write_conditional(
        &self,
        path: &str,
        bytes: &[u8],
        expected_etag: Option<&str>,
    ) -> Result<WriteResult> {
        let abs = self.resolve(path)?;
        let _in_process = self.cas_guard.lock().await;

        let root = self.root.clone();
        let abs_clone = abs.clone();
        let path_owned = path.to_string();
        let bytes_owned = bytes.to_vec();
        let expected = expected_etag.map(str::to_string);

        // The advisory lock spans read-etag, write-temp, rename; fs4 is a
        // blocking API so the whole critical section runs off the runtime.
        let result = tokio::task::spawn_blocking(move || {
            let lock_path = root.join(CAS_LOCK_FILE);
            let lockfile = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&lock_path)
                .map_err(|e| StoreError::io(path_owned.as_str(), e))?;
            FileLockExt::lock_exclusive(&lockfile)
                .map_err(|e| StoreError::io(path_owned.as_str(), e))?;

            let outcome = conditional_write_locked(
                &abs_clone,
                &path_owned,
                &bytes_owned,
                expected.as_deref(),
            );
            let _ = FileLockExt::unlock(&lockfile);
            outcome
        })
        .await
        .map_err(|e| {
            StoreError::io(path, std::io::Error::new(std::io::ErrorKind::Other, e))
        })?;

        if let Err(StoreError::VersionMismatch { .. }) = &result {
            debug!(path, "conditional write lost the race");
        }
        result
    }

    async fn append(&self, path: &str, bytes: &[u8]) -> Result<WriteResult> {
        let abs = self.resolve(path)?;
        self.ensure_parent(&abs, path).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&abs)
            .await
            .map_err(|e| StoreError::io(path, e))?;
        file.write_all(bytes).await.map_err(|e| StoreError::io(path, e))?;
        file.flush().await.map_err(|e| StoreError::io(path, e))?;
        let combined = tokio::fs::read(&abs)
            .await
            .map_err(|e| StoreError::io(path, e))?;
        Ok(WriteResult { size: combined.len() as u64, etag: Self::etag_of(&combined) })
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        let abs = self.resolve(path)?;
        match tokio::fs::remove_file(&abs).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        if !prefix.is_empty() {
            validate_path(prefix)?;
        }
        let dir = prefix.rsplit_once('/').map(|(d, _)| d).unwrap_or("");
        let base = if dir.is_empty() { self.root.clone() } else { self.root.join(dir) };
        let mut deleted = 0;
        for (rel, _) in self.walk(base).await? {
            if rel.starts_with(prefix) {
                let abs = self.root.join(&rel);
                match tokio::fs::remove_file(&abs).await {
                    Ok(()) => deleted += 1,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(StoreError::io(rel, e)),
                }
            }
        }
        Ok(deleted)
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let abs = self.resolve(path)?;
        tokio::fs::create_dir_all(&abs)
            .await
            .map_err(|e| StoreError::io(path, e))
    }

    async fn rmdir(&self, path: &str, recursive: bool) -> Result<()> {
        let abs = self.resolve(path)?;
        if !recursive {
            let mut entries = match tokio::fs::read_dir(&abs).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(StoreError::FileNotFound { path: path.to_string() });
                }
                Err(e) => return Err(StoreError::io(path, e)),
            };
            if entries
                .next_entry()
                .await
                .map_err(|e| StoreError::io(path, e))?
                .is_some()
            {
                return Err(StoreError::DirectoryNotEmpty { path: path.to_string() });
            }
        }
        let result = if recursive {
            tokio::fs::remove_dir_all(&abs).await
        } else {
            tokio::fs::remove_dir(&abs).await
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::FileNotFound { path: path.to_string() })
            }
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    async fn list(&self, prefix: &str, opts: ListOptions) -> Result<ListPage> {
        if !prefix.is_empty() {
            validate_path(prefix)?;
        }
        let dir = prefix.rsplit_once('/').map(|(d, _)| d).unwrap_or("");
        let base = if dir.is_empty() { self.root.clone() } else { self.root.join(dir) };

        let mut candidates = std::collections::BTreeMap::new();
        for (rel, meta) in self.walk(base).await? {
            if !rel.starts_with(prefix) {
                continue;
            }
            let etag = if opts.include_metadata {
                let bytes = tokio::fs::read(self.root.join(&rel))
                    .await
                    .map_err(|e| StoreError::io(rel.clone(), e))?;
                Self::etag_of(&bytes)
            } else {
                String::new()
            };
            candidates.insert(
                rel,
                FileStat {
                    size: meta.len(),
                    mtime: mtime_of(&meta),
                    etag,
                    is_directory: false,
                },
            );
        }
        Ok(paginate(prefix, &candidates, &opts))
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<()> {
        let abs_src = self.resolve(src)?;
        let abs_dst = self.resolve(dst)?;
        self.ensure_parent(&abs_dst, dst).await?;
        match tokio::fs::copy(&abs_src, &abs_dst).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::FileNotFound { path: src.to_string() })
            }
            Err(e) => Err(StoreError::io(src, e)),
        }
    }

    async fn rename(&self, src: &str, dst: &str) -> Result<()> {
        let abs_src = self.resolve(src)?;
        let abs_dst = self.resolve(dst)?;
        self.ensure_parent(&abs_dst, dst).await?;
        match tokio::fs::rename(&abs_src, &abs_dst).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::FileNotFound { path: src.to_string() })
            }
            Err(e) => Err(StoreError::io(src, e)),
        }
    }
}

/// Body of the conditional write, executed while the advisory lock is held.
fn conditional_write_locked(
    abs: &Path,
    path: &str,
    bytes: &[u8],
    expected_etag: Option<&str>,
) -> Result<WriteResult> {
    let actual = match std::fs::read(abs) {
        Ok(current) => Some(FsStore::etag_of(&current)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(StoreError::io(path, e)),
    };
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
    if let Some(parent) = abs.parent() {
        std::fs::create_dir_all(parent).map_err(|e| StoreError::io(path, e))?;
    }
    let temp = abs.with_file_name(format!(".tmp-{}", Uuid::new_v4()));
    std::fs::write(&temp, bytes).map_err(|e| StoreError::io(path, e))?;
    if let Err(e) = std::fs::rename(&temp, abs) {
        let _ = std::fs::remove_file(&temp);
        return Err(StoreError::io(path, e));
    }
    Ok(WriteResult { size: bytes.len() as u64, etag: FsStore::etag_of(bytes) })
}
