#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **grove-store-core** – Core storage abstractions for Grove.
//!
//! This crate defines the byte-addressable storage namespace every other
//! kernel component is built on: the [`StorageBackend`] trait, the storage
//! error taxonomy, and the path-safety rules enforced before any I/O.
//! Concrete drivers (in-memory, filesystem, object stores) implement the
//! trait in separate crates that depend on this core abstraction.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod path;

pub use path::{matches_pattern, validate_path};

//─────────────────────────────
//  Error types
//─────────────────────────────

/// Errors surfaced by storage backends and the layers directly above them.
///
/// `VersionMismatch`/`ConcurrentWrite` are recovered internally by the
/// segment manager with bounded retry; `PathTraversal` is fatal and never
/// retried; everything else is surfaced to the caller verbatim.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The named file does not exist.
    #[error("file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },
    /// The named file already exists and the operation required it not to.
    #[error("file already exists: {path}")]
    FileExists {
        /// Path that was requested.
        path: String,
    },
    /// A non-recursive rmdir hit a non-empty directory.
    #[error("directory not empty: {path}")]
    DirectoryNotEmpty {
        /// Path that was requested.
        path: String,
    },
    /// A conditional write observed an etag other than the expected one.
    #[error("version mismatch on {path}: expected {expected:?}, found {actual:?}")]
    VersionMismatch {
        /// Path that was written.
        path: String,
        /// Etag the caller expected, `None` for must-not-exist writes.
        expected: Option<String>,
        /// Etag actually present, `None` when the file is missing.
        actual: Option<String>,
    },
    /// Two writers raced on the same path and this one lost.
    #[error("concurrent write detected on {path}")]
    ConcurrentWrite {
        /// Path that was written.
        path: String,
    },
    /// The path failed validation. Never retried, never caught internally.
    #[error("path traversal rejected: {path:?}")]
    PathTraversal {
        /// Offending path.
        path: String,
    },
    /// A byte-range request was out of order.
    #[error("invalid range [{start}, {end}) on {path}")]
    InvalidRange {
        /// Path that was read.
        path: String,
        /// Range start.
        start: u64,
        /// Range end (exclusive).
        end: u64,
    },
    /// An operation was attempted on a committed or rolled-back transaction.
    #[error("transaction {id} is closed: {message}")]
    Transaction {
        /// Transaction identifier.
        id: Uuid,
        /// What was attempted.
        message: String,
    },
    /// The backend timed out. Distinct from I/O failure so callers can
    /// apply their own retry policy.
    #[error("backend timed out on {path}")]
    Timeout {
        /// Path that was accessed.
        path: String,
    },
    /// Underlying I/O failure.
    #[error("i/o error on {path}: {source}")]
    Io {
        /// Path that was accessed.
        path: String,
        /// OS-level error.
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    /// Helper attaching a path to a raw I/O error.
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        StoreError::Io { path: path.into(), source }
    }

    /// True for errors that a conditional-write loop may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::VersionMismatch { .. } | StoreError::ConcurrentWrite { .. }
        )
    }
}

/// Result alias used across the storage crates.
pub type Result<T, E = StoreError> = std::result::Result<T, E>;

//─────────────────────────────
//  Operation inputs / outputs
//─────────────────────────────

/// Metadata for a stored file or directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    /// Size in bytes. Zero for directories.
    pub size: u64,
    /// Last modification time.
    pub mtime: DateTime<Utc>,
    /// Content etag; changes whenever the content changes.
    pub etag: String,
    /// True for directories.
    pub is_directory: bool,
}

/// Outcome of a successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteResult {
    /// Bytes written.
    pub size: u64,
    /// Etag of the stored content.
    pub etag: String,
}

/// Options for plain writes.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Fail with [`StoreError::FileExists`] when the target already exists.
    pub if_none_match: bool,
}

/// Options for [`StorageBackend::list`].
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Maximum number of entries to return.
    pub limit: Option<usize>,
    /// Opaque continuation cursor from a previous page.
    pub cursor: Option<String>,
    /// Collapse names past this delimiter into common prefixes.
    pub delimiter: Option<String>,
    /// Glob pattern (`*`, `?`) applied to the path after the prefix.
    pub pattern: Option<String>,
    /// Populate per-entry metadata and aggregate stats.
    pub include_metadata: bool,
}

/// One file returned by [`StorageBackend::list`].
#[derive(Debug, Clone, PartialEq)]
pub struct ListEntry {
    /// Full path of the file.
    pub path: String,
    /// Metadata, present when `include_metadata` was requested.
    pub meta: Option<FileStat>,
}

/// Aggregate listing statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ListStats {
    /// Number of files in this page.
    pub total_files: usize,
    /// Summed size of the files in this page.
    pub total_bytes: u64,
}

/// One page of listing output.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    /// Files in lexicographic order.
    pub files: Vec<ListEntry>,
    /// Common prefixes, populated when a delimiter was given.
    pub prefixes: Vec<String>,
    /// Aggregate stats, present when `include_metadata` was requested.
    pub stats: Option<ListStats>,
    /// Cursor for the next page, when `has_more`.
    pub cursor: Option<String>,
    /// True when the listing was truncated by `limit`.
    pub has_more: bool,
}

impl ListPage {
    /// Paths of the listed files.
    pub fn paths(&self) -> Vec<String> {
        self.files.iter().map(|f| f.path.clone()).collect()
    }
}

//─────────────────────────────
//  Storage backend trait
//─────────────────────────────

/// Abstract byte-addressable namespace.
///
/// Every input path is validated against the traversal rules (no absolute
/// paths, no `..` segments raw or URL-encoded, no null bytes) before any
/// I/O; violations fail with [`StoreError::PathTraversal`].
///
/// Concurrency contract: `write_conditional` must be linearizable — in a
/// race of N concurrent conditional writes against the same etag exactly
/// one succeeds and the rest fail with [`StoreError::VersionMismatch`].
/// Implementations on mutable local filesystems hold an OS-level lock
/// spanning the stat and the write to close the TOCTOU window.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read a whole file.
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Read the byte range `[start, end)`; `end` is clamped to the file
    /// size. Fails with [`StoreError::InvalidRange`] when `start > end`.
    async fn read_range(&self, path: &str, start: u64, end: u64) -> Result<Vec<u8>>;

    /// True when a file or directory exists at `path`.
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Metadata for `path`, or `None` when nothing is there.
    async fn stat(&self, path: &str) -> Result<Option<FileStat>>;

    /// Write a file, creating parent directories as needed.
    async fn write(&self, path: &str, bytes: &[u8], opts: WriteOptions) -> Result<WriteResult>;

    /// Write a file so that observers see either the pre-existing content
    /// or the new content, never a partial write. Implementations write to
    /// a unique temporary path and rename.
    async fn write_atomic(&self, path: &str, bytes: &[u8]) -> Result<WriteResult>;

    /// Compare-and-swap write. With `expected_etag = Some(e)` the write
    /// succeeds only if the current etag equals `e`; with `None` it
    /// succeeds only if the file does not exist.
    async fn write_conditional(
        &self,
        path: &str,
        bytes: &[u8],
        expected_etag: Option<&str>,
    ) -> Result<WriteResult>;

    /// Append bytes to a file, creating it when missing.
    async fn append(&self, path: &str, bytes: &[u8]) -> Result<WriteResult>;

    /// Delete a file. Returns false when nothing was there.
    async fn delete(&self, path: &str) -> Result<bool>;

    /// Delete every file under `prefix`; returns the number deleted.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize>;

    /// Create a directory (and parents).
    async fn mkdir(&self, path: &str) -> Result<()>;

    /// Remove a directory. Non-recursive removal of a non-empty directory
    /// fails with [`StoreError::DirectoryNotEmpty`].
    async fn rmdir(&self, path: &str, recursive: bool) -> Result<()>;

    /// List files under `prefix` in lexicographic order.
    async fn list(&self, prefix: &str, opts: ListOptions) -> Result<ListPage>;

    /// Copy a file.
    async fn copy(&self, src: &str, dst: &str) -> Result<()>;

    /// Move a file. Atomic where the underlying store supports rename.
    async fn rename(&self, src: &str, dst: &str) -> Result<()>;
}

//─────────────────────────────
//  Shared listing helper
//─────────────────────────────

/// Apply the [`ListOptions`] paging/delimiter/pattern rules to an ordered
/// map of candidate paths. Drivers collect their candidates and delegate
/// the shared semantics here so every backend pages identically.
pub fn paginate<M>(prefix: &str, candidates: &BTreeMap<String, M>, opts: &ListOptions) -> ListPage
where
    M: Clone + Into<FileStat>,
{
    let mut files = Vec::new();
    let mut prefixes: Vec<String> = Vec::new();
    let mut stats = ListStats::default();
    let mut has_more = false;
    let limit = opts.limit.unwrap_or(usize::MAX);

    for (path, meta) in candidates.range(prefix.to_string()..) {
        if !path.starts_with(prefix) {
            break;
        }
        if let Some(cursor) = &opts.cursor {
            if path.as_str() <= cursor.as_str() {
                continue;
            }
        }
        let remainder = &path[prefix.len()..];
        if let Some(delim) = &opts.delimiter {
            if let Some(pos) = remainder.find(delim.as_str()) {
                let common = format!("{}{}", prefix, &remainder[..pos + delim.len()]);
                if prefixes.last() != Some(&common) {
                    prefixes.push(common);
                }
                continue;
            }
        }
        if let Some(pattern) = &opts.pattern {
            if !matches_pattern(remainder, pattern) {
                continue;
            }
        }
        if files.len() >= limit {
            has_more = true;
            break;
        }
        let stat: FileStat = meta.clone().into();
        stats.total_files += 1;
        stats.total_bytes += stat.size;
        files.push(ListEntry {
            path: path.clone(),
            meta: opts.include_metadata.then_some(stat),
        });
    }

    let cursor = has_more.then(|| files.last().map(|f| f.path.clone())).flatten();
    ListPage {
        files,
        prefixes,
        stats: opts.include_metadata.then_some(stats),
        cursor,
        has_more,
    }
}


//─────────────────────────────
//  Convenience re-exports
//─────────────────────────────

/// Convenient prelude for importing the most common types.
pub mod prelude {
    pub use super::{
        FileStat, ListEntry, ListOptions, ListPage, ListStats, Result, StorageBackend, StoreError,
        WriteOptions, WriteResult, validate_path,
    };
}
