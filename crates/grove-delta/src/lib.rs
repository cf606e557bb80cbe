#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **grove-delta** – Delta-compatible transaction log for Grove.
//!
//! Commits are NDJSON files of action records (`add`, `remove`, `metaData`,
//! `protocol`, `commitInfo`) named by 20-digit zero-padded version under a
//! table's `_delta_log/` directory. Commit creation goes through the storage
//! backend's conditional write, so concurrent committers race on the version
//! file and exactly one wins.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

pub mod log;
pub mod validate;

pub use log::{DeltaLog, TableSnapshot};
pub use validate::{Validation, validate_action};

//─────────────────────────────
//  Error type
//─────────────────────────────

/// Errors produced by the transaction-log layer.
#[derive(Debug, thiserror::Error)]
pub enum DeltaError {
    /// A commit line could not be parsed as an action.
    #[error("malformed action on line {line}: {source}")]
    Parse {
        /// 1-based line number inside the commit file.
        line: usize,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
    /// An action violated the path or stats contract.
    #[error("invalid action: {reasons:?}")]
    InvalidAction {
        /// Every violated constraint.
        reasons: Vec<String>,
    },
    /// A stats string could not be parsed.
    #[error("malformed stats: {source}")]
    Stats {
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
    /// The version file already existed; another writer committed first.
    #[error("commit conflict at version {version}")]
    CommitConflict {
        /// Version that was contested.
        version: u64,
    },
    /// A file name was not a valid commit version.
    #[error("not a commit file name: {name:?}")]
    BadVersion {
        /// Offending name.
        name: String,
    },
    /// Storage failure.
    #[error(transparent)]
    Store(#[from] grove_store_core::StoreError),
}

/// Result alias for this crate.
pub type Result<T, E = DeltaError> = std::result::Result<T, E>;

//─────────────────────────────
//  Actions
//─────────────────────────────

/// Table storage format descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Format {
    /// Format provider, `parquet` in practice.
    pub provider: String,
    /// Provider-specific options.
    #[serde(default)]
    pub options: HashMap<String, String>,
}

impl Default for Format {
    fn default() -> Self {
        Self { provider: "parquet".to_string(), options: HashMap::new() }
    }
}

/// Add a data file to the table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddAction {
    /// Path of the data file, relative to the table root.
    pub path: String,
    /// Partition column values for this file.
    #[serde(default)]
    pub partition_values: HashMap<String, String>,
    /// File size in bytes.
    pub size: i64,
    /// Modification time in epoch milliseconds.
    pub modification_time: i64,
    /// Whether the file changes visible data.
    pub data_change: bool,
    /// Per-file statistics, JSON-encoded (see [`FileStats`]).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<String>,
}

impl AddAction {
    /// Create a validated add action with no stats or partition values.
    pub fn new(path: impl Into<String>, size: i64, modification_time: i64) -> Result<Self> {
        let action = Self {
            path: path.into(),
            partition_values: HashMap::new(),
            size,
            modification_time,
            data_change: true,
            stats: None,
        };
        validate::check(&Action::Add(action.clone()))?;
        Ok(action)
    }
}

/// Remove a data file from the table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveAction {
    /// Path of the removed file, relative to the table root.
    pub path: String,
    /// When the removal happened, epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<i64>,
    /// Whether the removal changes visible data.
    pub data_change: bool,
}

impl RemoveAction {
    /// Create a validated remove action.
    pub fn new(path: impl Into<String>, deletion_timestamp: i64) -> Result<Self> {
        let action = Self {
            path: path.into(),
            deletion_timestamp: Some(deletion_timestamp),
            data_change: true,
        };
        validate::check(&Action::Remove(action.clone()))?;
        Ok(action)
    }
}

/// Table identity, format, and schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataAction {
    /// Stable table identifier.
    pub id: String,
    /// Optional human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Storage format.
    pub format: Format,
    /// JSON-encoded schema.
    pub schema_string: String,
    /// Partition columns, in order.
    #[serde(default)]
    pub partition_columns: Vec<String>,
    /// Free-form table configuration.
    #[serde(default)]
    pub configuration: HashMap<String, String>,
    /// Creation time in epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_time: Option<i64>,
}

/// Minimum reader/writer protocol versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolAction {
    /// Minimum reader version, ≥ 1.
    pub min_reader_version: i32,
    /// Minimum writer version, ≥ 1.
    pub min_writer_version: i32,
}

/// Commit provenance record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitInfoAction {
    /// Commit time in epoch milliseconds.
    pub timestamp: i64,
    /// Operation label, e.g. `WRITE` or `DELETE`.
    pub operation: String,
    /// Operation parameters.
    #[serde(default)]
    pub operation_parameters: BTreeMap<String, serde_json::Value>,
    /// Table version this commit read before writing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_version: Option<i64>,
}

/// One action record. The externally-tagged encoding yields exactly the
/// Delta wire form, one object per NDJSON line, e.g. `{"add":{...}}`;
/// unrecognized tags fail parsing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Action {
    /// `{"add": ...}`
    #[serde(rename = "add")]
    Add(AddAction),
    /// `{"remove": ...}`
    #[serde(rename = "remove")]
    Remove(RemoveAction),
    /// `{"metaData": ...}`
    #[serde(rename = "metaData")]
    Metadata(MetadataAction),
    /// `{"protocol": ...}`
    #[serde(rename = "protocol")]
    Protocol(ProtocolAction),
    /// `{"commitInfo": ...}`
    #[serde(rename = "commitInfo")]
    CommitInfo(CommitInfoAction),
}

//─────────────────────────────
//  File statistics
//─────────────────────────────

/// Per-file statistics carried on an [`AddAction`] as a JSON string.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStats {
    /// Number of records in the file, ≥ 0.
    pub num_records: i64,
    /// Per-column minimum values.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub min_values: BTreeMap<String, serde_json::Value>,
    /// Per-column maximum values.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub max_values: BTreeMap<String, serde_json::Value>,
    /// Per-column null counts, each in `[0, num_records]`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub null_count: BTreeMap<String, i64>,
}

/// Parse a stats JSON string.
pub fn parse_stats(raw: &str) -> Result<FileStats> {
    let stats: FileStats =
        serde_json::from_str(raw).map_err(|source| DeltaError::Stats { source })?;
    let check = validate::stats_errors(&stats);
    if check.is_empty() {
        Ok(stats)
    } else {
        Err(DeltaError::InvalidAction { reasons: check })
    }
}

/// Encode stats back to their JSON string form. Ordered maps make the
/// output deterministic, so `encode_stats(parse_stats(x))` preserves
/// content.
pub fn encode_stats(stats: &FileStats) -> String {
    // FileStats contains no map keys or values that can fail to serialize.
    serde_json::to_string(stats).unwrap_or_default()
}

//─────────────────────────────
//  Version formatting
//─────────────────────────────

/// Width of a zero-padded commit version.
pub const VERSION_WIDTH: usize = 20;

/// Format a version as its 20-digit zero-padded decimal form.
pub fn format_version(version: u64) -> String {
    format!("{version:020}")
}

/// Commit file name for a version, `<20-digit>.json`.
pub fn commit_file_name(version: u64) -> String {
    format!("{version:020}.json")
}

/// Parse a commit file name; rejects any other width or suffix.
pub fn parse_commit_file_name(name: &str) -> Result<u64> {
    let bad = || DeltaError::BadVersion { name: name.to_string() };
    let digits = name.strip_suffix(".json").ok_or_else(bad)?;
    if digits.len() != VERSION_WIDTH || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(bad());
    }
    digits.parse().map_err(|_| bad())
}

/// Path of a commit file under a table root.
pub fn log_path(table: &str, version: u64) -> String {
    format!("{table}/_delta_log/{}", commit_file_name(version))
}

/// Path of a checkpoint file under a table root.
pub fn checkpoint_path(table: &str, version: u64) -> String {
    format!("{table}/_delta_log/{}.checkpoint.parquet", format_version(version))
}

//─────────────────────────────
//  Commit (de)serialization
//─────────────────────────────

/// Serialize actions to NDJSON, one action per line, order preserved.
pub fn serialize_commit(actions: &[Action]) -> Result<String> {
    let mut out = String::new();
    for action in actions {
        let line = serde_json::to_string(action)
            .map_err(|source| DeltaError::Parse { line: 0, source })?;
        out.push_str(&line);
        out.push('\n');
    }
    Ok(out)
}

/// Parse an NDJSON commit. Order is preserved; CRLF line endings and blank
/// lines are tolerated; an unrecognized action tag fails the whole parse.
pub fn parse_commit(raw: &str) -> Result<Vec<Action>> {
    let mut actions = Vec::new();
    for (index, line) in raw.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        let action: Action = serde_json::from_str(line)
            .map_err(|source| DeltaError::Parse { line: index + 1, source })?;
        actions.push(action);
    }
    Ok(actions)
}
