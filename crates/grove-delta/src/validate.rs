//! Action validation shared by the parsing and creation helpers.
//!
//! The same constraints back both surfaces: [`validate_action`] reports
//! every violated field for diagnostics, while [`check`] raises on the
//! first use of an invalid action.

use crate::{Action, DeltaError, FileStats, Result};

/// Outcome of validating a single action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    /// True when no constraint was violated.
    pub valid: bool,
    /// Human-readable description of every violation.
    pub errors: Vec<String>,
}

/// Validate an action, reporting every violated constraint.
pub fn validate_action(action: &Action) -> Validation {
    let mut errors = Vec::new();
    match action {
        Action::Add(add) => {
            path_errors(&add.path, &mut errors);
            if add.size < 0 {
                errors.push(format!("size must be non-negative, got {}", add.size));
            }
            if add.modification_time < 0 {
                errors.push(format!(
                    "modificationTime must be non-negative, got {}",
                    add.modification_time
                ));
            }
            if let Some(raw) = &add.stats {
                match serde_json::from_str::<FileStats>(raw) {
                    Ok(stats) => errors.extend(stats_errors(&stats)),
                    Err(e) => errors.push(format!("stats is not valid JSON: {e}")),
                }
            }
        }
        Action::Remove(remove) => {
            path_errors(&remove.path, &mut errors);
            if let Some(ts) = remove.deletion_timestamp {
                if ts < 0 {
                    errors.push(format!("deletionTimestamp must be non-negative, got {ts}"));
                }
            }
        }
        Action::Metadata(meta) => {
            if meta.id.is_empty() {
                errors.push("metaData.id must not be empty".to_string());
            }
            if meta.schema_string.is_empty() {
                errors.push("schemaString must not be empty".to_string());
            } else if serde_json::from_str::<serde_json::Value>(&meta.schema_string).is_err() {
                errors.push("schemaString must be valid JSON".to_string());
            }
        }
        Action::Protocol(protocol) => {
            if protocol.min_reader_version < 1 {
                errors.push(format!(
                    "minReaderVersion must be >= 1, got {}",
                    protocol.min_reader_version
                ));
            }
            if protocol.min_writer_version < 1 {
                errors.push(format!(
                    "minWriterVersion must be >= 1, got {}",
                    protocol.min_writer_version
                ));
            }
        }
        Action::CommitInfo(info) => {
            if info.timestamp < 0 {
                errors.push(format!("timestamp must be non-negative, got {}", info.timestamp));
            }
            if let Some(read_version) = info.read_version {
                if read_version < 0 {
                    errors.push(format!("readVersion must be non-negative, got {read_version}"));
                }
            }
        }
    }
    Validation { valid: errors.is_empty(), errors }
}

/// Raise [`DeltaError::InvalidAction`] when the action is invalid.
pub fn check(action: &Action) -> Result<()> {
    let validation = validate_action(action);
    if validation.valid {
        Ok(())
    } else {
        Err(DeltaError::InvalidAction { reasons: validation.errors })
    }
}

/// The add/remove path contract: relative, no `./` prefix, no `..`
/// segments.
fn path_errors(path: &str, errors: &mut Vec<String>) {
    if path.is_empty() {
        errors.push("path must not be empty".to_string());
        return;
    }
    if path.starts_with('/') {
        errors.push(format!("path must be relative: {path:?}"));
    }
    if path.starts_with("./") {
        errors.push(format!("path must not start with ./: {path:?}"));
    }
    if path.split('/').any(|segment| segment == "..") {
        errors.push(format!("path must not contain .. segments: {path:?}"));
    }
    if path.contains('\0') {
        errors.push(format!("path must not contain null bytes: {path:?}"));
    }
}

/// Stats bounds: numRecords ≥ 0, each nullCount in `[0, numRecords]`.
pub(crate) fn stats_errors(stats: &FileStats) -> Vec<String> {
    let mut errors = Vec::new();
    if stats.num_records < 0 {
        errors.push(format!("numRecords must be >= 0, got {}", stats.num_records));
    }
    for (column, count) in &stats.null_count {
        if *count < 0 {
            errors.push(format!("nullCount[{column}] must be >= 0, got {count}"));
        } else if *count > stats.num_records {
            errors.push(format!(
                "nullCount[{column}] = {count} exceeds numRecords = {}",
                stats.num_records
            ));
        }
    }
    errors
}
