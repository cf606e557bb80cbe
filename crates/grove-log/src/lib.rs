#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **grove-log** – Event log and CDC stream for Grove.
//!
//! Accepted events are buffered into an active segment; when a row-count or
//! byte-size threshold is reached the buffer is sealed into an immutable
//! segment file and the manifest is replaced by conditional write. Readers
//! observe the log as a lazy, segment-by-segment stream in write order;
//! time-ordered semantics are the business of compaction and replay, not of
//! the raw stream.
//!
//! Materialized views subscribe through the [`ViewRouter`]: each sealed
//! batch is grouped by namespace and delivered at-least-once per commit
//! point. Handlers key their outputs by event id for idempotence.

pub mod log;
pub mod sampling;
pub mod segment;
pub mod views;

pub use log::{EventLog, ScanOptions, SegmentLimits};
pub use sampling::{ContentSample, ContentSampler, SamplingConfig};
pub use segment::{Manifest, SegmentMeta};
pub use views::{ViewHandler, ViewRouter};

/// Errors produced by the event-log layer.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// An event failed validation; the rest of the batch is unaffected.
    #[error(transparent)]
    InvalidEvent(#[from] grove_types::InvalidEvent),
    /// A segment or manifest file could not be decoded.
    #[error("corrupt file {path}: {message}")]
    Corrupt {
        /// Offending path.
        path: String,
        /// Decoder diagnostic.
        message: String,
    },
    /// The conditional manifest update lost every retry.
    #[error("manifest update on {path} exhausted {attempts} retries")]
    RetriesExhausted {
        /// Manifest path.
        path: String,
        /// Attempts made.
        attempts: usize,
    },
    /// A segment seq was requested that is not in the manifest.
    #[error("unknown segment seq {seq}")]
    UnknownSegment {
        /// Requested seq.
        seq: u64,
    },
    /// Storage failure.
    #[error(transparent)]
    Store(#[from] grove_store_core::StoreError),
}

/// Result alias for this crate.
pub type Result<T, E = LogError> = std::result::Result<T, E>;
