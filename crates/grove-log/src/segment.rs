//! Segment and manifest records.
//!
//! A segment is a sealed, write-ordered file of events identified by a
//! monotonic `seq`. The manifest is the single mutable piece of global
//! state: the linearizable list of live segments plus a generation token,
//! replaced only by conditional write.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use grove_types::Event;

use crate::{LogError, Result};

/// Metadata for one sealed segment file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentMeta {
    /// Monotonic sequence number; write order across segments.
    pub seq: u64,
    /// Storage path of the sealed file.
    pub path: String,
    /// Smallest event timestamp in the segment.
    pub min_ts: i64,
    /// Largest event timestamp in the segment.
    pub max_ts: i64,
    /// Number of event rows.
    pub row_count: u64,
    /// Encoded size in bytes.
    pub byte_size: u64,
    /// When the segment was sealed.
    pub created_at: DateTime<Utc>,
}

/// The authoritative list of live segments.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Manifest {
    /// Monotonic generation token, bumped on every replacement.
    pub generation: u64,
    /// Live segments in strictly increasing `seq`.
    pub segments: Vec<SegmentMeta>,
}

impl Manifest {
    /// Highest live segment seq, or 0 when empty.
    pub fn max_seq(&self) -> u64 {
        self.segments.last().map(|s| s.seq).unwrap_or(0)
    }

    /// Serialize to the on-disk JSON form.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| LogError::Corrupt {
            path: "manifest".to_string(),
            message: e.to_string(),
        })
    }

    /// Parse the on-disk JSON form.
    pub fn from_bytes(path: &str, bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| LogError::Corrupt {
            path: path.to_string(),
            message: e.to_string(),
        })
    }
}

/// Encode a batch of events into the segment file format.
///
/// The format is an implementation detail behind the row-stream contract:
/// a MessagePack-encoded vector, read back in file order.
pub fn encode_segment(events: &[Event]) -> Result<Vec<u8>> {
    rmp_serde::to_vec_named(events).map_err(|e| LogError::Corrupt {
        path: "segment".to_string(),
        message: e.to_string(),
    })
}

/// Decode a segment file back into its rows, preserving file order.
pub fn decode_segment(path: &str, bytes: &[u8]) -> Result<Vec<Event>> {
    rmp_serde::from_slice(bytes).map_err(|e| LogError::Corrupt {
        path: path.to_string(),
        message: e.to_string(),
    })
}
