//! The event fold: keyed entity and relationship state maps built from a
//! `(ts, id)`-ordered batch of events.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use grove_types::{Event, EventId, Op, TargetKey, Value};

use crate::CompactError;

/// Authoritative state for one target key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Target key the record describes.
    pub key: String,
    /// Current payload; `None` iff the target is deleted.
    pub state: Option<Value>,
    /// Id of the last applied event.
    pub last_event_id: EventId,
    /// Timestamp of the last applied event.
    pub last_event_ts: i64,
    /// Whether the target currently exists.
    pub exists: bool,
}

/// Keyed fold output: one map per target kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FoldState {
    /// Entity states keyed by `ns:id`.
    pub entities: BTreeMap<String, StateRecord>,
    /// Relationship states keyed by the five-part relationship key.
    pub relationships: BTreeMap<String, StateRecord>,
}

impl FoldState {
    /// Apply one event. CREATE/UPDATE set the payload and mark the target
    /// existing; DELETE clears the payload; a later CREATE reinstates the
    /// target with its new payload.
    pub fn apply(&mut self, event: &Event) -> Result<(), CompactError> {
        // The fold has no segment context; the compactor rewrites
        // `resume_from` with the cursor it tracks per segment.
        let key = TargetKey::parse(&event.target).map_err(|e| CompactError::MalformedEvent {
            event_id: event.id,
            resume_from: 0,
            message: e.to_string(),
        })?;
        let map = if key.is_entity() { &mut self.entities } else { &mut self.relationships };
        let record = map.entry(event.target.clone()).or_insert_with(|| StateRecord {
            key: event.target.clone(),
            state: None,
            last_event_id: event.id,
            last_event_ts: event.ts,
            exists: false,
        });
        match event.op {
            Op::Create | Op::Update => {
                record.state = event.after.clone();
                record.exists = true;
            }
            Op::Delete => {
                record.state = None;
                record.exists = false;
            }
        }
        record.last_event_id = event.id;
        record.last_event_ts = event.ts;
        Ok(())
    }

    /// Apply a batch already ordered by `(ts, id)`.
    pub fn apply_all(&mut self, events: &[Event]) -> Result<(), CompactError> {
        for event in events {
            self.apply(event)?;
        }
        Ok(())
    }

    /// Entity records with `exists = true`, in ascending key order.
    pub fn existing_entities(&self) -> Vec<StateRecord> {
        self.entities.values().filter(|r| r.exists).cloned().collect()
    }

    /// Relationship records with `exists = true`, in ascending key order.
    pub fn existing_relationships(&self) -> Vec<StateRecord> {
        self.relationships.values().filter(|r| r.exists).cloned().collect()
    }

    /// Number of existing entities.
    pub fn entity_count(&self) -> usize {
        self.entities.values().filter(|r| r.exists).count()
    }

    /// Number of existing relationships.
    pub fn relationship_count(&self) -> usize {
        self.relationships.values().filter(|r| r.exists).count()
    }
}

/// Stable `(ts, id)` ascending sort; equal keys keep their arrival order.
pub fn sort_events(events: &mut [Event]) {
    events.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
}
