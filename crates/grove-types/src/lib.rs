#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **grove-types** – Shared primitive data structures for Grove.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that *every* other crate can depend on it without causing cycles.
//! It defines the change-data-capture event model, the runtime-flexible
//! payload [`Value`], and the target-key grammar used to address entities and
//! relationships. It intentionally makes no assumptions about I/O or storage.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

//─────────────────────────────
//  Core identifiers
//─────────────────────────────

/// Unique identifier for a CDC event (UUID v4).
///
/// Two events with equal ids are the same event. Event ordering is by
/// `(ts, id)` ascending; [`Uuid`]'s `Ord` coincides with the lexicographic
/// order of the canonical hyphenated form, which is the tie-break the rest
/// of the kernel relies on.
pub type EventId = Uuid;

/// Millisecond wall-clock timestamp carried by every event.
pub type Timestamp = i64;

//─────────────────────────────
//  Payload values
//─────────────────────────────

/// Runtime-flexible payload tree carried in an event's `before`/`after`
/// slots and in materialized entity state.
///
/// Payloads are heterogeneous nested data; the variant set mirrors what the
/// columnar layer can shred (well-known columns typed, open payload kept as
/// a single nested column). Structural equality is derived; note that
/// `Float(f64::NAN)` is never equal to itself, matching IEEE semantics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Explicit null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed 64-bit integer.
    Int(i64),
    /// 64-bit float.
    Float(f64),
    /// UTF-8 string.
    Str(String),
    /// Opaque binary blob.
    Bytes(Vec<u8>),
    /// Ordered sequence of values.
    Array(Vec<Value>),
    /// String-keyed map with deterministic iteration order.
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Build a map value from an iterator of pairs.
    pub fn map<K, I>(pairs: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Map(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Look up a field on a map value. Returns `None` for non-maps.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(fields) => fields.get(key),
            _ => None,
        }
    }

    /// True when the value is `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Convert to a `serde_json::Value`, encoding binary blobs as base64
    /// strings so the result is always representable as plain JSON.
    pub fn to_json(&self) -> serde_json::Value {
        use base64::Engine as _;
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => serde_json::Value::String(
                base64::engine::general_purpose::STANDARD.encode(b),
            ),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(fields) => serde_json::Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    /// Convert from a `serde_json::Value`. Integers that fit `i64` become
    /// [`Value::Int`]; all other numbers become [`Value::Float`].
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(items) => {
                Value::Array(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(fields) => Value::Map(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }
}

//─────────────────────────────
//  CDC events
//─────────────────────────────

/// Operation kind recorded by a CDC event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Op {
    /// Target was created (or recreated after a delete).
    Create,
    /// Target payload was replaced.
    Update,
    /// Target was removed.
    Delete,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Create => write!(f, "CREATE"),
            Op::Update => write!(f, "UPDATE"),
            Op::Delete => write!(f, "DELETE"),
        }
    }
}

/// An immutable change-data-capture record.
///
/// Events are created once and never mutated; they are removed only by
/// hard-delete compaction or segment garbage collection after their effects
/// are captured in a newer compacted state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Globally unique event identifier.
    pub id: EventId,
    /// Millisecond timestamp. Monotonic-ish: out-of-order timestamps within
    /// and across segments are tolerated and resolved by compaction/replay.
    pub ts: Timestamp,
    /// Operation kind.
    pub op: Op,
    /// Target key, `ns:id` for entities or
    /// `ns_from:id_from:predicate:ns_to:id_to` for relationships.
    pub target: String,
    /// Payload before the change, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Value>,
    /// Payload after the change. `None` for deletes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Value>,
    /// Optional actor attribution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    /// Optional free-form metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, Value>>,
}

impl Event {
    /// Construct an event with a fresh id and no optional fields.
    pub fn new(ts: Timestamp, op: Op, target: impl Into<String>, after: Option<Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            ts,
            op,
            target: target.into(),
            before: None,
            after,
            actor: None,
            metadata: None,
        }
    }

    /// Sort key realising the canonical `(ts, id)` ascending order.
    pub fn sort_key(&self) -> (Timestamp, EventId) {
        (self.ts, self.id)
    }

    /// Validate the event against the target grammar and op/payload rules.
    pub fn validate(&self) -> Result<(), InvalidEvent> {
        TargetKey::parse(&self.target).map_err(|source| InvalidEvent::BadTarget {
            id: self.id,
            source,
        })?;
        if self.ts < 0 {
            return Err(InvalidEvent::NegativeTimestamp { id: self.id, ts: self.ts });
        }
        match self.op {
            Op::Create | Op::Update if self.after.is_none() => {
                Err(InvalidEvent::MissingPayload { id: self.id, op: self.op })
            }
            _ => Ok(()),
        }
    }
}

//─────────────────────────────
//  Target keys
//─────────────────────────────

/// Parsed form of an event target.
///
/// Entities and relationships cross-reference each other by these string
/// keys only; the kernel never embeds back-pointers between the two maps.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetKey {
    /// `ns:id` entity address.
    Entity {
        /// Namespace, lowercase by convention, never starting with `_`/`$`.
        ns: String,
        /// Local identifier; any non-null bytes, slashes included.
        id: String,
    },
    /// `ns_from:id_from:predicate:ns_to:id_to` relationship address.
    Relationship {
        /// Source namespace.
        from_ns: String,
        /// Source local id.
        from_id: String,
        /// Predicate naming the edge.
        predicate: String,
        /// Destination namespace.
        to_ns: String,
        /// Destination local id.
        to_id: String,
    },
}

impl TargetKey {
    /// Parse a raw target string.
    ///
    /// A key with exactly four colons is a relationship; anything else with
    /// at least one colon is an entity whose local id is everything after
    /// the first colon (so entity ids may themselves contain colons, as long
    /// as the total colon count is not exactly four).
    pub fn parse(raw: &str) -> Result<Self, InvalidTarget> {
        if raw.contains('\0') {
            return Err(InvalidTarget::NullByte { target: raw.to_string() });
        }
        let colons = raw.matches(':').count();
        if colons == 4 {
            let mut parts = raw.split(':');
            let (from_ns, from_id, predicate, to_ns, to_id) = (
                parts.next().unwrap_or(""),
                parts.next().unwrap_or(""),
                parts.next().unwrap_or(""),
                parts.next().unwrap_or(""),
                parts.next().unwrap_or(""),
            );
            validate_namespace(raw, from_ns)?;
            validate_namespace(raw, to_ns)?;
            for part in [from_id, predicate, to_id] {
                if part.is_empty() {
                    return Err(InvalidTarget::EmptySegment { target: raw.to_string() });
                }
            }
            Ok(TargetKey::Relationship {
                from_ns: from_ns.to_string(),
                from_id: from_id.to_string(),
                predicate: predicate.to_string(),
                to_ns: to_ns.to_string(),
                to_id: to_id.to_string(),
            })
        } else if colons >= 1 {
            let (ns, id) = raw.split_once(':').unwrap_or((raw, ""));
            validate_namespace(raw, ns)?;
            if id.is_empty() {
                return Err(InvalidTarget::EmptySegment { target: raw.to_string() });
            }
            Ok(TargetKey::Entity { ns: ns.to_string(), id: id.to_string() })
        } else {
            Err(InvalidTarget::Malformed { target: raw.to_string() })
        }
    }

    /// True for entity targets.
    pub fn is_entity(&self) -> bool {
        matches!(self, TargetKey::Entity { .. })
    }

    /// Namespace the target belongs to (source namespace for relationships).
    pub fn namespace(&self) -> &str {
        match self {
            TargetKey::Entity { ns, .. } => ns,
            TargetKey::Relationship { from_ns, .. } => from_ns,
        }
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetKey::Entity { ns, id } => write!(f, "{ns}:{id}"),
            TargetKey::Relationship { from_ns, from_id, predicate, to_ns, to_id } => {
                write!(f, "{from_ns}:{from_id}:{predicate}:{to_ns}:{to_id}")
            }
        }
    }
}

fn validate_namespace(target: &str, ns: &str) -> Result<(), InvalidTarget> {
    if ns.is_empty() {
        return Err(InvalidTarget::EmptySegment { target: target.to_string() });
    }
    if ns.starts_with('_') || ns.starts_with('$') {
        return Err(InvalidTarget::ReservedNamespace {
            target: target.to_string(),
            ns: ns.to_string(),
        });
    }
    Ok(())
}

/// Normalise an entity id for kernel clients.
///
/// An id containing `/` is treated as already qualified and validated as
/// `<ns>/<local>`; otherwise the result is `<lowercase(ns)>/<id>`.
pub fn normalize_entity_id(ns: &str, id: &str) -> Result<String, InvalidId> {
    if ns.is_empty() {
        return Err(InvalidId::EmptyNamespace);
    }
    if id.is_empty() {
        return Err(InvalidId::EmptyLocalId);
    }
    if id.contains('\0') || ns.contains('\0') {
        return Err(InvalidId::NullByte);
    }
    if let Some((qual_ns, local)) = id.split_once('/') {
        if qual_ns.is_empty() || local.is_empty() {
            return Err(InvalidId::MalformedQualified { id: id.to_string() });
        }
        Ok(id.to_string())
    } else {
        Ok(format!("{}/{}", ns.to_lowercase(), id))
    }
}

//─────────────────────────────
//  Error types
//─────────────────────────────

/// A target string that does not satisfy the grammar.
#[derive(Debug, Clone, thiserror::Error)]
pub enum InvalidTarget {
    /// No colon separator at all.
    #[error("malformed target key: {target:?}")]
    Malformed {
        /// Offending target.
        target: String,
    },
    /// A namespace or id segment was empty.
    #[error("target key has an empty segment: {target:?}")]
    EmptySegment {
        /// Offending target.
        target: String,
    },
    /// Namespaces must not begin with `_` or `$`.
    #[error("reserved namespace {ns:?} in target {target:?}")]
    ReservedNamespace {
        /// Offending target.
        target: String,
        /// The reserved namespace.
        ns: String,
    },
    /// Targets must not contain null bytes.
    #[error("target key contains a null byte: {target:?}")]
    NullByte {
        /// Offending target.
        target: String,
    },
}

/// An event rejected before it reaches the log. Fatal for the single event;
/// the rest of an append batch is unaffected.
#[derive(Debug, thiserror::Error)]
pub enum InvalidEvent {
    /// Target failed the grammar check.
    #[error("event {id} has an invalid target")]
    BadTarget {
        /// Offending event.
        id: EventId,
        /// Grammar violation.
        #[source]
        source: InvalidTarget,
    },
    /// CREATE/UPDATE events must carry an `after` payload.
    #[error("event {id} is a {op} without an after payload")]
    MissingPayload {
        /// Offending event.
        id: EventId,
        /// The operation kind.
        op: Op,
    },
    /// Timestamps are milliseconds since epoch and never negative.
    #[error("event {id} has negative timestamp {ts}")]
    NegativeTimestamp {
        /// Offending event.
        id: EventId,
        /// The bad timestamp.
        ts: Timestamp,
    },
}

/// An entity id rejected by [`normalize_entity_id`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidId {
    /// Namespace was empty.
    #[error("empty namespace")]
    EmptyNamespace,
    /// Local id was empty.
    #[error("empty local id")]
    EmptyLocalId,
    /// Ids must not contain null bytes.
    #[error("id contains a null byte")]
    NullByte,
    /// A pre-qualified id did not have the `<ns>/<local>` shape.
    #[error("malformed qualified id: {id:?}")]
    MalformedQualified {
        /// Offending id.
        id: String,
    },
}

//─────────────────────────────
//  Convenience re-exports
//─────────────────────────────

/// Convenient prelude for importing the most common types.
pub mod prelude {
    pub use super::{
        Event, EventId, InvalidEvent, InvalidId, InvalidTarget, Op, TargetKey, Timestamp, Value,
        normalize_entity_id,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_target_roundtrip() {
        let key = TargetKey::parse("user:alice").unwrap();
        assert_eq!(
            key,
            TargetKey::Entity { ns: "user".into(), id: "alice".into() }
        );
        assert_eq!(key.to_string(), "user:alice");
    }

    #[test]
    fn test_entity_local_id_may_contain_slashes() {
        let key = TargetKey::parse("doc:folder/sub/readme.md").unwrap();
        assert_eq!(
            key,
            TargetKey::Entity { ns: "doc".into(), id: "folder/sub/readme.md".into() }
        );
    }

    #[test]
    fn test_relationship_target() {
        let key = TargetKey::parse("user:alice:follows:user:bob").unwrap();
        assert_eq!(
            key,
            TargetKey::Relationship {
                from_ns: "user".into(),
                from_id: "alice".into(),
                predicate: "follows".into(),
                to_ns: "user".into(),
                to_id: "bob".into(),
            }
        );
        assert!(!key.is_entity());
        assert_eq!(key.namespace(), "user");
    }

    #[test]
    fn test_reserved_namespace_rejected() {
        assert!(matches!(
            TargetKey::parse("_system:x"),
            Err(InvalidTarget::ReservedNamespace { .. })
        ));
        assert!(matches!(
            TargetKey::parse("$meta:x"),
            Err(InvalidTarget::ReservedNamespace { .. })
        ));
    }

    #[test]
    fn test_empty_and_null_targets_rejected() {
        assert!(TargetKey::parse("user:").is_err());
        assert!(TargetKey::parse(":alice").is_err());
        assert!(TargetKey::parse("plain").is_err());
        assert!(TargetKey::parse("user:a\0b").is_err());
    }

    #[test]
    fn test_normalize_entity_id() {
        assert_eq!(normalize_entity_id("User", "alice").unwrap(), "user/alice");
        assert_eq!(
            normalize_entity_id("user", "other/alice").unwrap(),
            "other/alice"
        );
        assert_eq!(normalize_entity_id("", "x"), Err(InvalidId::EmptyNamespace));
        assert_eq!(normalize_entity_id("user", ""), Err(InvalidId::EmptyLocalId));
        assert!(matches!(
            normalize_entity_id("user", "/x"),
            Err(InvalidId::MalformedQualified { .. })
        ));
    }

    #[test]
    fn test_event_validation() {
        let ok = Event::new(1000, Op::Create, "user:alice", Some(Value::Int(1)));
        assert!(ok.validate().is_ok());

        let missing = Event::new(1000, Op::Update, "user:alice", None);
        assert!(matches!(
            missing.validate(),
            Err(InvalidEvent::MissingPayload { .. })
        ));

        let delete = Event::new(1000, Op::Delete, "user:alice", None);
        assert!(delete.validate().is_ok());
    }

    #[test]
    fn test_event_ordering_ties_broken_by_id() {
        let mut a = Event::new(5, Op::Create, "user:a", Some(Value::Null));
        let mut b = Event::new(5, Op::Create, "user:b", Some(Value::Null));
        a.id = Uuid::parse_str("00000000-0000-4000-8000-000000000001").unwrap();
        b.id = Uuid::parse_str("00000000-0000-4000-8000-000000000002").unwrap();
        let mut events = vec![b.clone(), a.clone()];
        events.sort_by_key(|e| e.sort_key());
        assert_eq!(events[0].id, a.id);
        assert_eq!(events[1].id, b.id);
    }

    #[test]
    fn test_value_json_roundtrip() {
        let value = Value::map([
            ("name", Value::Str("grövé".into())),
            ("count", Value::Int(3)),
            ("ratio", Value::Float(0.5)),
            ("tags", Value::Array(vec![Value::Str("a".into()), Value::Null])),
            ("raw", Value::Bytes(vec![0, 159, 146, 150])),
        ]);
        let json = value.to_json();
        // Bytes are base64 in JSON, so only the non-binary part roundtrips
        // structurally.
        let back = Value::from_json(&json);
        assert_eq!(back.get("name"), Some(&Value::Str("grövé".into())));
        assert_eq!(back.get("count"), Some(&Value::Int(3)));
        assert_eq!(back.get("ratio"), Some(&Value::Float(0.5)));
        assert!(matches!(back.get("raw"), Some(Value::Str(_))));
    }

    #[test]
    fn test_value_binary_roundtrip_msgpack() {
        let value = Value::map([
            ("blob", Value::Bytes(vec![1, 2, 3, 255])),
            ("nested", Value::Array(vec![Value::Int(-7), Value::Bool(true)])),
        ]);
        let bytes = rmp_serde::to_vec_named(&value).unwrap();
        let back: Value = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back, value);
    }
}
