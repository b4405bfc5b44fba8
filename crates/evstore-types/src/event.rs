//! Event values at the three stages of their life.
//!
//! - [`Event`] is what a caller submits. It has no version yet and its
//!   fields are validated at append time.
//! - [`PersistedEvent`] is a committed record of the event log, with the
//!   version the log assigned to it.
//! - [`SerializedEvent`] is the read projection returned by event streams
//!   and snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::snapshot_key::{NO_SUB_KEY, SnapshotKey};
use crate::version::Version;

/// An event submitted for appending.
///
/// `occurred_at` is optional so that an incomplete event reaches the
/// attribute validation of the append path instead of being unrepresentable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Aggregate the event belongs to.
    pub aggregate_id: String,
    /// When the event happened.
    pub occurred_at: Option<DateTime<Utc>>,
    /// Logical event type.
    pub fully_qualified_name: String,
    /// Optional partition within the type. `None` means [`NO_SUB_KEY`].
    pub sub_key: Option<String>,
    /// Opaque payload.
    pub serialized_event: Vec<u8>,
}

impl Event {
    /// Create an event without a sub-key.
    pub fn new(
        aggregate_id: impl Into<String>,
        occurred_at: DateTime<Utc>,
        fully_qualified_name: impl Into<String>,
        serialized_event: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            aggregate_id: aggregate_id.into(),
            occurred_at: Some(occurred_at),
            fully_qualified_name: fully_qualified_name.into(),
            sub_key: None,
            serialized_event: serialized_event.into(),
        }
    }

    /// Set the sub-key.
    #[must_use]
    pub fn with_sub_key(mut self, sub_key: impl Into<String>) -> Self {
        self.sub_key = Some(sub_key.into());
        self
    }

    /// The sub-key, or [`NO_SUB_KEY`] when none was given.
    pub fn sub_key_or_default(&self) -> &str {
        self.sub_key.as_deref().unwrap_or(NO_SUB_KEY)
    }
}

/// A committed event log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedEvent {
    /// Aggregate the event belongs to.
    pub aggregate_id: String,
    /// Version assigned by the event log.
    pub version: Version,
    /// When the event happened, at microsecond precision.
    pub occurred_at: DateTime<Utc>,
    /// Logical event type.
    pub fully_qualified_name: String,
    /// Partition within the type ([`NO_SUB_KEY`] when unused).
    pub sub_key: String,
    /// Opaque payload, decoded.
    pub serialized_event: Vec<u8>,
}

impl PersistedEvent {
    /// The snapshot key this record is projected under.
    pub fn snapshot_key(&self) -> SnapshotKey {
        SnapshotKey::new(self.fully_qualified_name.as_str(), Some(&self.sub_key))
    }
}

/// Read projection of an event, as served by streams and snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedEvent {
    /// Logical event type.
    pub fully_qualified_name: String,
    /// Partition within the type.
    pub sub_key: String,
    /// Opaque payload.
    pub serialized_event: Vec<u8>,
    /// Version of the underlying record.
    pub version: Version,
    /// When the event happened.
    pub occurred_at: DateTime<Utc>,
}

impl From<PersistedEvent> for SerializedEvent {
    fn from(event: PersistedEvent) -> Self {
        Self {
            fully_qualified_name: event.fully_qualified_name,
            sub_key: event.sub_key,
            serialized_event: event.serialized_event,
            version: event.version,
            occurred_at: event.occurred_at,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(seconds, 0).single().unwrap()
    }

    #[test]
    fn new_event_has_default_sub_key() {
        let event = Event::new("device-1", at(0), "door_opened", b"payload".to_vec());
        assert_eq!(event.sub_key, None);
        assert_eq!(event.sub_key_or_default(), NO_SUB_KEY);
    }

    #[test]
    fn with_sub_key_sets_partition() {
        let event = Event::new("device-1", at(0), "zone_event", Vec::new()).with_sub_key("zone1");
        assert_eq!(event.sub_key_or_default(), "zone1");
    }

    #[test]
    fn projection_keeps_everything_but_the_aggregate() {
        let persisted = PersistedEvent {
            aggregate_id: "device-1".to_owned(),
            version: 4,
            occurred_at: at(10),
            fully_qualified_name: "zone_event".to_owned(),
            sub_key: "zone1".to_owned(),
            serialized_event: vec![0, 1, 2],
        };
        let key = persisted.snapshot_key();
        let projected = SerializedEvent::from(persisted);
        assert_eq!(projected.version, 4);
        assert_eq!(projected.serialized_event, vec![0, 1, 2]);
        assert_eq!(key, SnapshotKey::new("zone_event", Some("zone1")));
    }
}
