//! Collaborator interfaces: the durable event log and the snapshot cache.
//!
//! The engine never talks to a database directly. It hands an
//! [`AppendPlan`] to an [`EventLog`], which must run
//! [`AppendPlan::prepare`] and the insert inside one transaction that also
//! serialises other appenders of the same aggregate. Reads come back as
//! [`EventRecord`]s carrying the escaped payload, which the engine decodes.
//!
//! The [`SnapshotCache`] is a hash store: per-key field maps, existence
//! checks and whole-key deletes. Every write is atomic and conditional on
//! what the cache holds at that moment, so concurrent writers of one
//! aggregate never move a snapshot backwards.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use evstore_types::{Event, ExpectedVersion, KEY_DELIMITER, PersistedEvent, Version};

use crate::codec;
use crate::concurrency;
use crate::error::StoreError;

/// Timestamp precision of the log store, in fractional-second digits.
const TIMESTAMP_PRECISION: u16 = 6;

/// A row of the event log, payload still escaped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    /// Aggregate the event belongs to.
    pub aggregate_id: String,
    /// Assigned version.
    pub version: Version,
    /// When the event happened.
    pub occurred_at: DateTime<Utc>,
    /// Logical event type.
    pub fully_qualified_name: String,
    /// Partition within the type.
    pub sub_key: String,
    /// Payload in [`codec::escape`] form.
    pub serialized_event: String,
}

impl EventRecord {
    /// Decode the payload and return the persisted event.
    pub fn decode(self) -> Result<PersistedEvent, StoreError> {
        let serialized_event = codec::unescape(&self.serialized_event)?;
        Ok(PersistedEvent {
            aggregate_id: self.aggregate_id,
            version: self.version,
            occurred_at: self.occurred_at,
            fully_qualified_name: self.fully_qualified_name,
            sub_key: self.sub_key,
            serialized_event,
        })
    }
}

/// Decode a page of records in order.
pub fn decode_all(records: Vec<EventRecord>) -> Result<Vec<PersistedEvent>, StoreError> {
    records.into_iter().map(EventRecord::decode).collect()
}

/// A batch waiting to be appended to one aggregate.
#[derive(Debug, Clone)]
pub struct AppendPlan {
    aggregate_id: String,
    expected: ExpectedVersion,
    events: Vec<Event>,
}

impl AppendPlan {
    /// Create a plan for `aggregate_id`.
    pub const fn new(aggregate_id: String, expected: ExpectedVersion, events: Vec<Event>) -> Self {
        Self {
            aggregate_id,
            expected,
            events,
        }
    }

    /// The aggregate being appended to.
    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    /// The version the writer declared.
    pub const fn expected(&self) -> ExpectedVersion {
        self.expected
    }

    /// Number of events in the batch.
    pub const fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the batch is empty.
    pub const fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Whether the per-type last versions must be read before preparing.
    ///
    /// Log stores skip that query when this is false.
    pub const fn needs_type_versions(&self, last_version: Option<Version>) -> bool {
        concurrency::aggregate_conflict(self.expected, last_version)
    }

    /// Distinct event types in the batch, sorted.
    pub fn fully_qualified_names(&self) -> Vec<String> {
        self.events
            .iter()
            .map(|e| e.fully_qualified_name.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Validate the batch and turn it into rows ready to insert.
    ///
    /// `last_version` is the aggregate's last version and `type_versions`
    /// the last version of each type in the batch; both must be read in the
    /// caller's append transaction. A type absent from `type_versions` has
    /// no events yet.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Concurrency`] if a type in the batch moved past the
    ///   expected version.
    /// - [`StoreError::AttributeMissing`] if a required field is empty.
    /// - [`StoreError::AggregateMismatch`] if an event names another aggregate.
    /// - [`StoreError::InvalidKey`] if a type or sub-key contains
    ///   [`KEY_DELIMITER`].
    /// - [`StoreError::VersionOverflow`] if versions would exceed `i64::MAX`.
    pub fn prepare(
        self,
        last_version: Option<Version>,
        type_versions: &HashMap<String, Version>,
    ) -> Result<Vec<EventRecord>, StoreError> {
        concurrency::check_batch(
            self.expected,
            last_version,
            self.events.iter().map(|e| e.fully_qualified_name.as_str()),
            |name| type_versions.get(name).copied(),
        )?;

        let mut next = match last_version {
            Some(last) => last
                .checked_add(1)
                .ok_or_else(|| StoreError::VersionOverflow(self.aggregate_id.clone()))?,
            None => 0,
        };

        let mut records = Vec::with_capacity(self.events.len());
        for event in self.events {
            let record = build_record(&self.aggregate_id, next, event)?;
            records.push(record);
            next = next
                .checked_add(1)
                .ok_or_else(|| StoreError::VersionOverflow(self.aggregate_id.clone()))?;
        }

        Ok(records)
    }
}

/// Validate one event and assign it `version`.
fn build_record(
    aggregate_id: &str,
    version: Version,
    event: Event,
) -> Result<EventRecord, StoreError> {
    if event.aggregate_id.trim().is_empty() {
        return Err(StoreError::AttributeMissing {
            attribute: "aggregate_id",
        });
    }
    if event.aggregate_id != aggregate_id {
        return Err(StoreError::AggregateMismatch {
            expected: aggregate_id.to_owned(),
            actual: event.aggregate_id,
        });
    }
    if event.fully_qualified_name.trim().is_empty() {
        return Err(StoreError::AttributeMissing {
            attribute: "fully_qualified_name",
        });
    }
    let Some(occurred_at) = event.occurred_at else {
        return Err(StoreError::AttributeMissing {
            attribute: "occurred_at",
        });
    };
    if event.serialized_event.is_empty() {
        return Err(StoreError::AttributeMissing {
            attribute: "serialized_event",
        });
    }

    let sub_key = event.sub_key_or_default().to_owned();
    if event.fully_qualified_name.contains(KEY_DELIMITER) {
        return Err(StoreError::InvalidKey {
            attribute: "fully_qualified_name",
        });
    }
    if sub_key.contains(KEY_DELIMITER) {
        return Err(StoreError::InvalidKey {
            attribute: "sub_key",
        });
    }

    Ok(EventRecord {
        aggregate_id: event.aggregate_id,
        version,
        occurred_at: occurred_at.trunc_subsecs(TIMESTAMP_PRECISION),
        fully_qualified_name: event.fully_qualified_name,
        sub_key,
        serialized_event: codec::escape(&event.serialized_event),
    })
}

/// The durable, append-only event log.
///
/// Every method is scoped to one table; the registry decides which table an
/// aggregate type lives in. Reads are ordered by version ascending unless
/// stated otherwise.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append a batch atomically.
    ///
    /// Must read the last version, run [`AppendPlan::prepare`] and insert the
    /// rows inside one transaction that excludes concurrent appenders of the
    /// same aggregate. An empty plan must not touch the store.
    async fn append(&self, table: &str, plan: AppendPlan) -> Result<Vec<EventRecord>, StoreError>;

    /// Records with `version >= min_version`, at most `limit` of them.
    async fn events_from(
        &self,
        table: &str,
        aggregate_id: &str,
        min_version: Version,
        limit: Option<u64>,
    ) -> Result<Vec<EventRecord>, StoreError>;

    /// Records with `occurred_at` in `[start, end]`, restricted to `names`
    /// unless it is empty.
    async fn events_between(
        &self,
        table: &str,
        aggregate_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        names: &[String],
    ) -> Result<Vec<EventRecord>, StoreError>;

    /// The highest-version record, optionally of one type.
    async fn last(
        &self,
        table: &str,
        aggregate_id: &str,
        fully_qualified_name: Option<&str>,
    ) -> Result<Option<EventRecord>, StoreError>;

    /// The highest-version record of each type.
    async fn latest_per_type(
        &self,
        table: &str,
        aggregate_id: &str,
    ) -> Result<Vec<EventRecord>, StoreError>;

    /// Delete every record of the aggregate. Returns the number removed.
    async fn delete_events(&self, table: &str, aggregate_id: &str) -> Result<u64, StoreError>;

    /// Number of distinct aggregates in the table.
    async fn count_aggregates(&self, table: &str) -> Result<u64, StoreError>;

    /// Distinct aggregate ids, lexically sorted, paginated.
    async fn aggregate_ids(
        &self,
        table: &str,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<String>, StoreError>;

    /// Delete every record in the table. Returns the number removed.
    async fn purge(&self, table: &str) -> Result<u64, StoreError>;
}

/// Fields to set on one cache hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashWrite {
    /// Hash key.
    pub key: String,
    /// Field/value pairs.
    pub fields: Vec<(String, String)>,
}

impl HashWrite {
    /// Create a write of `fields` to `key`.
    pub fn new(key: impl Into<String>, fields: Vec<(String, String)>) -> Self {
        Self {
            key: key.into(),
            fields,
        }
    }
}

/// One snapshot key to set unless the cache already holds a newer version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedField {
    /// Field name, an encoded snapshot key.
    pub field: String,
    /// Version to store in the versions hash.
    pub version: Version,
    /// Value to store in the entries hash.
    pub value: String,
}

/// A version-guarded write to the two hashes of one snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotWrite {
    /// Hash of field versions, also holding `current_field`.
    pub versions_key: String,
    /// Hash of field values.
    pub entries_key: String,
    /// Field of the versions hash holding the highest version written.
    pub current_field: String,
    /// Candidates, at most one per field.
    pub fields: Vec<VersionedField>,
}

/// The exact content a hash must have for a guarded replace to proceed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashGuard {
    /// Hash key.
    pub key: String,
    /// Every field/value pair the hash must hold, and nothing else.
    pub expected: HashMap<String, String>,
}

/// The snapshot cache store.
#[async_trait]
pub trait SnapshotCache: Send + Sync {
    /// Whether `key` is present.
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// All fields of the hash at `key`. Empty if the key is absent.
    async fn read_hash(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    /// One field of the hash at `key`.
    async fn read_field(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;

    /// Compare-and-set every field of `write` in one atomic step.
    ///
    /// A field is written, to both hashes, only when its stored version is
    /// absent or lower than the candidate's. If anything was written,
    /// `current_field` becomes the larger of its stored value and the
    /// highest version written. Returns the number of fields written.
    async fn write_if_newer(&self, write: SnapshotWrite) -> Result<usize, StoreError>;

    /// Replace several hashes wholesale in one atomic transaction.
    ///
    /// Each key is deleted and then written with exactly the given fields.
    async fn replace_hashes(&self, writes: Vec<HashWrite>) -> Result<(), StoreError>;

    /// [`replace_hashes`](Self::replace_hashes), but only while the hash at
    /// `guard.key` holds exactly `guard.expected`.
    ///
    /// The comparison and the replace are one atomic step. Returns whether
    /// the replace ran.
    async fn replace_hashes_if(
        &self,
        guard: &HashGuard,
        writes: Vec<HashWrite>,
    ) -> Result<bool, StoreError>;

    /// Delete whole keys.
    async fn delete(&self, keys: &[String]) -> Result<(), StoreError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use chrono::TimeZone;
    use evstore_types::NO_SUB_KEY;

    use super::*;

    fn at(nanos: u32) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, nanos).single().unwrap()
    }

    fn event(name: &str) -> Event {
        Event::new("device-1", at(0), name, b"payload".to_vec())
    }

    fn plan(expected: ExpectedVersion, events: Vec<Event>) -> AppendPlan {
        AppendPlan::new("device-1".to_owned(), expected, events)
    }

    #[test]
    fn first_event_gets_version_zero() {
        let records = plan(ExpectedVersion::NoPriorEvent, vec![event("a"), event("b")])
            .prepare(None, &HashMap::new())
            .unwrap();
        let versions: Vec<Version> = records.iter().map(|r| r.version).collect();
        assert_eq!(versions, vec![0, 1]);
    }

    #[test]
    fn versions_continue_after_last() {
        let records = plan(ExpectedVersion::At(7), vec![event("a"), event("a"), event("b")])
            .prepare(Some(7), &HashMap::new())
            .unwrap();
        let versions: Vec<Version> = records.iter().map(|r| r.version).collect();
        assert_eq!(versions, vec![8, 9, 10]);
    }

    #[test]
    fn payload_is_escaped_and_sub_key_defaulted() {
        let records = plan(ExpectedVersion::NoPriorEvent, vec![event("a")])
            .prepare(None, &HashMap::new())
            .unwrap();
        let record = records.first().unwrap();
        assert_eq!(record.serialized_event, codec::escape(b"payload"));
        assert_eq!(record.sub_key, NO_SUB_KEY);
    }

    #[test]
    fn timestamps_are_truncated_to_microseconds() {
        let mut e = event("a");
        e.occurred_at = Some(at(123_456_789));
        let records = plan(ExpectedVersion::NoPriorEvent, vec![e])
            .prepare(None, &HashMap::new())
            .unwrap();
        assert_eq!(records.first().unwrap().occurred_at, at(123_456_000));
    }

    #[test]
    fn missing_attributes_are_named() {
        let cases: Vec<(&str, Box<dyn Fn(&mut Event)>)> = vec![
            ("aggregate_id", Box::new(|e| e.aggregate_id.clear())),
            ("fully_qualified_name", Box::new(|e| e.fully_qualified_name = "  ".to_owned())),
            ("occurred_at", Box::new(|e| e.occurred_at = None)),
            ("serialized_event", Box::new(|e| e.serialized_event.clear())),
        ];
        for (expected, mutate) in cases {
            let mut bad = event("a");
            mutate(&mut bad);
            let err = plan(ExpectedVersion::NoPriorEvent, vec![event("a"), bad])
                .prepare(None, &HashMap::new())
                .unwrap_err();
            match err {
                StoreError::AttributeMissing { attribute } => assert_eq!(attribute, expected),
                other => panic!("expected AttributeMissing, got {other:?}"),
            }
        }
    }

    #[test]
    fn key_delimiter_is_rejected_in_names_and_sub_keys() {
        let name = format!("door{KEY_DELIMITER}opened");
        let err = plan(ExpectedVersion::NoPriorEvent, vec![event(&name)])
            .prepare(None, &HashMap::new())
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidKey {
                attribute: "fully_qualified_name"
            }
        ));

        let sub_key = format!("zone{KEY_DELIMITER}1");
        let err = plan(
            ExpectedVersion::NoPriorEvent,
            vec![event("a"), event("zone_event").with_sub_key(sub_key)],
        )
        .prepare(None, &HashMap::new())
        .unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey { attribute: "sub_key" }));
    }

    #[test]
    fn foreign_aggregate_is_rejected() {
        let foreign = Event::new("device-2", at(0), "a", b"x".to_vec());
        let err = plan(ExpectedVersion::NoPriorEvent, vec![foreign])
            .prepare(None, &HashMap::new())
            .unwrap_err();
        assert!(matches!(err, StoreError::AggregateMismatch { .. }));
    }

    #[test]
    fn conflict_is_checked_before_attributes() {
        let mut bad = event("a");
        bad.serialized_event.clear();
        let versions = HashMap::from([("a".to_owned(), 3)]);
        let err = plan(ExpectedVersion::At(1), vec![bad])
            .prepare(Some(3), &versions)
            .unwrap_err();
        assert!(matches!(err, StoreError::Concurrency { actual: 3, .. }));
    }

    #[test]
    fn version_overflow_is_reported() {
        let err = plan(ExpectedVersion::NoPriorEvent, vec![event("a")])
            .prepare(Some(Version::MAX), &HashMap::new())
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionOverflow(_)));
    }

    #[test]
    fn names_are_distinct_and_sorted() {
        let p = plan(
            ExpectedVersion::NoPriorEvent,
            vec![event("b"), event("a"), event("b")],
        );
        assert_eq!(p.fully_qualified_names(), vec!["a".to_owned(), "b".to_owned()]);
        assert!(!p.needs_type_versions(None));
    }

    #[test]
    fn record_decodes_payload() {
        let record = EventRecord {
            aggregate_id: "device-1".to_owned(),
            version: 2,
            occurred_at: at(0),
            fully_qualified_name: "a".to_owned(),
            sub_key: NO_SUB_KEY.to_owned(),
            serialized_event: codec::escape(&[0, 1, 0]),
        };
        let persisted = record.decode().unwrap();
        assert_eq!(persisted.serialized_event, vec![0, 1, 0]);
        assert_eq!(persisted.version, 2);
    }
}
