//! The append-only event stream of one aggregate.
//!
//! [`EventStream`] binds an aggregate id to its event log table and decodes
//! every payload it reads. It is the authoritative (slow) read path; the
//! snapshot is derived from it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use evstore_types::{Event, ExpectedVersion, PersistedEvent, Version};

use crate::error::StoreError;
use crate::store::{AppendPlan, EventLog, EventRecord, decode_all};

/// One aggregate's view of the event log.
#[derive(Clone)]
pub struct EventStream {
    log: Arc<dyn EventLog>,
    table: String,
    aggregate_id: String,
}

impl EventStream {
    /// Bind `aggregate_id` to `table`.
    pub fn new(log: Arc<dyn EventLog>, table: impl Into<String>, aggregate_id: impl Into<String>) -> Self {
        Self {
            log,
            table: table.into(),
            aggregate_id: aggregate_id.into(),
        }
    }

    /// The event log table.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// The aggregate this stream belongs to.
    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    /// Append a batch in one transaction and return it with versions assigned.
    ///
    /// An empty batch returns immediately without touching the log.
    pub async fn append(
        &self,
        events: Vec<Event>,
        expected: ExpectedVersion,
    ) -> Result<Vec<PersistedEvent>, StoreError> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let count = events.len();
        let plan = AppendPlan::new(self.aggregate_id.clone(), expected, events);
        let records = self.log.append(&self.table, plan).await?;
        let persisted = decode_all(records)?;

        tracing::debug!(
            aggregate_id = %self.aggregate_id,
            table = %self.table,
            count,
            first_version = persisted.first().map(|e| e.version),
            last_version = persisted.last().map(|e| e.version),
            "Appended events"
        );
        Ok(persisted)
    }

    /// Events with `version >= min_version`, at most `max_count` of them.
    pub async fn events_from(
        &self,
        min_version: Version,
        max_count: Option<u64>,
    ) -> Result<Vec<PersistedEvent>, StoreError> {
        let records = self
            .log
            .events_from(&self.table, &self.aggregate_id, min_version, max_count)
            .await?;
        decode_all(records)
    }

    /// The whole stream.
    pub async fn event_stream(&self) -> Result<Vec<PersistedEvent>, StoreError> {
        self.events_from(Version::MIN, None).await
    }

    /// Events that occurred in `[start, end]`, optionally of the given types.
    ///
    /// An empty `types` slice means every type. An inverted range is empty.
    pub async fn event_stream_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        types: &[String],
    ) -> Result<Vec<PersistedEvent>, StoreError> {
        if start > end {
            return Ok(Vec::new());
        }
        let records = self
            .log
            .events_between(&self.table, &self.aggregate_id, start, end, types)
            .await?;
        decode_all(records)
    }

    /// The most recent event.
    pub async fn last(&self) -> Result<Option<PersistedEvent>, StoreError> {
        let record = self.log.last(&self.table, &self.aggregate_id, None).await?;
        record.map(EventRecord::decode).transpose()
    }

    /// The most recent event of one type.
    pub async fn last_of_type(
        &self,
        fully_qualified_name: &str,
    ) -> Result<Option<PersistedEvent>, StoreError> {
        let record = self
            .log
            .last(&self.table, &self.aggregate_id, Some(fully_qualified_name))
            .await?;
        record.map(EventRecord::decode).transpose()
    }

    /// The most recent event of each type, ordered by version.
    pub async fn latest_per_type(&self) -> Result<Vec<PersistedEvent>, StoreError> {
        let records = self
            .log
            .latest_per_type(&self.table, &self.aggregate_id)
            .await?;
        decode_all(records)
    }

    /// Delete the whole stream. Returns the number of events removed.
    pub async fn delete_events(&self) -> Result<u64, StoreError> {
        let removed = self
            .log
            .delete_events(&self.table, &self.aggregate_id)
            .await?;
        tracing::info!(
            aggregate_id = %self.aggregate_id,
            table = %self.table,
            removed,
            "Deleted event stream"
        );
        Ok(removed)
    }
}
