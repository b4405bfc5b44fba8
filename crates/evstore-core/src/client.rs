//! The public API for one aggregate.
//!
//! [`Client`] wraps an [`Aggregate`] and exposes the event stream and the
//! snapshot reads. Engine-wide enumeration (`count`, `ids`) is available as
//! associated functions taking the [`StoreContext`].

use chrono::{DateTime, Utc};
use evstore_types::{
    AggregateId, AggregateType, Event, ExpectedVersion, PersistedEvent, SerializedEvent, Version,
};

use crate::aggregate::Aggregate;
use crate::context::StoreContext;
use crate::error::StoreError;

/// Client bound to one aggregate.
#[derive(Clone)]
pub struct Client {
    aggregate: Aggregate,
}

impl Client {
    /// Bind a client to `(id, aggregate_type)`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownAggregateType`] if the type is not registered.
    pub fn new(
        ctx: &StoreContext,
        id: impl Into<AggregateId>,
        aggregate_type: impl Into<AggregateType>,
    ) -> Result<Self, StoreError> {
        let aggregate = ctx.aggregate(id.into(), aggregate_type.into())?;
        Ok(Self { aggregate })
    }

    /// Number of distinct aggregates of `aggregate_type` with events.
    pub async fn count(
        ctx: &StoreContext,
        aggregate_type: &AggregateType,
    ) -> Result<u64, StoreError> {
        let storage = ctx.storage(aggregate_type)?;
        ctx.log().count_aggregates(&storage.table).await
    }

    /// A page of aggregate ids of `aggregate_type`, lexically ordered.
    pub async fn ids(
        ctx: &StoreContext,
        aggregate_type: &AggregateType,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<AggregateId>, StoreError> {
        let storage = ctx.storage(aggregate_type)?;
        let ids = ctx
            .log()
            .aggregate_ids(&storage.table, offset, limit)
            .await?;
        Ok(ids.into_iter().map(AggregateId::from).collect())
    }

    /// The aggregate id.
    pub const fn id(&self) -> &AggregateId {
        self.aggregate.id()
    }

    /// The aggregate type.
    pub const fn aggregate_type(&self) -> &AggregateType {
        self.aggregate.aggregate_type()
    }

    /// The event log table of this aggregate.
    pub fn event_table(&self) -> &str {
        self.aggregate.events().table()
    }

    /// The cache key of the snapshot entries.
    pub fn snapshot_table(&self) -> &str {
        self.aggregate.snapshot().snapshot_table()
    }

    /// The cache key of the snapshot versions.
    pub fn snapshot_version_table(&self) -> &str {
        self.aggregate.snapshot().snapshot_version_table()
    }

    /// Append a batch and return it with versions assigned.
    ///
    /// # Errors
    ///
    /// - [`StoreError::InvalidInput`] if an element is `None`.
    /// - [`StoreError::Concurrency`] if `expected` is stale for a type in the batch.
    /// - [`StoreError::AttributeMissing`] if an event lacks a required field.
    ///
    /// Nothing is persisted in any of these cases.
    pub async fn append<I, E>(
        &self,
        events: I,
        expected: impl Into<ExpectedVersion>,
    ) -> Result<Vec<PersistedEvent>, StoreError>
    where
        I: IntoIterator<Item = E>,
        E: Into<Option<Event>>,
    {
        self.aggregate.append(events, expected.into()).await
    }

    /// Append a batch and hand the persisted events to `on_commit`.
    ///
    /// `on_commit` runs exactly once when the append succeeds, also for an
    /// empty batch, and never when it fails.
    pub async fn append_with<I, E, F>(
        &self,
        events: I,
        expected: impl Into<ExpectedVersion>,
        on_commit: F,
    ) -> Result<Vec<PersistedEvent>, StoreError>
    where
        I: IntoIterator<Item = E>,
        E: Into<Option<Event>>,
        F: FnOnce(&[PersistedEvent]),
    {
        let persisted = self.append(events, expected).await?;
        on_commit(&persisted);
        Ok(persisted)
    }

    /// Whether the snapshot has been written.
    pub async fn exists(&self) -> Result<bool, StoreError> {
        self.aggregate.snapshot().exists().await
    }

    /// The whole stream as read projections.
    pub async fn event_stream(&self) -> Result<Vec<SerializedEvent>, StoreError> {
        let events = self.raw_event_stream().await?;
        Ok(events.into_iter().map(SerializedEvent::from).collect())
    }

    /// The whole stream as persisted records.
    pub async fn raw_event_stream(&self) -> Result<Vec<PersistedEvent>, StoreError> {
        self.aggregate.events().event_stream().await
    }

    /// Read projections with `version >= version`, at most `max` of them.
    pub async fn event_stream_from(
        &self,
        version: Version,
        max: Option<u64>,
    ) -> Result<Vec<SerializedEvent>, StoreError> {
        let events = self.raw_event_stream_from(version, max).await?;
        Ok(events.into_iter().map(SerializedEvent::from).collect())
    }

    /// Persisted records with `version >= version`, at most `max` of them.
    pub async fn raw_event_stream_from(
        &self,
        version: Version,
        max: Option<u64>,
    ) -> Result<Vec<PersistedEvent>, StoreError> {
        self.aggregate.events().events_from(version, max).await
    }

    /// Read projections that occurred in `[start, end]`.
    ///
    /// `types` restricts the result to those event types; empty means all.
    pub async fn event_stream_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        types: &[&str],
    ) -> Result<Vec<SerializedEvent>, StoreError> {
        let types: Vec<String> = types.iter().map(|t| (*t).to_owned()).collect();
        let events = self
            .aggregate
            .events()
            .event_stream_between(start, end, &types)
            .await?;
        Ok(events.into_iter().map(SerializedEvent::from).collect())
    }

    /// The most recent event in the stream.
    pub async fn peek(&self) -> Result<Option<SerializedEvent>, StoreError> {
        let last = self.aggregate.events().last().await?;
        Ok(last.map(SerializedEvent::from))
    }

    /// The snapshot, rebuilt first if the cache is empty.
    pub async fn snapshot(&self) -> Result<Vec<SerializedEvent>, StoreError> {
        self.aggregate.snapshot().snapshot().await
    }

    /// Rebuild the snapshot from the stream. Returns the entries written.
    pub async fn rebuild_snapshot(&self) -> Result<usize, StoreError> {
        self.aggregate.snapshot().rebuild_snapshot().await
    }

    /// Delete the snapshot.
    pub async fn delete_snapshot(&self) -> Result<(), StoreError> {
        self.aggregate.snapshot().delete_snapshot().await
    }

    /// Highest version in the snapshot, or `-1`.
    pub async fn version(&self) -> Result<Version, StoreError> {
        self.aggregate.snapshot().version().await
    }

    /// Highest version of one snapshot key, or `-1`.
    pub async fn version_for(
        &self,
        fully_qualified_name: &str,
        sub_key: Option<&str>,
    ) -> Result<Version, StoreError> {
        self.aggregate
            .snapshot()
            .version_for(fully_qualified_name, sub_key)
            .await
    }

    /// Number of keys in the snapshot.
    pub async fn snapshot_len(&self) -> Result<usize, StoreError> {
        self.aggregate.snapshot().len().await
    }

    /// The latest event of each type.
    pub async fn current_state(&self) -> Result<Vec<SerializedEvent>, StoreError> {
        self.aggregate.current_state().await
    }

    /// The snapshot entry with the highest version.
    pub async fn last_event(&self) -> Result<Option<SerializedEvent>, StoreError> {
        self.aggregate.snapshot().last_event().await
    }

    /// Rename event types in the snapshot. See [`crate::snapshot::Snapshot::update_fully_qualified_names`].
    pub async fn update_fully_qualified_names<F>(&self, rename: F) -> Result<usize, StoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.aggregate
            .snapshot()
            .update_fully_qualified_names(rename)
            .await
    }

    /// Delete the events and the snapshot of this aggregate.
    pub async fn destroy(&self) -> Result<(), StoreError> {
        self.aggregate.destroy().await?;
        tracing::info!(
            aggregate_id = %self.id(),
            aggregate_type = %self.aggregate_type(),
            "Destroyed aggregate"
        );
        Ok(())
    }
}
