//! An aggregate: identity bound to its event stream and snapshot.

use std::collections::BTreeMap;

use evstore_types::{
    AggregateId, AggregateType, Event, ExpectedVersion, NO_VERSION, PersistedEvent,
    SerializedEvent,
};

use crate::context::StoreContext;
use crate::error::StoreError;
use crate::event_stream::EventStream;
use crate::snapshot::Snapshot;

/// The `(id, type)` pair with its stream and snapshot.
///
/// Holds no state of its own; building one is cheap.
#[derive(Clone)]
pub struct Aggregate {
    id: AggregateId,
    aggregate_type: AggregateType,
    stream: EventStream,
    snapshot: Snapshot,
}

impl Aggregate {
    /// Bind `id` of type `tag` to its storage.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownAggregateType`] if `tag` is not registered.
    pub fn new(
        ctx: &StoreContext,
        id: AggregateId,
        aggregate_type: AggregateType,
    ) -> Result<Self, StoreError> {
        let storage = ctx.storage(&aggregate_type)?;
        let stream = EventStream::new(ctx.log().clone(), storage.table.clone(), id.as_str());
        let snapshot = Snapshot::new(
            ctx.cache().clone(),
            stream.clone(),
            &storage.cache_namespace,
            ctx.settings().rebuild_page_size,
        );
        Ok(Self {
            id,
            aggregate_type,
            stream,
            snapshot,
        })
    }

    /// The aggregate id.
    pub const fn id(&self) -> &AggregateId {
        &self.id
    }

    /// The aggregate type.
    pub const fn aggregate_type(&self) -> &AggregateType {
        &self.aggregate_type
    }

    /// The event stream.
    pub const fn events(&self) -> &EventStream {
        &self.stream
    }

    /// The snapshot.
    pub const fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Persist a batch, then project it into the snapshot.
    ///
    /// A `None` element rejects the whole batch before anything is read or
    /// written. If the cache write fails the events stay committed and the
    /// error is returned; the next cold read or rebuild repairs the cache.
    pub async fn append<I, E>(
        &self,
        events: I,
        expected: ExpectedVersion,
    ) -> Result<Vec<PersistedEvent>, StoreError>
    where
        I: IntoIterator<Item = E>,
        E: Into<Option<Event>>,
    {
        let batch = events
            .into_iter()
            .enumerate()
            .map(|(index, event)| event.into().ok_or(StoreError::InvalidInput { index }))
            .collect::<Result<Vec<_>, _>>()?;

        let persisted = self.stream.append(batch, expected).await?;
        self.snapshot.store_snapshot(&persisted).await?;
        Ok(persisted)
    }

    /// The latest event of each type, ordered by version.
    ///
    /// Served from the snapshot when it is in step with the stream, from the
    /// stream otherwise.
    pub async fn current_state(&self) -> Result<Vec<SerializedEvent>, StoreError> {
        let last = self.stream.last().await?.map_or(NO_VERSION, |e| e.version);
        if last == NO_VERSION {
            return Ok(Vec::new());
        }

        if self.snapshot.version().await? == last {
            let snapshot = self.snapshot.snapshot().await?;
            return Ok(latest_by_name(snapshot));
        }

        tracing::debug!(
            aggregate_id = %self.id,
            last_version = last,
            "Snapshot behind stream, reading current state from the event log"
        );
        let latest = self.stream.latest_per_type().await?;
        Ok(latest.into_iter().map(SerializedEvent::from).collect())
    }

    /// Delete the event stream and the snapshot.
    pub async fn destroy(&self) -> Result<(), StoreError> {
        self.stream.delete_events().await?;
        self.snapshot.delete_snapshot().await
    }
}

/// Collapse sub-keys: keep the highest version per type, ordered by version.
fn latest_by_name(events: Vec<SerializedEvent>) -> Vec<SerializedEvent> {
    let mut latest: BTreeMap<String, SerializedEvent> = BTreeMap::new();
    for event in events {
        if latest
            .get(&event.fully_qualified_name)
            .is_none_or(|held| held.version < event.version)
        {
            latest.insert(event.fully_qualified_name.clone(), event);
        }
    }
    let mut out: Vec<SerializedEvent> = latest.into_values().collect();
    out.sort_by_key(|e| e.version);
    out
}
