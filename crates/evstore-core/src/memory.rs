//! In-memory implementations of [`EventLog`] and [`SnapshotCache`].
//!
//! Used by tests and for embedding the engine without external services.
//! Each append holds the table lock from the last-version read to the
//! insert, which gives the same per-aggregate serialisation the
//! `PostgreSQL` log gets from its advisory lock.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use evstore_types::Version;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::store::{
    AppendPlan, EventLog, EventRecord, HashGuard, HashWrite, SnapshotCache, SnapshotWrite,
};

/// Event log kept in process memory, one vector of records per table.
#[derive(Debug, Default)]
pub struct InMemoryEventLog {
    tables: Mutex<HashMap<String, Vec<EventRecord>>>,
}

impl InMemoryEventLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of records in `table`.
    pub async fn record_count(&self, table: &str) -> usize {
        self.tables.lock().await.get(table).map_or(0, Vec::len)
    }
}

/// Records of one aggregate, in version order.
fn stream_of<'a>(
    records: &'a [EventRecord],
    aggregate_id: &'a str,
) -> impl Iterator<Item = &'a EventRecord> + 'a {
    records.iter().filter(move |r| r.aggregate_id == aggregate_id)
}

fn clamp(n: u64) -> usize {
    usize::try_from(n).unwrap_or(usize::MAX)
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(&self, table: &str, plan: AppendPlan) -> Result<Vec<EventRecord>, StoreError> {
        if plan.is_empty() {
            return Ok(Vec::new());
        }

        let mut tables = self.tables.lock().await;
        let records = tables.entry(table.to_owned()).or_default();
        let last_version = stream_of(records, plan.aggregate_id())
            .map(|r| r.version)
            .max();

        let mut type_versions: HashMap<String, Version> = HashMap::new();
        if plan.needs_type_versions(last_version) {
            let names: BTreeSet<String> = plan.fully_qualified_names().into_iter().collect();
            for record in stream_of(records, plan.aggregate_id()) {
                if names.contains(&record.fully_qualified_name) {
                    let held = type_versions
                        .entry(record.fully_qualified_name.clone())
                        .or_insert(record.version);
                    *held = (*held).max(record.version);
                }
            }
        }

        let prepared = plan.prepare(last_version, &type_versions)?;
        records.extend(prepared.iter().cloned());
        Ok(prepared)
    }

    async fn events_from(
        &self,
        table: &str,
        aggregate_id: &str,
        min_version: Version,
        limit: Option<u64>,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let tables = self.tables.lock().await;
        let Some(records) = tables.get(table) else {
            return Ok(Vec::new());
        };
        let mut events: Vec<EventRecord> = stream_of(records, aggregate_id)
            .filter(|r| r.version >= min_version)
            .cloned()
            .collect();
        events.sort_by_key(|r| r.version);
        events.truncate(limit.map_or(usize::MAX, clamp));
        Ok(events)
    }

    async fn events_between(
        &self,
        table: &str,
        aggregate_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        names: &[String],
    ) -> Result<Vec<EventRecord>, StoreError> {
        let tables = self.tables.lock().await;
        let Some(records) = tables.get(table) else {
            return Ok(Vec::new());
        };
        let mut events: Vec<EventRecord> = stream_of(records, aggregate_id)
            .filter(|r| r.occurred_at >= start && r.occurred_at <= end)
            .filter(|r| names.is_empty() || names.contains(&r.fully_qualified_name))
            .cloned()
            .collect();
        events.sort_by_key(|r| r.version);
        Ok(events)
    }

    async fn last(
        &self,
        table: &str,
        aggregate_id: &str,
        fully_qualified_name: Option<&str>,
    ) -> Result<Option<EventRecord>, StoreError> {
        let tables = self.tables.lock().await;
        let Some(records) = tables.get(table) else {
            return Ok(None);
        };
        Ok(stream_of(records, aggregate_id)
            .filter(|r| fully_qualified_name.is_none_or(|name| r.fully_qualified_name == name))
            .max_by_key(|r| r.version)
            .cloned())
    }

    async fn latest_per_type(
        &self,
        table: &str,
        aggregate_id: &str,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let tables = self.tables.lock().await;
        let Some(records) = tables.get(table) else {
            return Ok(Vec::new());
        };
        let mut latest: HashMap<&str, &EventRecord> = HashMap::new();
        for record in stream_of(records, aggregate_id) {
            let held = latest
                .entry(record.fully_qualified_name.as_str())
                .or_insert(record);
            if held.version < record.version {
                *held = record;
            }
        }
        let mut events: Vec<EventRecord> = latest.into_values().cloned().collect();
        events.sort_by_key(|r| r.version);
        Ok(events)
    }

    async fn delete_events(&self, table: &str, aggregate_id: &str) -> Result<u64, StoreError> {
        let mut tables = self.tables.lock().await;
        let Some(records) = tables.get_mut(table) else {
            return Ok(0);
        };
        let before = records.len();
        records.retain(|r| r.aggregate_id != aggregate_id);
        Ok(u64::try_from(before.saturating_sub(records.len())).unwrap_or(u64::MAX))
    }

    async fn count_aggregates(&self, table: &str) -> Result<u64, StoreError> {
        let tables = self.tables.lock().await;
        let count = tables.get(table).map_or(0, |records| {
            records
                .iter()
                .map(|r| r.aggregate_id.as_str())
                .collect::<BTreeSet<_>>()
                .len()
        });
        Ok(u64::try_from(count).unwrap_or(u64::MAX))
    }

    async fn aggregate_ids(
        &self,
        table: &str,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<String>, StoreError> {
        let tables = self.tables.lock().await;
        let Some(records) = tables.get(table) else {
            return Ok(Vec::new());
        };
        Ok(records
            .iter()
            .map(|r| r.aggregate_id.as_str())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .skip(clamp(offset))
            .take(clamp(limit))
            .map(str::to_owned)
            .collect())
    }

    async fn purge(&self, table: &str) -> Result<u64, StoreError> {
        let removed = self
            .tables
            .lock()
            .await
            .remove(table)
            .map_or(0, |records| records.len());
        Ok(u64::try_from(removed).unwrap_or(u64::MAX))
    }
}

/// Hash store kept in process memory.
///
/// Like Redis, a hash with no fields does not exist.
#[derive(Debug, Default)]
pub struct InMemorySnapshotCache {
    hashes: Mutex<Hashes>,
}

impl InMemorySnapshotCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every key, like `FLUSHDB`.
    pub async fn flush(&self) {
        self.hashes.lock().await.clear();
    }

    /// Number of keys held.
    pub async fn key_count(&self) -> usize {
        self.hashes.lock().await.len()
    }
}

#[async_trait]
impl SnapshotCache for InMemorySnapshotCache {
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.hashes.lock().await.contains_key(key))
    }

    async fn read_hash(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        Ok(self
            .hashes
            .lock()
            .await
            .get(key)
            .cloned()
            .unwrap_or_default())
    }

    async fn read_field(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .hashes
            .lock()
            .await
            .get(key)
            .and_then(|hash| hash.get(field).cloned()))
    }

    async fn write_if_newer(&self, write: SnapshotWrite) -> Result<usize, StoreError> {
        let mut hashes = self.hashes.lock().await;

        let held = hashes.get(&write.versions_key);
        let current = stored_version(held, &write.current_field)?;
        let mut winners = Vec::with_capacity(write.fields.len());
        for candidate in write.fields {
            let stored = stored_version(held, &candidate.field)?;
            if stored.is_none_or(|v| v < candidate.version) {
                winners.push(candidate);
            }
        }
        let Some(top) = winners.iter().map(|c| c.version).max() else {
            return Ok(0);
        };

        let written = winners.len();
        let mut version_fields = Vec::with_capacity(written.saturating_add(1));
        let mut entry_fields = Vec::with_capacity(written);
        for candidate in winners {
            version_fields.push((candidate.field.clone(), candidate.version.to_string()));
            entry_fields.push((candidate.field, candidate.value));
        }
        if current.is_none_or(|v| v < top) {
            version_fields.push((write.current_field, top.to_string()));
        }
        hashes
            .entry(write.versions_key)
            .or_default()
            .extend(version_fields);
        hashes
            .entry(write.entries_key)
            .or_default()
            .extend(entry_fields);
        Ok(written)
    }

    async fn replace_hashes(&self, writes: Vec<HashWrite>) -> Result<(), StoreError> {
        replace_all(&mut *self.hashes.lock().await, writes);
        Ok(())
    }

    async fn replace_hashes_if(
        &self,
        guard: &HashGuard,
        writes: Vec<HashWrite>,
    ) -> Result<bool, StoreError> {
        let mut hashes = self.hashes.lock().await;
        let unchanged = hashes
            .get(&guard.key)
            .map_or(guard.expected.is_empty(), |held| *held == guard.expected);
        if unchanged {
            replace_all(&mut hashes, writes);
        }
        Ok(unchanged)
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        let mut hashes = self.hashes.lock().await;
        for key in keys {
            hashes.remove(key);
        }
        Ok(())
    }
}

type Hashes = HashMap<String, HashMap<String, String>>;

fn replace_all(hashes: &mut Hashes, writes: Vec<HashWrite>) {
    for write in writes {
        hashes.remove(&write.key);
        if !write.fields.is_empty() {
            hashes.insert(write.key, write.fields.into_iter().collect());
        }
    }
}

fn stored_version(
    hash: Option<&HashMap<String, String>>,
    field: &str,
) -> Result<Option<Version>, StoreError> {
    hash.and_then(|h| h.get(field))
        .map(|v| {
            v.parse::<Version>()
                .map_err(|e| StoreError::Codec(format!("invalid version for {field:?}: {e}")))
        })
        .transpose()
}
