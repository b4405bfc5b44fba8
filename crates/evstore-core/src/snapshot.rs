//! Latest-state projection of an aggregate, kept in the snapshot cache.
//!
//! Two hashes per aggregate:
//!
//! | Key | Field | Value |
//! |-----|-------|-------|
//! | `{ns}_snapshots_for_{id}` | encoded [`SnapshotKey`] | JSON [`SnapshotEntry`] |
//! | `{ns}_snapshot_versions_for_{id}` | encoded [`SnapshotKey`] | decimal version |
//! | `{ns}_snapshot_versions_for_{id}` | `current_version` | highest version written |
//!
//! The append path writes through ([`Snapshot::store_snapshot`]) with a
//! compare-and-set per key, so write-throughs racing each other after their
//! appends commit can land in any order. The read path rebuilds an empty
//! cache from the event stream before answering, so a cache that was flushed
//! or never written heals on the next read.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use evstore_types::{
    KEY_DELIMITER, NO_VERSION, PersistedEvent, SerializedEvent, SnapshotKey, Version,
};
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::error::StoreError;
use crate::event_stream::EventStream;
use crate::store::{HashGuard, HashWrite, SnapshotCache, SnapshotWrite, VersionedField};

/// Field of the versions hash holding the aggregate-wide version.
pub const CURRENT_VERSION_FIELD: &str = "current_version";

/// Guarded replace attempts before a rename gives up.
const RENAME_ATTEMPTS: usize = 5;

/// Value stored per key in the snapshot hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    /// Version of the projected event.
    pub version: Version,
    /// Payload in [`codec::escape`] form.
    pub serialized_event: String,
    /// When the event happened.
    pub occurred_at: DateTime<Utc>,
}

impl SnapshotEntry {
    fn from_event(event: &PersistedEvent) -> Self {
        Self {
            version: event.version,
            serialized_event: codec::escape(&event.serialized_event),
            occurred_at: event.occurred_at,
        }
    }

    fn into_serialized(self, key: SnapshotKey) -> Result<SerializedEvent, StoreError> {
        Ok(SerializedEvent {
            fully_qualified_name: key.fully_qualified_name,
            sub_key: key.sub_key,
            serialized_event: codec::unescape(&self.serialized_event)?,
            version: self.version,
            occurred_at: self.occurred_at,
        })
    }
}

/// The snapshot of one aggregate.
#[derive(Clone)]
pub struct Snapshot {
    cache: Arc<dyn SnapshotCache>,
    stream: EventStream,
    snapshot_key: String,
    versions_key: String,
    rebuild_page_size: u64,
}

impl Snapshot {
    /// Bind the snapshot of `stream`'s aggregate under `namespace`.
    pub fn new(
        cache: Arc<dyn SnapshotCache>,
        stream: EventStream,
        namespace: &str,
        rebuild_page_size: u64,
    ) -> Self {
        let id = stream.aggregate_id();
        let snapshot_key = snapshot_hash_key(namespace, id);
        let versions_key = versions_hash_key(namespace, id);
        Self {
            cache,
            stream,
            snapshot_key,
            versions_key,
            rebuild_page_size: rebuild_page_size.max(1),
        }
    }

    /// Cache key of the entries hash.
    pub fn snapshot_table(&self) -> &str {
        &self.snapshot_key
    }

    /// Cache key of the versions hash.
    pub fn snapshot_version_table(&self) -> &str {
        &self.versions_key
    }

    /// Whether the snapshot has been written.
    pub async fn exists(&self) -> Result<bool, StoreError> {
        self.cache.exists(&self.snapshot_key).await
    }

    /// Project a batch of persisted events into the cache.
    ///
    /// For each key the highest version in the batch is offered to the
    /// cache, which keeps it only if it beats the version already stored.
    /// `current_version` never decreases. Returns the number of entries
    /// written.
    pub async fn store_snapshot(&self, events: &[PersistedEvent]) -> Result<usize, StoreError> {
        let mut latest: BTreeMap<String, &PersistedEvent> = BTreeMap::new();
        for event in events {
            let field = event.snapshot_key().encode();
            if latest.get(&field).is_none_or(|held| held.version < event.version) {
                latest.insert(field, event);
            }
        }
        if latest.is_empty() {
            return Ok(0);
        }

        let fields = latest
            .into_iter()
            .map(|(field, event)| {
                Ok(VersionedField {
                    field,
                    version: event.version,
                    value: serde_json::to_string(&SnapshotEntry::from_event(event))?,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        let written = self
            .cache
            .write_if_newer(SnapshotWrite {
                versions_key: self.versions_key.clone(),
                entries_key: self.snapshot_key.clone(),
                current_field: CURRENT_VERSION_FIELD.to_owned(),
                fields,
            })
            .await?;

        tracing::debug!(snapshot = %self.snapshot_key, written, "Stored snapshot entries");
        Ok(written)
    }

    /// The projection, ordered by version.
    ///
    /// An empty cache is rebuilt from the event stream first, unless the
    /// stream is empty as well.
    pub async fn snapshot(&self) -> Result<Vec<SerializedEvent>, StoreError> {
        let mut raw = self.cache.read_hash(&self.snapshot_key).await?;
        if raw.is_empty() {
            if self.stream.last().await?.is_none() {
                return Ok(Vec::new());
            }
            tracing::info!(snapshot = %self.snapshot_key, "Snapshot cache empty, rebuilding");
            self.rebuild_snapshot().await?;
            raw = self.cache.read_hash(&self.snapshot_key).await?;
        }

        let mut events = raw
            .into_iter()
            .map(|(field, value)| decode_entry(&field, &value))
            .collect::<Result<Vec<_>, _>>()?;
        events.sort_by(|a, b| {
            a.version
                .cmp(&b.version)
                .then_with(|| a.fully_qualified_name.cmp(&b.fully_qualified_name))
                .then_with(|| a.sub_key.cmp(&b.sub_key))
        });
        Ok(events)
    }

    /// Replay the whole stream and swap the result in for the snapshot.
    ///
    /// The projection is folded in memory and committed with one atomic
    /// replace, so readers see either the old snapshot or the new one.
    /// Events appended while the replay ran are then written through on
    /// top. Returns the number of entries written.
    pub async fn rebuild_snapshot(&self) -> Result<usize, StoreError> {
        let mut projection: BTreeMap<String, SnapshotEntry> = BTreeMap::new();
        let mut replayed: usize = 0;
        let mut last_version = None;
        let mut from = Some(Version::MIN);
        while let Some(start) = from {
            let page = self
                .stream
                .events_from(start, Some(self.rebuild_page_size))
                .await?;
            for event in &page {
                projection.insert(event.snapshot_key().encode(), SnapshotEntry::from_event(event));
            }
            replayed = replayed.saturating_add(page.len());
            last_version = page.last().map(|e| e.version).or(last_version);
            from = self.next_page(&page);
        }

        let mut entry_fields = Vec::with_capacity(projection.len());
        let mut version_fields = Vec::with_capacity(projection.len().saturating_add(1));
        for (field, entry) in &projection {
            version_fields.push((field.clone(), entry.version.to_string()));
            entry_fields.push((field.clone(), serde_json::to_string(entry)?));
        }
        if let Some(last) = last_version {
            version_fields.push((CURRENT_VERSION_FIELD.to_owned(), last.to_string()));
        }
        self.cache
            .replace_hashes(vec![
                HashWrite::new(self.versions_key.clone(), version_fields),
                HashWrite::new(self.snapshot_key.clone(), entry_fields),
            ])
            .await?;

        // A write-through that landed before the replace was overwritten.
        let tail_start = last_version.map_or(Some(Version::MIN), |v| v.checked_add(1));
        let caught_up = self.catch_up(tail_start).await?;
        let written = projection.len().saturating_add(caught_up);

        tracing::info!(
            snapshot = %self.snapshot_key,
            replayed,
            written,
            caught_up,
            "Rebuilt snapshot"
        );
        Ok(written)
    }

    /// Write through every event from `from` on, a page at a time.
    async fn catch_up(&self, mut from: Option<Version>) -> Result<usize, StoreError> {
        let mut written: usize = 0;
        while let Some(start) = from {
            let page = self
                .stream
                .events_from(start, Some(self.rebuild_page_size))
                .await?;
            written = written.saturating_add(self.store_snapshot(&page).await?);
            from = self.next_page(&page);
        }
        Ok(written)
    }

    /// Start of the page after `page`, or `None` once the stream is drained.
    fn next_page(&self, page: &[PersistedEvent]) -> Option<Version> {
        let full = u64::try_from(page.len()).is_ok_and(|n| n >= self.rebuild_page_size);
        page.last()
            .filter(|_| full)
            .and_then(|last| last.version.checked_add(1))
    }

    /// Remove both snapshot hashes.
    pub async fn delete_snapshot(&self) -> Result<(), StoreError> {
        self.cache
            .delete(&[self.snapshot_key.clone(), self.versions_key.clone()])
            .await
    }

    /// Highest version projected, or `-1`.
    pub async fn version(&self) -> Result<Version, StoreError> {
        self.read_version(CURRENT_VERSION_FIELD).await
    }

    /// Highest version projected for one key, or `-1`.
    pub async fn version_for(
        &self,
        fully_qualified_name: &str,
        sub_key: Option<&str>,
    ) -> Result<Version, StoreError> {
        let field = SnapshotKey::new(fully_qualified_name, sub_key).encode();
        self.read_version(&field).await
    }

    /// Number of projected keys.
    pub async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.snapshot().await?.len())
    }

    /// Whether the projection is empty.
    pub async fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len().await? == 0)
    }

    /// The projected entry with the highest version.
    pub async fn last_event(&self) -> Result<Option<SerializedEvent>, StoreError> {
        Ok(self.snapshot().await?.pop())
    }

    /// Rename event types in place.
    ///
    /// `rename` returns the new name, or `None` to keep the old one. When two
    /// keys collide the higher version wins. `current_version` is left as it
    /// was. Both hashes are replaced in one atomic step that only goes ahead
    /// if the versions hash is still the one the rename was computed from;
    /// otherwise the rename is recomputed, up to a fixed number of attempts.
    /// Returns the number of keys renamed.
    ///
    /// # Errors
    ///
    /// - [`StoreError::InvalidKey`] if a new name contains the key delimiter.
    /// - [`StoreError::SnapshotContention`] if the snapshot changed under
    ///   every attempt.
    pub async fn update_fully_qualified_names<F>(&self, rename: F) -> Result<usize, StoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        for attempt in 1..=RENAME_ATTEMPTS {
            // Versions first: a write-through between the two reads then
            // fails the guard instead of going missing.
            let versions = self.cache.read_hash(&self.versions_key).await?;
            let raw = self.cache.read_hash(&self.snapshot_key).await?;
            let Some((renamed, writes)) = self.renamed_hashes(raw, &versions, &rename)? else {
                return Ok(0);
            };

            let guard = HashGuard {
                key: self.versions_key.clone(),
                expected: versions,
            };
            if self.cache.replace_hashes_if(&guard, writes).await? {
                tracing::info!(
                    snapshot = %self.snapshot_key,
                    renamed,
                    "Renamed snapshot event types"
                );
                return Ok(renamed);
            }
            tracing::debug!(
                snapshot = %self.snapshot_key,
                attempt,
                "Snapshot changed during rename, retrying"
            );
        }

        tracing::warn!(snapshot = %self.snapshot_key, "Giving up on snapshot rename");
        Err(StoreError::SnapshotContention(self.snapshot_key.clone()))
    }

    /// Both hashes with `rename` applied, or `None` if nothing changes.
    fn renamed_hashes<F>(
        &self,
        raw: HashMap<String, String>,
        versions: &HashMap<String, String>,
        rename: &F,
    ) -> Result<Option<(usize, Vec<HashWrite>)>, StoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut renamed: usize = 0;
        let mut entries: BTreeMap<String, SnapshotEntry> = BTreeMap::new();
        for (field, value) in raw {
            let mut key = parse_key(&field)?;
            let entry: SnapshotEntry = serde_json::from_str(&value)?;
            if let Some(name) =
                rename(&key.fully_qualified_name).filter(|n| *n != key.fully_qualified_name)
            {
                if name.contains(KEY_DELIMITER) {
                    return Err(StoreError::InvalidKey {
                        attribute: "fully_qualified_name",
                    });
                }
                renamed = renamed.saturating_add(1);
                key.fully_qualified_name = name;
            }
            let field = key.encode();
            if entries.get(&field).is_none_or(|held| held.version < entry.version) {
                entries.insert(field, entry);
            }
        }
        if renamed == 0 {
            return Ok(None);
        }

        let mut entry_fields = Vec::with_capacity(entries.len());
        let mut version_fields = Vec::with_capacity(entries.len().saturating_add(1));
        for (field, entry) in &entries {
            version_fields.push((field.clone(), entry.version.to_string()));
            entry_fields.push((field.clone(), serde_json::to_string(entry)?));
        }
        if let Some(current) = versions.get(CURRENT_VERSION_FIELD) {
            version_fields.push((CURRENT_VERSION_FIELD.to_owned(), current.clone()));
        }
        Ok(Some((
            renamed,
            vec![
                HashWrite::new(self.versions_key.clone(), version_fields),
                HashWrite::new(self.snapshot_key.clone(), entry_fields),
            ],
        )))
    }

    async fn read_version(&self, field: &str) -> Result<Version, StoreError> {
        self.cache
            .read_field(&self.versions_key, field)
            .await?
            .map_or(Ok(NO_VERSION), |v| parse_version(field, &v))
    }
}

/// Cache key of the entries hash of one aggregate.
pub fn snapshot_hash_key(namespace: &str, aggregate_id: &str) -> String {
    format!("{namespace}_snapshots_for_{aggregate_id}")
}

/// Cache key of the versions hash of one aggregate.
pub fn versions_hash_key(namespace: &str, aggregate_id: &str) -> String {
    format!("{namespace}_snapshot_versions_for_{aggregate_id}")
}

fn parse_key(field: &str) -> Result<SnapshotKey, StoreError> {
    SnapshotKey::decode(field)
        .ok_or_else(|| StoreError::Codec(format!("malformed snapshot key: {field:?}")))
}

fn parse_version(field: &str, value: &str) -> Result<Version, StoreError> {
    value
        .parse::<Version>()
        .map_err(|e| StoreError::Codec(format!("invalid version for {field:?}: {e}")))
}

fn decode_entry(field: &str, value: &str) -> Result<SerializedEvent, StoreError> {
    let key = parse_key(field)?;
    let entry: SnapshotEntry = serde_json::from_str(value)?;
    entry.into_serialized(key)
}
