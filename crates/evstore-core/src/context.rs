//! The store context: collaborators, type registry and engine settings.
//!
//! Built once at startup and cloned into every client. There is no global
//! connection state; everything an aggregate needs comes from here.

use std::sync::Arc;

use evstore_types::{AggregateId, AggregateType};

use crate::aggregate::Aggregate;
use crate::error::StoreError;
use crate::memory::{InMemoryEventLog, InMemorySnapshotCache};
use crate::registry::{AggregateRegistry, StorageConfig};
use crate::snapshot::{snapshot_hash_key, versions_hash_key};
use crate::store::{EventLog, SnapshotCache};

/// Default number of events read per page when rebuilding a snapshot.
pub const DEFAULT_REBUILD_PAGE_SIZE: u64 = 1000;

/// Tunables of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// Events read per page when replaying a stream into a snapshot.
    pub rebuild_page_size: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            rebuild_page_size: DEFAULT_REBUILD_PAGE_SIZE,
        }
    }
}

/// Shared handle to the event log, the snapshot cache and the registry.
#[derive(Clone)]
pub struct StoreContext {
    log: Arc<dyn EventLog>,
    cache: Arc<dyn SnapshotCache>,
    registry: Arc<AggregateRegistry>,
    settings: EngineSettings,
}

impl StoreContext {
    /// Create a context with default settings.
    pub fn new(
        log: Arc<dyn EventLog>,
        cache: Arc<dyn SnapshotCache>,
        registry: AggregateRegistry,
    ) -> Self {
        Self {
            log,
            cache,
            registry: Arc::new(registry),
            settings: EngineSettings::default(),
        }
    }

    /// A context backed by in-memory collaborators.
    pub fn in_memory(registry: AggregateRegistry) -> Self {
        Self::new(
            Arc::new(InMemoryEventLog::new()),
            Arc::new(InMemorySnapshotCache::new()),
            registry,
        )
    }

    /// Replace the engine settings.
    #[must_use]
    pub const fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// The event log.
    pub fn log(&self) -> &Arc<dyn EventLog> {
        &self.log
    }

    /// The snapshot cache.
    pub fn cache(&self) -> &Arc<dyn SnapshotCache> {
        &self.cache
    }

    /// The type registry.
    pub fn registry(&self) -> &AggregateRegistry {
        &self.registry
    }

    /// The engine settings.
    pub const fn settings(&self) -> EngineSettings {
        self.settings
    }

    /// Resolve the storage of `tag`.
    pub fn storage(&self, tag: &AggregateType) -> Result<&StorageConfig, StoreError> {
        self.registry.resolve(tag)
    }

    /// Bind an aggregate.
    pub fn aggregate(&self, id: AggregateId, tag: AggregateType) -> Result<Aggregate, StoreError> {
        Aggregate::new(self, id, tag)
    }

    /// Delete every event and snapshot of one aggregate type.
    ///
    /// Meant for test resets. Returns the number of events removed.
    pub async fn purge_type(&self, tag: &AggregateType) -> Result<u64, StoreError> {
        let storage = self.storage(tag)?;
        let count = self.log.count_aggregates(&storage.table).await?;
        let ids = self.log.aggregate_ids(&storage.table, 0, count).await?;

        let keys: Vec<String> = ids
            .iter()
            .flat_map(|id| {
                [
                    snapshot_hash_key(&storage.cache_namespace, id),
                    versions_hash_key(&storage.cache_namespace, id),
                ]
            })
            .collect();
        if !keys.is_empty() {
            self.cache.delete(&keys).await?;
        }

        let removed = self.log.purge(&storage.table).await?;
        tracing::warn!(
            aggregate_type = %tag,
            table = %storage.table,
            aggregates = ids.len(),
            removed,
            "Purged aggregate type"
        );
        Ok(removed)
    }
}
