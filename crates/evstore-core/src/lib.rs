//! Event-sourcing engine: append protocol, optimistic concurrency and the
//! snapshot projection.
//!
//! The engine owns no storage. It drives two collaborators through the
//! traits in [`store`]: a durable [`EventLog`] (the source of truth) and a
//! [`SnapshotCache`] holding the latest event per `(type, sub_key)` of each
//! aggregate.
//!
//! # Flow
//!
//! ```text
//! Client::append(events, expected)
//!     |
//!     +-- EventStream::append --> EventLog (one transaction)
//!     |       last version, concurrency check, versions, validation, insert
//!     |
//!     +-- Snapshot::store_snapshot --> SnapshotCache (compare-and-set per key)
//!
//! Client::snapshot()
//!     +-- SnapshotCache, rebuilt from the EventLog when empty
//! ```
//!
//! # Modules
//!
//! - [`codec`] -- Binary-safe payload escaping
//! - [`concurrency`] -- The expected-version check
//! - [`store`] -- Collaborator traits and the append plan
//! - [`event_stream`] -- Per-aggregate view of the event log
//! - [`snapshot`] -- Per-aggregate snapshot projection and rebuild
//! - [`registry`] -- Aggregate type to storage routing
//! - [`context`] -- Shared collaborators and settings
//! - [`aggregate`] -- Stream and snapshot bound to one identity
//! - [`client`] -- The public API
//! - [`memory`] -- In-memory collaborators
//! - [`error`] -- Error types

pub mod aggregate;
pub mod client;
pub mod codec;
pub mod concurrency;
pub mod context;
pub mod error;
pub mod event_stream;
pub mod memory;
pub mod registry;
pub mod snapshot;
pub mod store;

// Re-export primary types for convenience.
pub use aggregate::Aggregate;
pub use client::Client;
pub use context::{DEFAULT_REBUILD_PAGE_SIZE, EngineSettings, StoreContext};
pub use error::{BoxError, StoreError};
pub use event_stream::EventStream;
pub use memory::{InMemoryEventLog, InMemorySnapshotCache};
pub use registry::{AggregateRegistry, StorageConfig};
pub use snapshot::{CURRENT_VERSION_FIELD, Snapshot, SnapshotEntry};
pub use store::{
    AppendPlan, EventLog, EventRecord, HashGuard, HashWrite, SnapshotCache, SnapshotWrite,
    VersionedField,
};
