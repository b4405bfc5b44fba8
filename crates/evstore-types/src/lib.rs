//! Shared type definitions for the evstore workspace.
//!
//! This crate is the single source of truth for the values that flow between
//! callers, the engine (`evstore-core`) and the storage backends
//! (`evstore-db`). It performs no I/O.
//!
//! # Modules
//!
//! - [`ids`] -- String newtypes for aggregate identity
//! - [`event`] -- Input events, persisted records and the read projection
//! - [`version`] -- Version numbers and the caller's expected version
//! - [`snapshot_key`] -- The `(fully_qualified_name, sub_key)` cache key

pub mod event;
pub mod ids;
pub mod snapshot_key;
pub mod version;

// Re-export all public types at crate root for convenience.
pub use event::{Event, PersistedEvent, SerializedEvent};
pub use ids::{AggregateId, AggregateType};
pub use snapshot_key::{KEY_DELIMITER, NO_SUB_KEY, SnapshotKey};
pub use version::{ExpectedVersion, NO_VERSION, Version};
