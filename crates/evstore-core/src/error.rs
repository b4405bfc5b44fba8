//! Error types for the engine.
//!
//! Every public operation returns [`StoreError`]. Append-time failures
//! (`AttributeMissing`, `Concurrency`, `InvalidInput`, `AggregateMismatch`)
//! abort the whole batch. Collaborator failures are carried in `Log` and
//! `Cache` and propagated unchanged; the engine never retries a failed
//! collaborator call.

use evstore_types::{ExpectedVersion, Version};

/// Boxed error from one of the storage collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur in the engine.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A required event field was empty or absent.
    #[error("value required for {attribute}")]
    AttributeMissing {
        /// Name of the missing field.
        attribute: &'static str,
    },

    /// The expected version is older than the last event of a type in the batch.
    #[error(
        "expected version {expected} does not occur after last version {actual} of {fully_qualified_name}"
    )]
    Concurrency {
        /// The event type that conflicted.
        fully_qualified_name: String,
        /// The version the writer declared.
        expected: ExpectedVersion,
        /// The last persisted version of that type.
        actual: Version,
    },

    /// The batch contained a missing event.
    #[error("cannot append a missing event (batch position {index})")]
    InvalidInput {
        /// Position of the missing event in the submitted batch.
        index: usize,
    },

    /// An event in the batch names a different aggregate than the stream.
    #[error("event for aggregate {actual} appended to stream of {expected}")]
    AggregateMismatch {
        /// The aggregate the stream belongs to.
        expected: String,
        /// The aggregate named by the event.
        actual: String,
    },

    /// An event type or sub-key contains the snapshot key delimiter.
    #[error("value for {attribute} contains the snapshot key delimiter")]
    InvalidKey {
        /// Name of the offending field.
        attribute: &'static str,
    },

    /// The snapshot changed under every attempt to rename its event types.
    #[error("snapshot {0} kept changing during rename")]
    SnapshotContention(String),

    /// The aggregate's version counter cannot advance any further.
    #[error("version overflow for aggregate {0}")]
    VersionOverflow(String),

    /// No storage is registered for the aggregate type.
    #[error("unknown aggregate type: {0}")]
    UnknownAggregateType(String),

    /// A registered table name is not a plain SQL identifier.
    #[error("invalid table name: {0}")]
    InvalidTableName(String),

    /// A stored payload or cache value could not be decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// A snapshot entry could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The durable event log failed.
    #[error("event log error: {0}")]
    Log(#[source] BoxError),

    /// The snapshot cache failed.
    #[error("snapshot cache error: {0}")]
    Cache(#[source] BoxError),
}

impl StoreError {
    /// Wrap a durable log failure.
    pub fn log(err: impl Into<BoxError>) -> Self {
        Self::Log(err.into())
    }

    /// Wrap a cache failure.
    pub fn cache(err: impl Into<BoxError>) -> Self {
        Self::Cache(err.into())
    }
}
