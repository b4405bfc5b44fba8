//! Error types for the storage backends.
//!
//! Backend code works with [`DbError`], which wraps the underlying [`sqlx`],
//! [`fred`] and [`config`] errors. At the trait boundary it becomes a
//! [`StoreError`]: `Log` for the event log, `Cache` for the snapshot cache.
//! Engine errors raised inside a transaction pass through unchanged.

use evstore_core::StoreError;

/// Errors that can occur in the storage backends.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// A `PostgreSQL` operation failed.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// A `PostgreSQL` migration failed.
    #[error("PostgreSQL migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A `Dragonfly`/Redis operation failed.
    #[error("Dragonfly error: {0}")]
    Dragonfly(#[from] fred::error::Error),

    /// A serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration sources could not be read or deserialized.
    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    /// A configuration value is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The engine rejected an operation.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DbError {
    /// Convert for the [`evstore_core::EventLog`] boundary.
    pub fn into_log_error(self) -> StoreError {
        match self {
            Self::Store(err) => err,
            other => StoreError::log(other),
        }
    }

    /// Convert for the [`evstore_core::SnapshotCache`] boundary.
    pub fn into_cache_error(self) -> StoreError {
        match self {
            Self::Store(err) => err,
            other => StoreError::cache(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_pass_through() {
        let err = DbError::Store(StoreError::InvalidInput { index: 2 });
        assert!(matches!(
            err.into_log_error(),
            StoreError::InvalidInput { index: 2 }
        ));
    }

    #[test]
    fn backend_errors_are_wrapped_by_side() {
        let log = DbError::Config("bad".to_owned()).into_log_error();
        let cache = DbError::Config("bad".to_owned()).into_cache_error();
        assert!(matches!(log, StoreError::Log(_)));
        assert!(matches!(cache, StoreError::Cache(_)));
        assert!(cache.to_string().contains("Configuration error: bad"));
    }
}
