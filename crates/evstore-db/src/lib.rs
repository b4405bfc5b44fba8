//! Storage backends for the evstore engine (`PostgreSQL` + `Dragonfly`).
//!
//! `PostgreSQL` holds the append-only event log, the source of truth.
//! `Dragonfly` holds the snapshot cache, a derived projection that can be
//! rebuilt from the log at any time.
//!
//! # Architecture
//!
//! ```text
//! evstore_core::StoreContext
//!     |
//!     +-- EventLog ------> PostgreSQL (PgEventLog)
//!     |                      one table per aggregate type
//!     |
//!     +-- SnapshotCache --> Dragonfly (DragonflyPool)
//!                            two hashes per aggregate
//! ```
//!
//! # Modules
//!
//! - [`event_log`] -- The [`evstore_core::EventLog`] implementation and its pool
//! - [`schema`] -- Event log table DDL
//! - [`dragonfly`] -- The [`evstore_core::SnapshotCache`] implementation
//! - [`config`] -- Deployment configuration
//! - [`telemetry`] -- Tracing subscriber setup
//! - [`error`] -- Shared error types

pub mod config;
pub mod dragonfly;
pub mod error;
pub mod event_log;
pub mod schema;
pub mod telemetry;

use std::sync::Arc;

use evstore_core::StoreContext;

// Re-export primary types for convenience.
pub use crate::config::{EventStoreConfig, LoggingConfig, PostgresSettings};
pub use dragonfly::DragonflyPool;
pub use error::DbError;
pub use event_log::{EventRow, PgEventLog};
pub use telemetry::init_tracing;

/// Connect both backends and assemble a [`StoreContext`].
///
/// Runs the bundled migrations and creates missing event log tables when
/// the engine settings ask for it.
///
/// # Errors
///
/// Returns [`DbError::Store`] for an invalid aggregate type table, and the
/// backend errors of the connection and DDL steps.
pub async fn connect(config: &EventStoreConfig) -> Result<StoreContext, DbError> {
    let registry = config.registry()?;

    let event_log = PgEventLog::connect(&config.postgres).await?;
    if config.engine.run_migrations {
        event_log.migrate().await?;
    }
    if config.engine.ensure_tables {
        event_log.ensure_tables(&registry).await?;
    }

    let dragonfly = DragonflyPool::connect(&config.dragonfly.url).await?;

    tracing::info!(
        aggregate_types = registry.len(),
        "Event store connected"
    );
    Ok(StoreContext::new(
        Arc::new(event_log),
        Arc::new(dragonfly),
        registry,
    )
    .with_settings(config.engine_settings()))
}
