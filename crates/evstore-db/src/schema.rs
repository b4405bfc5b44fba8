//! Event log table DDL for registered aggregate types.
//!
//! The bundled migration only creates `device_events`. Other types get their
//! table from [`ensure_table`], which is idempotent and safe to run on every
//! start.

use sqlx::PgPool;

use crate::error::DbError;

/// Render the DDL of one event log table.
///
/// `table` must already be a validated identifier, optionally
/// schema-qualified.
pub fn table_ddl(table: &str) -> String {
    let (schema, name) = table
        .split_once('.')
        .map_or((None, table), |(schema, name)| (Some(schema), name));

    let mut ddl = String::new();
    if let Some(schema) = schema {
        ddl.push_str(&format!("CREATE SCHEMA IF NOT EXISTS {schema};\n"));
    }
    ddl.push_str(&format!(
        r"CREATE TABLE IF NOT EXISTS {table} (
    id                   BIGSERIAL   PRIMARY KEY,
    aggregate_id         TEXT        NOT NULL,
    version              BIGINT      NOT NULL,
    occurred_at          TIMESTAMPTZ NOT NULL,
    fully_qualified_name TEXT        NOT NULL,
    sub_key              TEXT        NOT NULL DEFAULT 'NO_SUB_KEY',
    serialized_event     TEXT        NOT NULL,
    CONSTRAINT {name}_aggregate_version_key UNIQUE (aggregate_id, version)
);
CREATE INDEX IF NOT EXISTS {name}_type_idx
    ON {table} (aggregate_id, fully_qualified_name, version);
CREATE INDEX IF NOT EXISTS {name}_occurred_at_idx
    ON {table} (aggregate_id, occurred_at);
"
    ));
    ddl
}

/// Create the event log table `table` if it does not exist.
///
/// # Errors
///
/// Returns [`DbError::Postgres`] if the DDL fails.
pub async fn ensure_table(pool: &PgPool, table: &str) -> Result<(), DbError> {
    sqlx::raw_sql(&table_ddl(table)).execute(pool).await?;
    tracing::info!(table, "Ensured event log table");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_table_has_no_schema_statement() {
        let ddl = table_ddl("order_events");
        assert!(!ddl.contains("CREATE SCHEMA"));
        assert!(ddl.contains("CREATE TABLE IF NOT EXISTS order_events ("));
        assert!(ddl.contains("UNIQUE (aggregate_id, version)"));
        assert!(ddl.contains("order_events_type_idx"));
    }

    #[test]
    fn qualified_table_creates_its_schema() {
        let ddl = table_ddl("events.device_events");
        assert!(ddl.starts_with("CREATE SCHEMA IF NOT EXISTS events;"));
        assert!(ddl.contains("CREATE TABLE IF NOT EXISTS events.device_events ("));
        assert!(ddl.contains("CONSTRAINT device_events_aggregate_version_key"));
        assert!(ddl.contains("ON events.device_events (aggregate_id, occurred_at)"));
    }
}
