//! The event log in `PostgreSQL`.
//!
//! One table per aggregate type, one row per event:
//!
//! | Column | Type | Notes |
//! |--------|------|-------|
//! | `aggregate_id` | `TEXT` | |
//! | `version` | `BIGINT` | unique with `aggregate_id` |
//! | `occurred_at` | `TIMESTAMPTZ` | microsecond precision |
//! | `fully_qualified_name` | `TEXT` | |
//! | `sub_key` | `TEXT` | |
//! | `serialized_event` | `TEXT` | `bytea` hex format |
//!
//! Appends run in one transaction whose first statement takes a
//! transaction-scoped advisory lock on `(table, aggregate_id)`. Concurrent
//! appenders of one aggregate therefore read the last version, check
//! concurrency and insert one after the other; appenders of different
//! aggregates do not wait on each other.
//!
//! Table names are interpolated into the SQL. They come from the aggregate
//! registry, which only accepts plain identifiers.
//!
//! [`PgEventLog::connect`] opens the pool; [`PgEventLog::migrate`] and
//! [`PgEventLog::ensure_tables`] prepare the tables before first use.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use evstore_core::{AggregateRegistry, AppendPlan, EventLog, EventRecord, StoreError};
use evstore_types::Version;
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};

use crate::config::PostgresSettings;
use crate::error::DbError;
use crate::schema;

/// Default number of rows per `INSERT`.
const DEFAULT_BATCH_SIZE: usize = 500;

/// Columns of an event row, in [`EventRow`] order.
const COLUMNS: &str =
    "aggregate_id, version, occurred_at, fully_qualified_name, sub_key, serialized_event";

/// [`EventLog`] backed by a `PostgreSQL` pool.
#[derive(Clone)]
pub struct PgEventLog {
    pool: PgPool,
    batch_size: usize,
}

impl PgEventLog {
    /// Create an event log on `pool`.
    pub const fn new(pool: PgPool) -> Self {
        Self {
            pool,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Open a connection pool to the event log database.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Config`] if the URL cannot be parsed.
    /// Returns [`DbError::Postgres`] if the connection fails.
    pub async fn connect(settings: &PostgresSettings) -> Result<Self, DbError> {
        let options: PgConnectOptions = settings
            .url
            .parse()
            .map_err(|e: sqlx::Error| DbError::Config(format!("Invalid database URL: {e}")))?;

        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .acquire_timeout(settings.connect_timeout())
            .idle_timeout(settings.idle_timeout())
            .connect_with(options)
            .await?;

        tracing::info!(
            max_connections = settings.max_connections,
            "Connected to event log database"
        );
        Ok(Self::new(pool))
    }

    /// Apply the bundled migrations, which create `device_events`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Migration`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), DbError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        tracing::info!("Event log migrations completed");
        Ok(())
    }

    /// Create the table of every registered aggregate type that lacks one.
    ///
    /// Returns the number of tables checked.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if a table cannot be created.
    pub async fn ensure_tables(&self, registry: &AggregateRegistry) -> Result<usize, DbError> {
        let mut checked: usize = 0;
        for (_, storage) in registry.entries() {
            schema::ensure_table(&self.pool, &storage.table).await?;
            checked = checked.saturating_add(1);
        }
        Ok(checked)
    }

    /// The underlying pool.
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Close every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
        tracing::info!("Event log pool closed");
    }

    /// Set the number of rows per `INSERT` statement.
    #[must_use]
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    async fn append_tx(&self, table: &str, plan: AppendPlan) -> Result<Vec<EventRecord>, DbError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(format!("{table}:{}", plan.aggregate_id()))
            .execute(&mut *tx)
            .await?;

        let last_version: Option<i64> = sqlx::query_scalar(&format!(
            "SELECT MAX(version) FROM {table} WHERE aggregate_id = $1"
        ))
        .bind(plan.aggregate_id())
        .fetch_one(&mut *tx)
        .await?;

        let type_versions: HashMap<String, Version> = if plan.needs_type_versions(last_version) {
            sqlx::query_as::<_, (String, i64)>(&format!(
                r"SELECT fully_qualified_name, MAX(version)
                  FROM {table}
                  WHERE aggregate_id = $1 AND fully_qualified_name = ANY($2)
                  GROUP BY fully_qualified_name"
            ))
            .bind(plan.aggregate_id())
            .bind(plan.fully_qualified_names())
            .fetch_all(&mut *tx)
            .await?
            .into_iter()
            .collect()
        } else {
            HashMap::new()
        };

        let records = plan.prepare(last_version, &type_versions)?;

        let insert = format!(
            r"INSERT INTO {table} ({COLUMNS})
              SELECT * FROM UNNEST($1::TEXT[], $2::BIGINT[], $3::TIMESTAMPTZ[], $4::TEXT[], $5::TEXT[], $6::TEXT[])"
        );
        for chunk in records.chunks(self.batch_size) {
            let len = chunk.len();
            let mut aggregate_ids = Vec::with_capacity(len);
            let mut versions = Vec::with_capacity(len);
            let mut occurred = Vec::with_capacity(len);
            let mut names = Vec::with_capacity(len);
            let mut sub_keys = Vec::with_capacity(len);
            let mut payloads = Vec::with_capacity(len);
            for record in chunk {
                aggregate_ids.push(record.aggregate_id.as_str());
                versions.push(record.version);
                occurred.push(record.occurred_at);
                names.push(record.fully_qualified_name.as_str());
                sub_keys.push(record.sub_key.as_str());
                payloads.push(record.serialized_event.as_str());
            }

            sqlx::query(&insert)
                .bind(&aggregate_ids)
                .bind(&versions)
                .bind(&occurred)
                .bind(&names)
                .bind(&sub_keys)
                .bind(&payloads)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        tracing::debug!(
            table,
            count = records.len(),
            "Inserted events (batch UNNEST)"
        );
        Ok(records)
    }

    async fn fetch(
        &self,
        sql: &str,
        aggregate_id: &str,
    ) -> Result<Vec<EventRecord>, DbError> {
        let rows = sqlx::query_as::<_, EventRow>(sql)
            .bind(aggregate_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(EventRecord::from).collect())
    }

    async fn events_from_query(
        &self,
        table: &str,
        aggregate_id: &str,
        min_version: Version,
        limit: Option<u64>,
    ) -> Result<Vec<EventRecord>, DbError> {
        let rows = sqlx::query_as::<_, EventRow>(&format!(
            r"SELECT {COLUMNS} FROM {table}
              WHERE aggregate_id = $1 AND version >= $2
              ORDER BY version
              LIMIT $3"
        ))
        .bind(aggregate_id)
        .bind(min_version)
        .bind(limit.map(to_i64))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(EventRecord::from).collect())
    }

    async fn events_between_query(
        &self,
        table: &str,
        aggregate_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        names: &[String],
    ) -> Result<Vec<EventRecord>, DbError> {
        let rows = sqlx::query_as::<_, EventRow>(&format!(
            r"SELECT {COLUMNS} FROM {table}
              WHERE aggregate_id = $1
                AND occurred_at BETWEEN $2 AND $3
                AND (cardinality($4::TEXT[]) = 0 OR fully_qualified_name = ANY($4))
              ORDER BY version"
        ))
        .bind(aggregate_id)
        .bind(start)
        .bind(end)
        .bind(names)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(EventRecord::from).collect())
    }

    async fn last_query(
        &self,
        table: &str,
        aggregate_id: &str,
        fully_qualified_name: Option<&str>,
    ) -> Result<Option<EventRecord>, DbError> {
        let row = sqlx::query_as::<_, EventRow>(&format!(
            r"SELECT {COLUMNS} FROM {table}
              WHERE aggregate_id = $1
                AND ($2::TEXT IS NULL OR fully_qualified_name = $2)
              ORDER BY version DESC
              LIMIT 1"
        ))
        .bind(aggregate_id)
        .bind(fully_qualified_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(EventRecord::from))
    }

    async fn execute(&self, sql: &str, aggregate_id: Option<&str>) -> Result<u64, DbError> {
        let query = sqlx::query(sql);
        let query = match aggregate_id {
            Some(id) => query.bind(id),
            None => query,
        };
        Ok(query.execute(&self.pool).await?.rows_affected())
    }

    async fn count_query(&self, table: &str) -> Result<u64, DbError> {
        let count: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(DISTINCT aggregate_id) FROM {table}"))
                .fetch_one(&self.pool)
                .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn ids_query(&self, table: &str, offset: u64, limit: u64) -> Result<Vec<String>, DbError> {
        let ids = sqlx::query_scalar::<_, String>(&format!(
            r"SELECT DISTINCT aggregate_id FROM {table}
              ORDER BY aggregate_id
              OFFSET $1
              LIMIT $2"
        ))
        .bind(to_i64(offset))
        .bind(to_i64(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}

fn to_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

#[async_trait]
impl EventLog for PgEventLog {
    async fn append(&self, table: &str, plan: AppendPlan) -> Result<Vec<EventRecord>, StoreError> {
        if plan.is_empty() {
            return Ok(Vec::new());
        }
        self.append_tx(table, plan)
            .await
            .map_err(DbError::into_log_error)
    }

    async fn events_from(
        &self,
        table: &str,
        aggregate_id: &str,
        min_version: Version,
        limit: Option<u64>,
    ) -> Result<Vec<EventRecord>, StoreError> {
        self.events_from_query(table, aggregate_id, min_version, limit)
            .await
            .map_err(DbError::into_log_error)
    }

    async fn events_between(
        &self,
        table: &str,
        aggregate_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        names: &[String],
    ) -> Result<Vec<EventRecord>, StoreError> {
        self.events_between_query(table, aggregate_id, start, end, names)
            .await
            .map_err(DbError::into_log_error)
    }

    async fn last(
        &self,
        table: &str,
        aggregate_id: &str,
        fully_qualified_name: Option<&str>,
    ) -> Result<Option<EventRecord>, StoreError> {
        self.last_query(table, aggregate_id, fully_qualified_name)
            .await
            .map_err(DbError::into_log_error)
    }

    async fn latest_per_type(
        &self,
        table: &str,
        aggregate_id: &str,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let sql = format!(
            r"SELECT {COLUMNS} FROM (
                  SELECT DISTINCT ON (fully_qualified_name) {COLUMNS}
                  FROM {table}
                  WHERE aggregate_id = $1
                  ORDER BY fully_qualified_name, version DESC
              ) latest
              ORDER BY version"
        );
        self.fetch(&sql, aggregate_id)
            .await
            .map_err(DbError::into_log_error)
    }

    async fn delete_events(&self, table: &str, aggregate_id: &str) -> Result<u64, StoreError> {
        let sql = format!("DELETE FROM {table} WHERE aggregate_id = $1");
        self.execute(&sql, Some(aggregate_id))
            .await
            .map_err(DbError::into_log_error)
    }

    async fn count_aggregates(&self, table: &str) -> Result<u64, StoreError> {
        self.count_query(table)
            .await
            .map_err(DbError::into_log_error)
    }

    async fn aggregate_ids(
        &self,
        table: &str,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<String>, StoreError> {
        self.ids_query(table, offset, limit)
            .await
            .map_err(DbError::into_log_error)
    }

    async fn purge(&self, table: &str) -> Result<u64, StoreError> {
        let sql = format!("DELETE FROM {table}");
        self.execute(&sql, None)
            .await
            .map_err(DbError::into_log_error)
    }
}

/// A row of an event log table.
///
/// Uses runtime types rather than compile-time checked types to
/// avoid requiring a live database during builds.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EventRow {
    /// Aggregate the event belongs to.
    pub aggregate_id: String,
    /// Per-aggregate version.
    pub version: i64,
    /// When the event happened.
    pub occurred_at: DateTime<Utc>,
    /// Logical event type.
    pub fully_qualified_name: String,
    /// Partition within the type.
    pub sub_key: String,
    /// Escaped payload.
    pub serialized_event: String,
}

impl From<EventRow> for EventRecord {
    fn from(row: EventRow) -> Self {
        Self {
            aggregate_id: row.aggregate_id,
            version: row.version,
            occurred_at: row.occurred_at,
            fully_qualified_name: row.fully_qualified_name,
            sub_key: row.sub_key,
            serialized_event: row.serialized_event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unparsable_url_fails_before_connecting() {
        let settings = PostgresSettings::new("not a url");
        let result = PgEventLog::connect(&settings).await;
        assert!(matches!(result, Err(DbError::Config(_))));
    }

    #[test]
    fn limits_saturate_at_bigint_max() {
        assert_eq!(to_i64(5), 5);
        assert_eq!(to_i64(u64::MAX), i64::MAX);
    }

    #[test]
    fn rows_convert_field_for_field() {
        let row = EventRow {
            aggregate_id: "device-1".to_owned(),
            version: 3,
            occurred_at: DateTime::<Utc>::UNIX_EPOCH,
            fully_qualified_name: "door_opened".to_owned(),
            sub_key: "NO_SUB_KEY".to_owned(),
            serialized_event: "\\x00".to_owned(),
        };
        let record = EventRecord::from(row);
        assert_eq!(record.version, 3);
        assert_eq!(record.serialized_event, "\\x00");
    }
}
