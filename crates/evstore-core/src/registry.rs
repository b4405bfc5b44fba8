//! Static registry routing aggregate types to their storage.
//!
//! Each [`AggregateType`] maps to an event log table and a cache namespace.
//! Table names end up interpolated into SQL, so they are validated as plain
//! identifiers when registered, never at query time.

use std::collections::BTreeMap;

use evstore_types::AggregateType;

use crate::error::StoreError;

/// Longest identifier `PostgreSQL` accepts without truncation.
const MAX_IDENTIFIER_LEN: usize = 63;

/// Where one aggregate type's data lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    /// Event log table, optionally schema-qualified (`events.device_events`).
    pub table: String,
    /// Prefix of the snapshot cache keys.
    pub cache_namespace: String,
}

impl StorageConfig {
    /// Storage in `table`, cached under the type's own tag.
    pub fn new(tag: &AggregateType, table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            cache_namespace: tag.as_str().to_owned(),
        }
    }

    /// Override the cache namespace.
    #[must_use]
    pub fn with_cache_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.cache_namespace = namespace.into();
        self
    }
}

/// Lookup table from aggregate type to [`StorageConfig`].
#[derive(Debug, Clone, Default)]
pub struct AggregateRegistry {
    types: BTreeMap<AggregateType, StorageConfig>,
}

impl AggregateRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every tag with the conventional `{tag}_events` table.
    pub fn with_defaults<I, T>(tags: I) -> Result<Self, StoreError>
    where
        I: IntoIterator<Item = T>,
        T: Into<AggregateType>,
    {
        let mut registry = Self::new();
        for tag in tags {
            let tag = tag.into();
            let config = StorageConfig::new(&tag, format!("{tag}_events"));
            registry.register(tag, config)?;
        }
        Ok(registry)
    }

    /// Register or replace the storage of one type.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidTableName`] unless the table is a
    /// lowercase identifier with an optional `schema.` prefix.
    pub fn register(&mut self, tag: AggregateType, config: StorageConfig) -> Result<(), StoreError> {
        if !is_valid_table_name(&config.table) {
            return Err(StoreError::InvalidTableName(config.table));
        }
        tracing::debug!(aggregate_type = %tag, table = %config.table, "Registered aggregate type");
        self.types.insert(tag, config);
        Ok(())
    }

    /// The storage of `tag`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownAggregateType`] if `tag` was never registered.
    pub fn resolve(&self, tag: &AggregateType) -> Result<&StorageConfig, StoreError> {
        self.types
            .get(tag)
            .ok_or_else(|| StoreError::UnknownAggregateType(tag.to_string()))
    }

    /// Registered types with their storage, ordered by tag.
    pub fn entries(&self) -> impl Iterator<Item = (&AggregateType, &StorageConfig)> {
        self.types.iter()
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

fn is_valid_table_name(table: &str) -> bool {
    match table.split_once('.') {
        Some((schema, name)) => is_identifier(schema) && is_identifier(name),
        None => is_identifier(table),
    }
}

fn is_identifier(part: &str) -> bool {
    let mut chars = part.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    part.len() <= MAX_IDENTIFIER_LEN
        && (first.is_ascii_lowercase() || first == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_use_tag_events_table() {
        let registry = AggregateRegistry::with_defaults(["device", "order"]).unwrap();
        let config = registry.resolve(&AggregateType::from("device")).unwrap();
        assert_eq!(config.table, "device_events");
        assert_eq!(config.cache_namespace, "device");
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn unknown_type_is_an_error() {
        let registry = AggregateRegistry::new();
        let err = registry.resolve(&AggregateType::from("ghost")).unwrap_err();
        assert!(matches!(err, StoreError::UnknownAggregateType(tag) if tag == "ghost"));
    }

    #[test]
    fn schema_qualified_tables_are_accepted() {
        let mut registry = AggregateRegistry::new();
        let tag = AggregateType::from("device");
        let config = StorageConfig::new(&tag, "events.device_events");
        assert!(registry.register(tag, config).is_ok());
    }

    #[test]
    fn injection_attempts_are_rejected() {
        for table in [
            "",
            "Device",
            "1events",
            "device events",
            "device_events; DROP TABLE x",
            "a.b.c",
            ".device",
            "device-events",
        ] {
            let mut registry = AggregateRegistry::new();
            let tag = AggregateType::from("device");
            let result = registry.register(tag.clone(), StorageConfig::new(&tag, table));
            assert!(
                matches!(result, Err(StoreError::InvalidTableName(_))),
                "accepted {table:?}"
            );
        }
    }

    #[test]
    fn overlong_identifier_is_rejected() {
        let table = "a".repeat(MAX_IDENTIFIER_LEN + 1);
        assert!(!is_valid_table_name(&table));
        assert!(is_valid_table_name(&"a".repeat(MAX_IDENTIFIER_LEN)));
    }
}
