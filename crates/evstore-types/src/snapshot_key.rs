//! The snapshot cache key.
//!
//! A snapshot keeps one entry per `(fully_qualified_name, sub_key)`. The key
//! is rendered as a single hash field name with [`KEY_DELIMITER`] between the
//! two parts.

use serde::{Deserialize, Serialize};

/// Sub-key used when an event does not partition its type any further.
pub const NO_SUB_KEY: &str = "NO_SUB_KEY";

/// Separator between the name and the sub-key in a rendered key.
///
/// ASCII unit separator. Appends reject event types and sub-keys that
/// contain it, so every rendered key splits back into its two parts.
pub const KEY_DELIMITER: char = '\u{1f}';

/// Key of one snapshot entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapshotKey {
    /// Logical event type.
    pub fully_qualified_name: String,
    /// Secondary partition within the type.
    pub sub_key: String,
}

impl SnapshotKey {
    /// Build a key, substituting [`NO_SUB_KEY`] for an absent sub-key.
    pub fn new(fully_qualified_name: impl Into<String>, sub_key: Option<&str>) -> Self {
        Self {
            fully_qualified_name: fully_qualified_name.into(),
            sub_key: sub_key.unwrap_or(NO_SUB_KEY).to_owned(),
        }
    }

    /// Render the key as a cache field name.
    pub fn encode(&self) -> String {
        format!("{}{KEY_DELIMITER}{}", self.fully_qualified_name, self.sub_key)
    }

    /// Parse a rendered field name. Returns `None` if the delimiter is absent.
    pub fn decode(field: &str) -> Option<Self> {
        let (name, sub_key) = field.split_once(KEY_DELIMITER)?;
        Some(Self {
            fully_qualified_name: name.to_owned(),
            sub_key: sub_key.to_owned(),
        })
    }
}

impl core::fmt::Display for SnapshotKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.fully_qualified_name, self.sub_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_sub_key_uses_sentinel() {
        let key = SnapshotKey::new("door_opened", None);
        assert_eq!(key.sub_key, NO_SUB_KEY);
    }

    #[test]
    fn decode_reverses_encode() {
        let key = SnapshotKey::new("zone_event", Some("zone:1"));
        assert_eq!(SnapshotKey::decode(&key.encode()), Some(key));
    }

    #[test]
    fn decode_rejects_undelimited_field() {
        assert_eq!(SnapshotKey::decode("current_version"), None);
    }
}
