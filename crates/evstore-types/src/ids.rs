//! Type-safe identifier wrappers around [`String`].
//!
//! An aggregate is identified by the pair `(AggregateId, AggregateType)`.
//! Neither is persisted as its own record: they are routing keys into the
//! event log table and the snapshot cache namespace of that type.

use serde::{Deserialize, Serialize};

/// Generates a newtype wrapper around [`String`] with standard derives.
macro_rules! define_tag {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a string value.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Borrow the inner string.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Return the inner [`String`] value.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

define_tag! {
    /// Identifier of one aggregate (for example a device serial number).
    AggregateId
}

define_tag! {
    /// Tag naming a family of aggregates (for example `device`).
    ///
    /// The tag selects the event log table and the cache namespace through
    /// the aggregate registry.
    AggregateType
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_inner_value() {
        let id = AggregateId::new("device-42");
        assert_eq!(id.to_string(), "device-42");
        assert_eq!(id.as_str(), "device-42");
    }

    #[test]
    fn ids_order_lexically() {
        let mut ids = vec![AggregateId::from("b"), AggregateId::from("a"), AggregateId::from("c")];
        ids.sort();
        let ordered: Vec<&str> = ids.iter().map(AggregateId::as_str).collect();
        assert_eq!(ordered, vec!["a", "b", "c"]);
    }

    #[test]
    fn serializes_transparently() {
        let tag = AggregateType::from("device");
        let json = serde_json::to_string(&tag).unwrap();
        assert_eq!(json, "\"device\"");
    }
}
