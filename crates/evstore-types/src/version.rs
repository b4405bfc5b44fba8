//! Version numbers and the caller-declared expected version.

use serde::{Deserialize, Serialize};

/// Per-aggregate monotonic sequence number assigned at append time.
///
/// The first event of an aggregate receives version `0`.
pub type Version = i64;

/// Version reported for an aggregate or key that has no events yet.
pub const NO_VERSION: Version = -1;

/// The version a writer believes the aggregate is at when it appends.
///
/// Compared against the last persisted versions by the concurrency
/// validator. [`ExpectedVersion::NoPriorEvent`] never conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedVersion {
    /// The writer has not observed any prior event.
    NoPriorEvent,
    /// The writer last observed this version.
    At(Version),
}

impl ExpectedVersion {
    /// Return the declared version, if any.
    pub const fn version(self) -> Option<Version> {
        match self {
            Self::NoPriorEvent => None,
            Self::At(version) => Some(version),
        }
    }

    /// Whether `self` falls strictly before `last`.
    ///
    /// `NoPriorEvent` is never before anything.
    pub const fn is_before(self, last: Version) -> bool {
        match self {
            Self::NoPriorEvent => false,
            Self::At(version) => version < last,
        }
    }
}

impl From<Version> for ExpectedVersion {
    fn from(version: Version) -> Self {
        Self::At(version)
    }
}

impl From<Option<Version>> for ExpectedVersion {
    fn from(version: Option<Version>) -> Self {
        version.map_or(Self::NoPriorEvent, Self::At)
    }
}

impl core::fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NoPriorEvent => f.write_str("no prior event"),
            Self::At(version) => write!(f, "{version}"),
        }
    }
}
