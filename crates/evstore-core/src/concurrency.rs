//! Optimistic concurrency validation.
//!
//! Versions are one counter per aggregate, but conflicts are judged per
//! event type: a writer whose expected version is behind the aggregate only
//! conflicts if one of the types it is appending has moved past that
//! version. Two writers appending to different types of the same aggregate
//! therefore never reject each other.
//!
//! These functions are pure. The event log calls them inside its append
//! transaction, with the last versions read in that same transaction.

use evstore_types::{ExpectedVersion, Version};

use crate::error::StoreError;

/// Whether any conflict is possible for this append.
///
/// False when the aggregate has no events or the writer is not behind it.
pub const fn aggregate_conflict(expected: ExpectedVersion, last_version: Option<Version>) -> bool {
    match last_version {
        Some(last) => expected.is_before(last),
        None => false,
    }
}

/// Whether appending to one type conflicts with that type's last version.
pub const fn type_conflict(expected: ExpectedVersion, last_version_of_type: Option<Version>) -> bool {
    match last_version_of_type {
        Some(last) => expected.is_before(last),
        None => false,
    }
}

/// Check every type of a batch.
///
/// `last_of_type` is only consulted when [`aggregate_conflict`] holds.
///
/// # Errors
///
/// Returns [`StoreError::Concurrency`] naming the first conflicting type.
pub fn check_batch<'a, I, F>(
    expected: ExpectedVersion,
    last_version: Option<Version>,
    names: I,
    last_of_type: F,
) -> Result<(), StoreError>
where
    I: IntoIterator<Item = &'a str>,
    F: Fn(&str) -> Option<Version>,
{
    if !aggregate_conflict(expected, last_version) {
        return Ok(());
    }

    for name in names {
        let last = last_of_type(name);
        if let Some(actual) = last.filter(|_| type_conflict(expected, last)) {
            tracing::warn!(
                fully_qualified_name = name,
                %expected,
                actual,
                "Rejected append: concurrency conflict"
            );
            return Err(StoreError::Concurrency {
                fully_qualified_name: name.to_owned(),
                expected,
                actual,
            });
        }
    }

    Ok(())
}
