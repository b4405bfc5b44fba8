//! Binary-safe payload codec.
//!
//! Payloads are opaque bytes, but the event log keeps them in a text column
//! and the snapshot cache keeps them inside JSON. Both go through this
//! codec, which renders bytes in the `PostgreSQL` `bytea` hex format: a
//! `\x` prefix followed by two lowercase hex digits per byte. Embedded and
//! trailing NUL bytes survive the round trip.

use crate::error::StoreError;

/// Prefix of the `bytea` hex format.
const HEX_PREFIX: &str = "\\x";

/// Encode bytes as printable text.
pub fn escape(bytes: &[u8]) -> String {
    format!("{HEX_PREFIX}{}", hex::encode(bytes))
}

/// Decode text produced by [`escape`].
///
/// # Errors
///
/// Returns [`StoreError::Codec`] if the prefix is missing or the digits are
/// not valid hex.
pub fn unescape(text: &str) -> Result<Vec<u8>, StoreError> {
    let digits = text
        .strip_prefix(HEX_PREFIX)
        .ok_or_else(|| StoreError::Codec(format!("missing {HEX_PREFIX} prefix in escaped payload")))?;
    hex::decode(digits).map_err(|e| StoreError::Codec(format!("invalid escaped payload: {e}")))
}
