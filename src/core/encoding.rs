//! Canonical binary encoding of consensus types
//!
//! Everything that is hashed, size-limited or written to the block directory
//! goes through these helpers so that every node produces identical bytes.
//!
//! Only the derived consensus types are encoded here. For those bincode cannot
//! fail: every sequence reports its length, no size limit is configured and the
//! writer is an in-memory buffer.

use serde::{de::DeserializeOwned, Serialize};

/// Encode a value to its canonical bytes
pub(crate) fn encode<T: Serialize>(value: &T) -> Vec<u8> {
    match bincode::serialize(value) {
        Ok(bytes) => bytes,
        Err(e) => unreachable!("canonical encoding of a consensus type failed: {}", e),
    }
}

/// Canonical encoded size, without allocating the encoding
pub(crate) fn encoded_size<T: Serialize>(value: &T) -> usize {
    match bincode::serialized_size(value) {
        Ok(size) => size as usize,
        Err(e) => unreachable!("canonical size of a consensus type failed: {}", e),
    }
}

/// Decode a value from its canonical bytes
pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode::deserialize(bytes)
}
