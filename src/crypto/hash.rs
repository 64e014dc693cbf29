//! Cryptographic hashing utilities for the blockchain
//!
//! Provides SHA-256 based hashing used for block hashes, summary hashes,
//! transaction hashes and merkle tree calculations.

use sha2::{Digest, Sha256};

/// A 32-byte digest. Block, summary and transaction identities are all of this shape.
pub type Hash = [u8; 32];

/// The all-zero hash. Marks "no previous block" and coinbase output references.
pub const NULL_HASH: Hash = [0u8; 32];

/// Computes SHA-256 hash of the input data
pub fn sha256(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Computes double SHA-256 hash (SHA-256 of SHA-256)
/// Used for every consensus identity
pub fn double_sha256(data: &[u8]) -> Hash {
    sha256(&sha256(data))
}

/// Short human form of a hash for log lines
pub fn short_hex(hash: &Hash) -> String {
    hex::encode(&hash[..8])
}
