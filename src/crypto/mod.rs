//! Cryptographic utilities for the blockchain
//!
//! This module provides:
//! - SHA-256 / double SHA-256 hashing
//! - ECDSA signing and verification (secp256k1)
//! - Merkle root calculation

pub mod hash;
pub mod keys;
pub mod merkle;

pub use hash::{double_sha256, sha256, short_hex, Hash, NULL_HASH};
pub use keys::{verify_signature, KeyError, KeyPair, PUBLIC_KEY_SIZE, SIGNATURE_SIZE};
pub use merkle::calculate_merkle_root;
