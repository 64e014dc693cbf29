//! Merkle commitment over transaction hashes
//!
//! The block summary commits to its transactions through the root of a
//! binary hash tree built from the transaction hashes, in block order.

use super::hash::{double_sha256, Hash};

fn combine(left: &Hash, right: &Hash) -> Hash {
    let mut data = [0u8; 64];
    data[..32].copy_from_slice(left);
    data[32..].copy_from_slice(right);
    double_sha256(&data)
}

/// Calculate the merkle root from a list of transaction hashes
///
/// An odd node at any level is paired with itself. The root of a single
/// hash is that hash; the root of nothing is the hash of the empty string.
pub fn calculate_merkle_root(hashes: &[Hash]) -> Hash {
    if hashes.is_empty() {
        return double_sha256(b"");
    }

    let mut current_level: Vec<Hash> = hashes.to_vec();

    while current_level.len() > 1 {
        current_level = current_level
            .chunks(2)
            .map(|chunk| match chunk {
                [left, right] => combine(left, right),
                [single] => combine(single, single),
                _ => unreachable!("chunks(2) yields one or two items"),
            })
            .collect();
    }

    current_level[0]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::sha256;

    #[test]
    fn test_merkle_root_single() {
        let hashes = vec![sha256(b"tx1")];
        assert_eq!(calculate_merkle_root(&hashes), hashes[0]);
    }

    #[test]
    fn test_merkle_root_two() {
        let hash1 = sha256(b"tx1");
        let hash2 = sha256(b"tx2");

        let root = calculate_merkle_root(&[hash1, hash2]);

        let mut expected = hash1.to_vec();
        expected.extend_from_slice(&hash2);
        assert_eq!(root, double_sha256(&expected));
    }

    #[test]
    fn test_merkle_root_odd_duplicates_last() {
        let (a, b, c) = (sha256(b"tx1"), sha256(b"tx2"), sha256(b"tx3"));
        assert_eq!(
            calculate_merkle_root(&[a, b, c]),
            calculate_merkle_root(&[a, b, c, c])
        );
    }

    #[test]
    fn test_merkle_root_order_matters() {
        let (a, b) = (sha256(b"tx1"), sha256(b"tx2"));
        assert_ne!(calculate_merkle_root(&[a, b]), calculate_merkle_root(&[b, a]));
    }

    #[test]
    fn test_empty_merkle_root() {
        assert_eq!(calculate_merkle_root(&[]), double_sha256(b""));
    }
}
