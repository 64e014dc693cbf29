//! Block implementation for the blockchain
//!
//! A block header is split in two: the *summary* that the miner varies while
//! searching for a nonce, and the *proof-of-work evidence* that binds the
//! summary to a sample of the chain it extends. The block hash is the hash of
//! the evidence.

use crate::core::encoding::{decode, encode, encoded_size};
use crate::core::transaction::Transaction;
use crate::crypto::{calculate_merkle_root, double_sha256, Hash, NULL_HASH};
use serde::{Deserialize, Serialize};

/// The part of the header a miner assembles before the nonce search
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSummary {
    pub version: u8,
    /// Null for the genesis block
    pub previous_block_hash: Hash,
    pub merkle_root_hash: Hash,
    /// Unix timestamp in seconds
    pub timestamp: u64,
    /// Big-endian 256-bit target the block hash must not exceed
    pub target: Hash,
    pub nonce: u32,
}

impl BlockSummary {
    pub fn hash(&self) -> Hash {
        double_sha256(&encode(self))
    }
}

/// Evidence that the miner did the work on top of a specific chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowEvidence {
    pub summary_hash: Hash,
    /// Block hashes of the parent branch at heights derived from `summary_hash`
    pub chain_sample: Vec<Hash>,
}

impl PowEvidence {
    pub fn hash(&self) -> Hash {
        double_sha256(&encode(self))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub summary: BlockSummary,
    pub pow_evidence: PowEvidence,
}

impl BlockHeader {
    /// Block identity; compared against the target as a big-endian integer
    pub fn hash(&self) -> Hash {
        self.pow_evidence.hash()
    }
}

/// A block in the blockchain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Declared height; genesis is 0
    pub height: u32,
    pub header: BlockHeader,
    /// Coinbase first, then the non-coinbase transactions
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(height: u32, header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Self {
            height,
            header,
            transactions,
        }
    }

    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn previous_block_hash(&self) -> &Hash {
        &self.header.summary.previous_block_hash
    }

    pub fn timestamp(&self) -> u64 {
        self.header.summary.timestamp
    }

    pub fn target(&self) -> &Hash {
        &self.header.summary.target
    }

    pub fn is_genesis(&self) -> bool {
        self.header.summary.previous_block_hash == NULL_HASH
    }

    /// Get the coinbase transaction (first transaction)
    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first().filter(|tx| tx.is_coinbase())
    }

    /// Merkle root over the hashes of the contained transactions
    pub fn calculate_merkle_root(&self) -> Hash {
        let hashes: Vec<Hash> = self.transactions.iter().map(Transaction::hash).collect();
        calculate_merkle_root(&hashes)
    }

    pub fn serialize(&self) -> Vec<u8> {
        encode(self)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        decode(bytes)
    }

    pub fn serialized_size(&self) -> usize {
        encoded_size(self)
    }
}
