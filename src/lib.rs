//! pow-node: the peer-to-peer core of a proof-of-work cryptocurrency
//!
//! This crate provides:
//! - Consensus data types and validation (UTXO transactions, secp256k1
//!   signatures, chain-sampling proof of work, difficulty readjustment)
//! - A fork-aware chain state with reorganizations
//! - One-file-per-block storage and a JSON peer address book
//! - A single-threaded networking event loop with peer discovery,
//!   initial block download and block relay
//!
//! # Example
//!
//! ```no_run
//! use pow_node::network::{Node, NodeConfig};
//! use pow_node::storage::{Storage, StorageConfig};
//! use std::sync::Arc;
//!
//! let storage = Arc::new(Storage::new(StorageConfig::default()).unwrap());
//! let coinstate = storage.read_chain_from_disk().unwrap();
//!
//! let node = Node::start(NodeConfig::default(), coinstate, storage).unwrap();
//! println!("{}", node.stats());
//! node.stop();
//! node.join().unwrap();
//! ```

pub mod core;
pub mod crypto;
pub mod network;
pub mod storage;

// Re-export commonly used types
pub use core::{Block, CoinState, Transaction, ValidationError};
pub use crypto::KeyPair;
pub use network::{Node, NodeConfig, NodeStats};
pub use storage::{DiskInterface, Storage, StorageConfig};
