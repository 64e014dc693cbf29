//! Network message types for P2P communication
//!
//! Messages travel as JSON inside the frames produced by
//! [`MessageCodec`](crate::network::server::MessageCodec).

use crate::core::{Block, Transaction};
use crate::crypto::Hash;
use crate::network::params::{PROTOCOL_VERSION, USER_AGENT};
use crate::network::peer::Direction;
use serde::{Deserialize, Serialize};

/// Network message types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// First message on every connection, in both directions
    Hello(Hello),

    /// Ask for the canonical block hashes following the first known locator hash
    GetBlocks {
        start_hashes: Vec<Hash>,
        stop_hash: Hash,
    },

    /// Announce or list known objects
    Inventory(Vec<InventoryItem>),

    /// Request a single object by hash
    GetData(InventoryItem),

    /// Reply to `GetData`
    Data(DataPayload),

    /// Request list of known peers
    GetPeers,

    /// Response with peer addresses
    Peers(Vec<PeerAddress>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub protocol_version: u32,
    /// Random per-process value used to detect connections to ourselves
    pub nonce: u64,
    /// Where the sender accepts connections, if it listens at all
    pub listening_port: Option<u16>,
    pub head_height: Option<u32>,
    pub user_agent: String,
}

impl Hello {
    pub fn new(nonce: u64, listening_port: Option<u16>, head_height: Option<u32>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            nonce,
            listening_port,
            head_height,
            user_agent: USER_AGENT.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InventoryKind {
    Block,
    Transaction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InventoryItem {
    pub kind: InventoryKind,
    pub hash: Hash,
}

impl InventoryItem {
    pub fn block(hash: Hash) -> Self {
        Self {
            kind: InventoryKind::Block,
            hash,
        }
    }

    pub fn transaction(hash: Hash) -> Self {
        Self {
            kind: InventoryKind::Transaction,
            hash,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataPayload {
    Block(Block),
    Transaction(Transaction),
}

/// A dialable peer address, as exchanged in `Peers` and stored in the address book
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
    pub direction: Direction,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16, direction: Direction) -> Self {
        Self {
            host: host.into(),
            port,
            direction,
        }
    }
}

impl Message {
    /// Serialize message to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize message from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    /// Get message type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Hello(_) => "Hello",
            Message::GetBlocks { .. } => "GetBlocks",
            Message::Inventory(_) => "Inventory",
            Message::GetData(_) => "GetData",
            Message::Data(DataPayload::Block(_)) => "Data(Block)",
            Message::Data(DataPayload::Transaction(_)) => "Data(Transaction)",
            Message::GetPeers => "GetPeers",
            Message::Peers(_) => "Peers",
        }
    }
}
