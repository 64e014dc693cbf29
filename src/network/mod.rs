//! P2P Networking module
//!
//! A single event loop ([`local_peer`]) owns all peer, network and chain
//! state. Two managers hang off it:
//! - [`network_manager`]: reconnection candidates, peer exchange, address book
//! - [`chain_manager`]: initial block download, inventory polling, block relay
//!
//! Connections speak length-prefixed JSON frames ([`server::MessageCodec`]).

pub mod chain_manager;
pub mod local_peer;
pub mod message;
pub mod network_manager;
pub mod node;
pub mod params;
pub mod peer;
pub mod server;
pub mod stats;

pub use chain_manager::{ChainManager, SyncMode};
pub use local_peer::{current_time, Control, LocalPeer};
pub use message::{DataPayload, Hello, InventoryItem, InventoryKind, Message, PeerAddress};
pub use network_manager::NetworkManager;
pub use node::{parse_peer_address, Node, NodeConfig, NodeError};
pub use peer::{
    ConnectedRemotePeer, Direction, DisconnectedRemotePeer, PeerError, PeerRequest, PeerToken,
    Peers,
};
pub use server::{connect_to_peer, MessageCodec, PeerEvent};
pub use stats::NodeStats;
