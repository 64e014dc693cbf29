//! Network parameters
//!
//! Times are in seconds unless the type says otherwise.

use std::time::Duration;

/// Default listening port
pub const PORT: u16 = 2412;

/// Version announced in the hello message
pub const PROTOCOL_VERSION: u32 = 0;

/// Magic bytes that open every frame
pub const MAGIC: [u8; 4] = *b"POWN";

/// Delay before the second connection attempt; doubles with each retry
pub const TIME_TO_SECOND_CONNECTION_ATTEMPT: u64 = 10;

/// A candidate is dropped once it has failed this many times (10 * 2^19 s is about 60 days)
pub const MAX_CONNECTION_ATTEMPTS: u32 = 19;

/// Reconnection candidates kept from `Peers` messages; later ones are ignored
pub const MAX_CANDIDATES: usize = 4096;

/// How often each peer is asked for its peers
pub const GET_PEERS_INTERVAL: u64 = 30 * 60;

/// Messages queued for one peer before it counts as not reading; must exceed
/// the `GetData` burst one inventory reply can cause
pub const OUTBOX_CAPACITY: usize = 1024;

/// Largest accepted frame payload
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

/// Number of peers blocks are downloaded from during initial block download
pub const MAX_IBD_PEERS: usize = 1;

/// An IBD peer that makes no progress for this long is disconnected
pub const IBD_PEER_TIMEOUT: u64 = 60;

/// Blocks this far behind the sync frontier get reduced validation, except
/// at multiples of this value
pub const IBD_VALIDATION_SKIP: u32 = 1000;

/// Maximum number of hashes in an inventory reply
pub const GET_BLOCKS_INVENTORY_SIZE: usize = 500;

/// A head older than this puts the node in initial block download
pub const SWITCH_TO_ACTIVE_MODE_TIMEOUT: u64 = 5 * 60;

/// Wait this long before asking a peer for inventory again after an empty reply
pub const EMPTY_INVENTORY_BACKOFF: u64 = 60;

/// Interval between inventory requests to the same peer in active mode
pub const ACTIVE_MODE_GET_BLOCKS_INTERVAL: u64 = 10;

/// Upper bound on a single wait for socket readiness
pub const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Accepting pauses this long after an accept error that is not transient
pub const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Outgoing connections that are not established within this time fail
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum number of tracked connections
#[cfg(windows)]
pub const MAX_CONNECTIONS: usize = 64;
#[cfg(not(windows))]
pub const MAX_CONNECTIONS: usize = 512;

pub const USER_AGENT: &str = concat!("pow-node/", env!("CARGO_PKG_VERSION"));
