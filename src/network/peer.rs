//! Remote peers as seen by the event loop
//!
//! A [`ConnectedRemotePeer`] is the loop's record of one live connection: its
//! address, handshake progress, sync bookkeeping and the outbox its connection
//! task drains. A [`DisconnectedRemotePeer`] is a reconnection candidate.

use crate::core::ValidationError;
use crate::crypto::Hash;
use crate::network::message::{Hello, Message, PeerAddress};
use crate::network::params::{MAX_CONNECTION_ATTEMPTS, TIME_TO_SECOND_CONNECTION_ATTEMPT};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::AbortHandle;

/// Errors of any per-peer operation; each one ends the connection
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Codec error: {0}")]
    Codec(String),
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Connection closed")]
    Closed,
    #[error("Outgoing queue full, peer is not reading")]
    OutboxFull,
    #[error("Protocol violation: {0}")]
    Protocol(String),
    #[error("Connected to ourselves")]
    SelfConnection,
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
    /// The address does not say who dialed whom
    Irrelevant,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Incoming => write!(f, "incoming"),
            Direction::Outgoing => write!(f, "outgoing"),
            Direction::Irrelevant => write!(f, "irrelevant"),
        }
    }
}

/// Identifies one connection for the lifetime of the event loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerToken(pub u64);

impl fmt::Display for PeerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identity of a reconnection candidate
pub type PeerKey = (String, u16, Direction);

/// A peer we may (re)connect to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectedRemotePeer {
    pub host: String,
    pub port: u16,
    pub direction: Direction,
    /// Failed attempts since the last successful handshake
    pub attempts: u32,
    pub next_attempt_time: u64,
}

impl DisconnectedRemotePeer {
    pub fn new(host: impl Into<String>, port: u16, direction: Direction) -> Self {
        Self {
            host: host.into(),
            port,
            direction,
            attempts: 0,
            next_attempt_time: 0,
        }
    }

    pub fn key(&self) -> PeerKey {
        (self.host.clone(), self.port, self.direction)
    }

    /// Register one more failed attempt
    ///
    /// Returns `None` once the attempt budget is exhausted; otherwise the
    /// candidate with its retry delay doubled.
    pub fn with_failed_attempt(mut self, current_time: u64) -> Option<Self> {
        self.attempts += 1;
        if self.attempts > MAX_CONNECTION_ATTEMPTS {
            return None;
        }

        let delay = TIME_TO_SECOND_CONNECTION_ATTEMPT << (self.attempts - 1);
        self.next_attempt_time = current_time + delay;
        Some(self)
    }
}

impl From<PeerAddress> for DisconnectedRemotePeer {
    fn from(address: PeerAddress) -> Self {
        DisconnectedRemotePeer::new(address.host, address.port, address.direction)
    }
}

/// The loop's record of a live connection
#[derive(Debug)]
pub struct ConnectedRemotePeer {
    pub token: PeerToken,
    pub host: String,
    pub port: u16,
    pub direction: Direction,
    /// Carried over from the candidate this connection was made for
    pub attempts: u32,
    pub connected_at: u64,
    pub hello: Option<Hello>,
    outbox: mpsc::Sender<Message>,
    task: Option<AbortHandle>,

    pub last_get_peers: Option<u64>,
    pub waiting_for_inventory: bool,
    /// Blocks asked for with `GetData` and not yet received
    pub requested_blocks: HashSet<Hash>,
    pub last_get_blocks: Option<u64>,
    pub last_empty_inventory: Option<u64>,
    /// Last time the peer answered a sync request
    pub last_progress: u64,
}

impl ConnectedRemotePeer {
    pub fn new(
        token: PeerToken,
        host: impl Into<String>,
        port: u16,
        direction: Direction,
        connected_at: u64,
        outbox: mpsc::Sender<Message>,
    ) -> Self {
        Self {
            token,
            host: host.into(),
            port,
            direction,
            attempts: 0,
            connected_at,
            hello: None,
            outbox,
            task: None,
            last_get_peers: None,
            waiting_for_inventory: false,
            requested_blocks: HashSet::new(),
            last_get_blocks: None,
            last_empty_inventory: None,
            last_progress: connected_at,
        }
    }

    pub fn set_task(&mut self, task: AbortHandle) {
        self.task = Some(task);
    }

    pub fn hello_received(&self) -> bool {
        self.hello.is_some()
    }

    /// Queue a message for the connection task without waiting
    pub fn send(&self, message: Message) -> Result<(), PeerError> {
        log::debug!("{:>15} sending {}", self.host, message.type_name());
        self.outbox.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => PeerError::OutboxFull,
            TrySendError::Closed(_) => PeerError::Closed,
        })
    }

    /// Has the full GetBlocks, Inventory, GetData and Data exchange completed?
    pub fn inventory_batch_handled(&self) -> bool {
        !self.waiting_for_inventory && self.requested_blocks.is_empty()
    }

    /// Whether this peer belongs in the address book
    pub fn is_persistable(&self) -> bool {
        self.direction == Direction::Outgoing && self.hello_received()
    }

    pub fn address(&self) -> PeerAddress {
        PeerAddress::new(self.host.clone(), self.port, self.direction)
    }

    /// Address others can dial, if known
    pub fn dialable_address(&self) -> Option<PeerAddress> {
        match self.direction {
            Direction::Outgoing => Some(self.address()),
            _ => self
                .hello
                .as_ref()
                .and_then(|hello| hello.listening_port)
                .map(|port| PeerAddress::new(self.host.clone(), port, Direction::Outgoing)),
        }
    }

    /// Tear down the connection task; dropping the outbox ends it too
    pub fn close(self) -> Option<DisconnectedRemotePeer> {
        if let Some(task) = &self.task {
            task.abort();
        }

        (self.direction == Direction::Outgoing).then(|| DisconnectedRemotePeer {
            host: self.host,
            port: self.port,
            direction: self.direction,
            attempts: self.attempts,
            next_attempt_time: 0,
        })
    }
}

/// Something a manager wants the event loop to do
#[derive(Debug)]
pub enum PeerRequest {
    Connect(DisconnectedRemotePeer),
    Disconnect(PeerToken, PeerError),
}

/// All live connections plus the requests queued by the managers
#[derive(Debug, Default)]
pub struct Peers {
    connected: HashMap<PeerToken, ConnectedRemotePeer>,
    requests: Vec<PeerRequest>,
}

impl Peers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.connected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connected.is_empty()
    }

    pub fn insert(&mut self, peer: ConnectedRemotePeer) {
        self.connected.insert(peer.token, peer);
    }

    pub fn remove(&mut self, token: PeerToken) -> Option<ConnectedRemotePeer> {
        self.connected.remove(&token)
    }

    pub fn get(&self, token: PeerToken) -> Option<&ConnectedRemotePeer> {
        self.connected.get(&token)
    }

    pub fn get_mut(&mut self, token: PeerToken) -> Option<&mut ConnectedRemotePeer> {
        self.connected.get_mut(&token)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConnectedRemotePeer> {
        self.connected.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ConnectedRemotePeer> {
        self.connected.values_mut()
    }

    /// Peers that completed the handshake
    pub fn active(&self) -> impl Iterator<Item = &ConnectedRemotePeer> {
        self.connected.values().filter(|peer| peer.hello_received())
    }

    pub fn tokens(&self) -> Vec<PeerToken> {
        self.connected.keys().copied().collect()
    }

    /// Whether a connection to `host:port` in `direction` is already open
    pub fn is_connected_to(&self, host: &str, port: u16, direction: Direction) -> bool {
        self.connected
            .values()
            .any(|peer| peer.host == host && peer.port == port && peer.direction == direction)
    }

    /// Send to one peer; failures turn into a disconnect request
    pub fn send_to(&mut self, token: PeerToken, message: Message) {
        let result = match self.connected.get(&token) {
            Some(peer) => peer.send(message),
            None => return,
        };
        if let Err(error) = result {
            self.request_disconnect(token, error);
        }
    }

    pub fn request_connect(&mut self, candidate: DisconnectedRemotePeer) {
        self.requests.push(PeerRequest::Connect(candidate));
    }

    pub fn request_disconnect(&mut self, token: PeerToken, error: PeerError) {
        self.requests.push(PeerRequest::Disconnect(token, error));
    }

    pub fn drain_requests(&mut self) -> Vec<PeerRequest> {
        std::mem::take(&mut self.requests)
    }
}
