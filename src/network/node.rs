//! Node handle
//!
//! [`Node::start`] binds the listening socket, builds the managers and runs
//! the event loop on a dedicated "networking" thread with its own
//! current-thread tokio runtime. The handle stops, joins, feeds locally mined
//! blocks to the loop and exposes the latest statistics.

use crate::core::{Block, CoinState};
use crate::network::chain_manager::ChainManager;
use crate::network::local_peer::{current_time, Control, LocalPeer};
use crate::network::network_manager::NetworkManager;
use crate::network::params::PORT;
use crate::network::peer::{Direction, DisconnectedRemotePeer};
use crate::network::stats::NodeStats;
use crate::storage::{DiskInterface, StorageError};
use std::net::TcpListener as StdTcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Invalid peer address '{0}', expected host:port")]
    InvalidPeerAddress(String),
    #[error("Networking thread panicked")]
    ThreadPanicked,
    #[error("Node is stopped")]
    Stopped,
}

/// Runtime configuration of a node
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Port to listen on; 0 picks a free one
    pub port: u16,
    /// Accept incoming connections at all
    pub listen: bool,
    /// Peers to dial in addition to the address book, as `host:port`
    pub bootstrap_peers: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            port: PORT,
            listen: true,
            bootstrap_peers: Vec::new(),
        }
    }
}

/// Split `host:port`; the port is taken after the last colon
pub fn parse_peer_address(address: &str) -> Result<DisconnectedRemotePeer, NodeError> {
    let invalid = || NodeError::InvalidPeerAddress(address.to_string());
    let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
    let port: u16 = port.parse().map_err(|_| invalid())?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(invalid());
    }
    Ok(DisconnectedRemotePeer::new(host, port, Direction::Outgoing))
}

/// Handle to a running node
pub struct Node {
    running: Arc<AtomicBool>,
    control_tx: mpsc::UnboundedSender<Control>,
    stats_rx: watch::Receiver<NodeStats>,
    listening_port: Option<u16>,
    thread: Option<JoinHandle<()>>,
}

impl Node {
    /// Start networking on a new thread
    pub fn start(
        config: NodeConfig,
        coinstate: CoinState,
        storage: Arc<dyn DiskInterface>,
    ) -> Result<Self, NodeError> {
        let bootstrap = config
            .bootstrap_peers
            .iter()
            .map(|address| parse_peer_address(address))
            .collect::<Result<Vec<_>, _>>()?;

        let listener = if config.listen {
            let listener = StdTcpListener::bind(("0.0.0.0", config.port))?;
            listener.set_nonblocking(true)?;
            Some(listener)
        } else {
            None
        };
        let listening_port = match &listener {
            Some(listener) => Some(listener.local_addr()?.port()),
            None => None,
        };
        if let Some(port) = listening_port {
            log::info!("Listening on port {}", port);
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let running = Arc::new(AtomicBool::new(true));
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (stats_tx, stats_rx) = watch::channel(NodeStats::default());
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let network_manager = NetworkManager::new(storage.clone(), bootstrap);
        let chain_manager = ChainManager::new(coinstate, storage, current_time());
        let local_peer = LocalPeer::new(
            listening_port,
            network_manager,
            chain_manager,
            running.clone(),
            stats_tx,
            events_tx,
        );

        let thread = thread::Builder::new()
            .name("networking".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    let listener = match listener.map(TcpListener::from_std).transpose() {
                        Ok(listener) => listener,
                        Err(e) => {
                            log::error!("Could not register the listening socket: {}", e);
                            return;
                        }
                    };
                    local_peer.run(listener, events_rx, control_rx).await;
                });
            })?;

        Ok(Self {
            running,
            control_tx,
            stats_rx,
            listening_port,
            thread: Some(thread),
        })
    }

    pub fn listening_port(&self) -> Option<u16> {
        self.listening_port
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ask the loop to stop after its current step
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.control_tx.send(Control::Wake);
    }

    /// Wait for the networking thread to finish
    pub fn join(mut self) -> Result<(), NodeError> {
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| NodeError::ThreadPanicked),
            None => Ok(()),
        }
    }

    /// Hand a locally mined block to the loop for validation and relay
    pub fn submit_block(&self, block: Block) -> Result<(), NodeError> {
        self.control_tx
            .send(Control::SubmitBlock(Box::new(block)))
            .map_err(|_| NodeError::Stopped)
    }

    /// Latest statistics snapshot
    pub fn stats(&self) -> NodeStats {
        self.stats_rx.borrow().clone()
    }

    pub fn subscribe_stats(&self) -> watch::Receiver<NodeStats> {
        self.stats_rx.clone()
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.stop();
        }
    }
}
