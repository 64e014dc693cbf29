//! The networking event loop
//!
//! [`LocalPeer`] is the only writer of peer, network and chain state. Each
//! iteration steps the managers (network first, then chain), waits up to
//! [`POLL_TIMEOUT`] for a new connection, a peer event or a control message,
//! and then handles whatever else is already queued. Connection tasks only
//! move frames between their socket and the loop.
//!
//! Every error raised while handling a peer ends up in [`LocalPeer::disconnect`].

use crate::core::Block;
use crate::network::chain_manager::ChainManager;
use crate::network::message::{Hello, Message};
use crate::network::network_manager::NetworkManager;
use crate::network::params::{ACCEPT_ERROR_BACKOFF, MAX_CONNECTIONS, OUTBOX_CAPACITY, POLL_TIMEOUT};
use crate::network::peer::{
    ConnectedRemotePeer, Direction, DisconnectedRemotePeer, PeerError, PeerRequest, PeerToken,
    Peers,
};
use crate::network::server::{connect_and_handle, handle_connection, PeerEvent};
use crate::network::stats::NodeStats;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

/// Messages from the node handle to the loop
#[derive(Debug)]
pub enum Control {
    /// Add a locally mined block and announce it
    SubmitBlock(Box<Block>),
    /// Interrupt the current wait
    Wake,
}

pub fn current_time() -> u64 {
    chrono::Utc::now().timestamp() as u64
}

/// Accept errors that concern a single connection
fn is_transient_accept_error(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

pub struct LocalPeer {
    /// Identifies this process in hello messages
    nonce: u64,
    listening_port: Option<u16>,
    peers: Peers,
    network_manager: NetworkManager,
    chain_manager: ChainManager,
    next_token: u64,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    running: Arc<AtomicBool>,
    max_connections: usize,
    stats_tx: watch::Sender<NodeStats>,
    last_stats_time: Option<u64>,
    /// Set after an accept error that is not transient
    accept_resume: Option<Instant>,
}

impl LocalPeer {
    pub fn new(
        listening_port: Option<u16>,
        network_manager: NetworkManager,
        chain_manager: ChainManager,
        running: Arc<AtomicBool>,
        stats_tx: watch::Sender<NodeStats>,
        events_tx: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        Self {
            nonce: rand::random(),
            listening_port,
            peers: Peers::new(),
            network_manager,
            chain_manager,
            next_token: 0,
            events_tx,
            running,
            max_connections: MAX_CONNECTIONS,
            stats_tx,
            last_stats_time: None,
            accept_resume: None,
        }
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run until the stop flag is cleared or the control channel closes
    pub async fn run(
        mut self,
        listener: Option<TcpListener>,
        mut events_rx: mpsc::UnboundedReceiver<PeerEvent>,
        mut control_rx: mpsc::UnboundedReceiver<Control>,
    ) {
        self.event_loop(listener.as_ref(), &mut events_rx, &mut control_rx).await;
        log::info!("Networking loop stopped");

        self.shutdown();
    }

    async fn event_loop(
        &mut self,
        listener: Option<&TcpListener>,
        events_rx: &mut mpsc::UnboundedReceiver<PeerEvent>,
        control_rx: &mut mpsc::UnboundedReceiver<Control>,
    ) {
        while self.is_running() {
            let now = current_time();
            self.step_managers(now);
            if !self.is_running() {
                break;
            }

            let accepting_listener = listener.filter(|_| self.accepting());
            let accept = async {
                match accepting_listener {
                    Some(listener) => listener.accept().await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                accepted = accept => match accepted {
                    Ok((stream, address)) => self.handle_accept(stream, address, now),
                    Err(e) => self.handle_accept_error(e),
                },
                Some(event) = events_rx.recv() => self.handle_event(event, now),
                control = control_rx.recv() => self.handle_control(control, now),
                _ = tokio::time::sleep(POLL_TIMEOUT) => {}
            }

            while self.is_running() {
                match events_rx.try_recv() {
                    Ok(event) => self.handle_event(event, current_time()),
                    Err(_) => break,
                }
            }

            self.publish_stats(current_time());
        }
    }

    fn accepting(&self) -> bool {
        self.accept_resume.map_or(true, |resume| Instant::now() >= resume)
    }

    /// Transient errors concern one connection; anything else (such as running
    /// out of file descriptors) pauses accepting for a while
    fn handle_accept_error(&mut self, error: io::Error) {
        if is_transient_accept_error(&error) {
            log::info!("Failed to accept a connection: {}", error);
            return;
        }

        log::warn!(
            "Failed to accept a connection: {}; pausing for {:?}",
            error,
            ACCEPT_ERROR_BACKOFF
        );
        self.accept_resume = Some(Instant::now() + ACCEPT_ERROR_BACKOFF);
    }

    /// Timed work of both managers, in fixed order
    fn step_managers(&mut self, now: u64) {
        self.network_manager.step(&mut self.peers, now);
        self.apply_requests(now);
        if !self.is_running() {
            return;
        }

        self.chain_manager.step(&mut self.peers, now);
        self.apply_requests(now);
    }

    fn apply_requests(&mut self, now: u64) {
        loop {
            let requests = self.peers.drain_requests();
            if requests.is_empty() {
                break;
            }

            for request in requests {
                match request {
                    PeerRequest::Connect(candidate) => self.connect(candidate, now),
                    PeerRequest::Disconnect(token, error) => self.disconnect(token, error, now),
                }
            }
        }
    }

    fn next_token(&mut self) -> PeerToken {
        self.next_token += 1;
        PeerToken(self.next_token)
    }

    fn hello(&self) -> Message {
        Message::Hello(Hello::new(
            self.nonce,
            self.listening_port,
            self.chain_manager.head_height(),
        ))
    }

    /// Track a new connection; its hello goes out first
    fn register(
        &mut self,
        host: String,
        port: u16,
        direction: Direction,
        now: u64,
    ) -> (PeerToken, mpsc::Receiver<Message>) {
        let token = self.next_token();
        let (outbox, outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);
        let peer = ConnectedRemotePeer::new(token, host, port, direction, now, outbox);

        // The outbox is fresh and its receiver alive, so queueing cannot fail
        let _ = peer.send(self.hello());
        self.peers.insert(peer);
        (token, outbox_rx)
    }

    fn connect(&mut self, candidate: DisconnectedRemotePeer, now: u64) {
        if self.peers.len() >= self.max_connections {
            log::debug!("{:>15} not dialed, connection limit reached", candidate.host);
            self.network_manager.handle_connect_failed(candidate, now);
            return;
        }

        let DisconnectedRemotePeer {
            host,
            port,
            attempts,
            ..
        } = candidate;

        let (token, outbox_rx) = self.register(host.clone(), port, Direction::Outgoing, now);
        let task = tokio::spawn(connect_and_handle(
            token,
            host,
            port,
            self.events_tx.clone(),
            outbox_rx,
        ));

        if let Some(peer) = self.peers.get_mut(token) {
            peer.attempts = attempts;
            peer.set_task(task.abort_handle());
        }
    }

    fn handle_accept(&mut self, stream: TcpStream, address: SocketAddr, now: u64) {
        let host = address.ip().to_string();
        if self.peers.len() >= self.max_connections {
            log::info!("{:>15} refused, connection limit reached", host);
            return;
        }

        log::info!("{:>15} connected (incoming)", host);
        let (token, outbox_rx) = self.register(host, address.port(), Direction::Incoming, now);
        let task = tokio::spawn(handle_connection(
            token,
            stream,
            self.events_tx.clone(),
            outbox_rx,
        ));

        if let Some(peer) = self.peers.get_mut(token) {
            peer.set_task(task.abort_handle());
        }
    }

    fn handle_event(&mut self, event: PeerEvent, now: u64) {
        match event {
            PeerEvent::Message { token, message } => {
                if let Err(error) = self.handle_message(token, message, now) {
                    self.disconnect(token, error, now);
                }
            }
            PeerEvent::Closed { token, error } => self.disconnect(token, error, now),
        }
        self.apply_requests(now);
    }

    fn handle_message(
        &mut self,
        token: PeerToken,
        message: Message,
        now: u64,
    ) -> Result<(), PeerError> {
        let Some(peer) = self.peers.get_mut(token) else {
            // Queued before the peer was dropped
            return Ok(());
        };
        log::debug!("{:>15} received {}", peer.host, message.type_name());

        match message {
            Message::Hello(hello) => {
                if peer.hello_received() {
                    return Err(PeerError::Protocol("second hello".to_string()));
                }
                if hello.nonce == self.nonce {
                    return Err(PeerError::SelfConnection);
                }

                log::info!(
                    "{:>15} says hello ({}, {} height {:?})",
                    peer.host,
                    hello.user_agent,
                    peer.direction,
                    hello.head_height
                );
                peer.hello = Some(hello);
                peer.last_progress = now;
                self.network_manager.handle_hello(&mut self.peers, token);
                Ok(())
            }
            message if !peer.hello_received() => Err(PeerError::Protocol(format!(
                "{} before hello",
                message.type_name()
            ))),
            message => {
                self.network_manager
                    .handle_message(&mut self.peers, token, &message)?;
                self.chain_manager
                    .handle_message(&mut self.peers, token, message, now)
            }
        }
    }

    fn handle_control(&mut self, control: Option<Control>, now: u64) {
        match control {
            Some(Control::SubmitBlock(block)) => {
                let hash = block.hash();
                match self.chain_manager.submit_block(&mut self.peers, *block, now) {
                    Ok(outcome) => log::info!(
                        "Submitted block {} accepted: {:?}",
                        hex::encode(hash),
                        outcome
                    ),
                    Err(e) => log::warn!("Submitted block {} rejected: {}", hex::encode(hash), e),
                }
            }
            Some(Control::Wake) => {}
            None => {
                log::info!("Node handle dropped, stopping");
                self.running.store(false, Ordering::SeqCst);
            }
        }
    }

    /// Forget a peer and tell both managers; unknown tokens are ignored
    pub fn disconnect(&mut self, token: PeerToken, error: PeerError, now: u64) {
        let Some(peer) = self.peers.remove(token) else {
            log::debug!("Peer {} already disconnected ({})", token, error);
            return;
        };

        match &error {
            PeerError::Internal(_) => {
                log::warn!("{:>15} disconnected after internal error: {:?}", peer.host, error)
            }
            PeerError::Closed => log::info!("{:>15} closed the connection", peer.host),
            _ => log::info!("{:>15} disconnected: {}", peer.host, error),
        }

        self.chain_manager.handle_peer_disconnected(token);
        self.network_manager
            .handle_peer_disconnected(&self.peers, peer, &error, now);
    }

    fn publish_stats(&mut self, now: u64) {
        if self.last_stats_time == Some(now) {
            return;
        }
        self.last_stats_time = Some(now);
        self.stats_tx.send_replace(NodeStats::collect(
            &self.peers,
            &self.network_manager,
            &self.chain_manager,
        ));
    }

    /// Close every connection; runs once, when the loop exits
    fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        for token in self.peers.tokens() {
            if let Some(peer) = self.peers.remove(token) {
                peer.close();
            }
        }
        self.last_stats_time = None;
        self.publish_stats(current_time());
    }
}
