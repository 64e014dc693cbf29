//! Peer discovery, reconnection and the address book

use crate::network::message::{Message, PeerAddress};
use crate::network::params::{GET_PEERS_INTERVAL, MAX_CANDIDATES, MAX_CONNECTIONS};
use crate::network::peer::{
    ConnectedRemotePeer, Direction, DisconnectedRemotePeer, PeerError, PeerKey, PeerToken, Peers,
};
use crate::storage::DiskInterface;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// Owns the reconnection candidates and decides when to dial them
pub struct NetworkManager {
    storage: Arc<dyn DiskInterface>,
    candidates: HashMap<PeerKey, DisconnectedRemotePeer>,
    /// Addresses that turned out to be this node
    own_addresses: HashSet<(String, u16)>,
    /// What the address book currently holds
    persisted: BTreeSet<PeerAddress>,
}

impl NetworkManager {
    /// Seed the candidates from the address book and the bootstrap list
    pub fn new(storage: Arc<dyn DiskInterface>, bootstrap: Vec<DisconnectedRemotePeer>) -> Self {
        let stored = match storage.load_peers() {
            Ok(stored) => stored,
            Err(e) => {
                log::warn!("Could not read the address book: {}", e);
                Vec::new()
            }
        };

        let persisted = stored.iter().cloned().collect();

        let mut manager = Self {
            storage,
            candidates: HashMap::new(),
            own_addresses: HashSet::new(),
            persisted,
        };

        for candidate in stored
            .into_iter()
            .map(DisconnectedRemotePeer::from)
            .chain(bootstrap)
        {
            manager.add_candidate(candidate);
        }

        log::info!("Starting with {} peer candidates", manager.candidates.len());
        manager
    }

    pub fn candidates_count(&self) -> usize {
        self.candidates.len()
    }

    pub fn candidates(&self) -> impl Iterator<Item = &DisconnectedRemotePeer> {
        self.candidates.values()
    }

    fn add_candidate(&mut self, candidate: DisconnectedRemotePeer) {
        if self
            .own_addresses
            .contains(&(candidate.host.clone(), candidate.port))
        {
            return;
        }
        self.candidates.entry(candidate.key()).or_insert(candidate);
    }

    /// Like `add_candidate`, for addresses other peers told us about
    fn add_learned_candidate(&mut self, candidate: DisconnectedRemotePeer) {
        if self.candidates.len() >= MAX_CANDIDATES && !self.candidates.contains_key(&candidate.key())
        {
            return;
        }
        self.add_candidate(candidate);
    }

    /// Dial due candidates and ask for peers where it is time to
    pub fn step(&mut self, peers: &mut Peers, current_time: u64) {
        let due: Vec<PeerKey> = self
            .candidates
            .values()
            .filter(|candidate| candidate.next_attempt_time <= current_time)
            .filter(|candidate| !peers.is_connected_to(&candidate.host, candidate.port, candidate.direction))
            .map(DisconnectedRemotePeer::key)
            .collect();

        for key in due {
            if let Some(candidate) = self.candidates.remove(&key) {
                log::debug!("{:>15} connecting (attempt {})", candidate.host, candidate.attempts + 1);
                peers.request_connect(candidate);
            }
        }

        let mut failed = Vec::new();
        for peer in peers.iter_mut().filter(|peer| peer.hello_received()) {
            let due = peer
                .last_get_peers
                .map_or(true, |last| current_time.saturating_sub(last) >= GET_PEERS_INTERVAL);
            if !due {
                continue;
            }

            peer.last_get_peers = Some(current_time);
            if let Err(e) = peer.send(Message::GetPeers) {
                failed.push((peer.token, e));
            }
        }

        for (token, error) in failed {
            peers.request_disconnect(token, error);
        }
    }

    /// A connection attempt did not get through
    pub fn handle_connect_failed(&mut self, candidate: DisconnectedRemotePeer, current_time: u64) {
        let host = candidate.host.clone();
        match candidate.with_failed_attempt(current_time) {
            Some(candidate) => {
                log::debug!(
                    "{:>15} retrying in {}s",
                    host,
                    candidate.next_attempt_time.saturating_sub(current_time)
                );
                self.add_candidate(candidate);
            }
            None => log::info!("{:>15} giving up after too many attempts", host),
        }
    }

    /// The peer completed the handshake
    pub fn handle_hello(&mut self, peers: &mut Peers, token: PeerToken) {
        let Some(peer) = peers.get_mut(token) else {
            return;
        };
        peer.attempts = 0;

        match peer.direction {
            Direction::Incoming => {
                let listening_port = peer.hello.as_ref().and_then(|hello| hello.listening_port);
                if let Some(port) = listening_port {
                    let host = peer.host.clone();
                    if !peers.is_connected_to(&host, port, Direction::Outgoing) {
                        self.add_candidate(DisconnectedRemotePeer::new(host, port, Direction::Outgoing));
                    }
                }
            }
            _ => self.update_address_book(peers),
        }
    }

    /// The loop dropped the connection
    pub fn handle_peer_disconnected(
        &mut self,
        peers: &Peers,
        peer: ConnectedRemotePeer,
        error: &PeerError,
        current_time: u64,
    ) {
        let was_persistable = peer.is_persistable();
        let address = (peer.host.clone(), peer.port);
        let candidate = peer.close();

        if matches!(error, PeerError::SelfConnection) {
            if candidate.is_some() {
                log::info!("{:>15} is ourselves, forgetting port {}", address.0, address.1);
                self.candidates.retain(|(host, port, _), _| (host, port) != (&address.0, &address.1));
                self.own_addresses.insert(address);
            }
        } else if let Some(candidate) = candidate {
            self.handle_connect_failed(candidate, current_time);
        }

        if was_persistable {
            self.update_address_book(peers);
        }
    }

    pub fn handle_message(
        &mut self,
        peers: &mut Peers,
        token: PeerToken,
        message: &Message,
    ) -> Result<(), PeerError> {
        match message {
            Message::GetPeers => {
                let addresses: Vec<PeerAddress> = peers
                    .active()
                    .filter(|peer| peer.token != token)
                    .filter_map(ConnectedRemotePeer::dialable_address)
                    .collect();
                let peer = peers
                    .get(token)
                    .ok_or_else(|| PeerError::Internal(format!("unknown peer {}", token)))?;
                peer.send(Message::Peers(addresses))
            }
            Message::Peers(addresses) => {
                let before = self.candidates.len();
                // A reply never lists more than one node's connections
                for address in addresses.iter().take(MAX_CONNECTIONS) {
                    if address.direction == Direction::Incoming {
                        continue;
                    }
                    if peers.is_connected_to(&address.host, address.port, Direction::Outgoing) {
                        continue;
                    }
                    self.add_learned_candidate(DisconnectedRemotePeer::new(
                        address.host.clone(),
                        address.port,
                        Direction::Outgoing,
                    ));
                }
                log::debug!(
                    "Learned {} new peer candidates",
                    self.candidates.len().saturating_sub(before)
                );
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Rewrite the address book if the set of qualifying peers changed
    fn update_address_book(&mut self, peers: &Peers) {
        let current: BTreeSet<PeerAddress> = peers
            .iter()
            .filter(|peer| peer.is_persistable())
            .map(ConnectedRemotePeer::address)
            .collect();

        if current == self.persisted {
            return;
        }

        let list: Vec<PeerAddress> = current.iter().cloned().collect();
        match self.storage.overwrite_peers(&list) {
            Ok(()) => self.persisted = current,
            Err(e) => log::warn!("Could not write the address book: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::Hello;
    use crate::network::peer::tests::test_peer;
    use crate::network::peer::PeerRequest;
    use crate::storage::testing::MemoryDisk;

    fn manager_with(disk: Arc<MemoryDisk>, bootstrap: &[(&str, u16)]) -> NetworkManager {
        let bootstrap = bootstrap
            .iter()
            .map(|(host, port)| DisconnectedRemotePeer::new(*host, *port, Direction::Outgoing))
            .collect();
        NetworkManager::new(disk, bootstrap)
    }

    fn connect_requests(peers: &mut Peers) -> Vec<DisconnectedRemotePeer> {
        peers
            .drain_requests()
            .into_iter()
            .filter_map(|request| match request {
                PeerRequest::Connect(candidate) => Some(candidate),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_candidates_from_address_book_and_bootstrap() {
        let disk = Arc::new(MemoryDisk::default());
        disk.overwrite_peers(&[PeerAddress::new("10.0.0.1", 2412, Direction::Outgoing)])
            .unwrap();

        let manager = manager_with(disk, &[("10.0.0.2", 2412), ("10.0.0.1", 2412)]);
        assert_eq!(manager.candidates_count(), 2);
    }

    #[test]
    fn test_step_dials_due_candidates_once() {
        let disk = Arc::new(MemoryDisk::default());
        let mut manager = manager_with(disk, &[("10.0.0.2", 2412)]);
        let mut peers = Peers::new();

        manager.step(&mut peers, 100);
        let requests = connect_requests(&mut peers);
        assert_eq!(requests.len(), 1);
        assert_eq!(manager.candidates_count(), 0);

        manager.step(&mut peers, 101);
        assert!(connect_requests(&mut peers).is_empty());

        // Refused: back in the candidate set with a delay
        manager.handle_connect_failed(requests.into_iter().next().unwrap(), 101);
        manager.step(&mut peers, 105);
        assert!(connect_requests(&mut peers).is_empty());
        manager.step(&mut peers, 111);
        assert_eq!(connect_requests(&mut peers).len(), 1);
    }

    #[test]
    fn test_get_peers_sent_periodically() {
        let disk = Arc::new(MemoryDisk::default());
        let mut manager = manager_with(disk, &[]);
        let mut peers = Peers::new();

        let (mut peer, mut rx) = test_peer(1, "10.0.0.1", Direction::Outgoing);
        peer.hello = Some(Hello::new(5, Some(2412), Some(0)));
        peers.insert(peer);

        manager.step(&mut peers, 1000);
        assert_eq!(rx.try_recv().unwrap(), Message::GetPeers);

        manager.step(&mut peers, 1000 + GET_PEERS_INTERVAL - 1);
        assert!(rx.try_recv().is_err());

        manager.step(&mut peers, 1000 + GET_PEERS_INTERVAL);
        assert_eq!(rx.try_recv().unwrap(), Message::GetPeers);
    }

    #[test]
    fn test_address_book_tracks_handshaked_outgoing_peers() {
        let disk = Arc::new(MemoryDisk::default());
        let mut manager = manager_with(disk.clone(), &[]);
        let mut peers = Peers::new();

        let (mut incoming, _rx1) = test_peer(1, "10.0.0.1", Direction::Incoming);
        incoming.hello = Some(Hello::new(5, None, Some(0)));
        peers.insert(incoming);
        manager.handle_hello(&mut peers, PeerToken(1));
        assert_eq!(*disk.peer_writes.lock().unwrap(), 0);

        let (mut outgoing, _rx2) = test_peer(2, "10.0.0.2", Direction::Outgoing);
        outgoing.hello = Some(Hello::new(6, Some(2412), Some(0)));
        peers.insert(outgoing);
        manager.handle_hello(&mut peers, PeerToken(2));
        assert_eq!(
            *disk.peers.lock().unwrap(),
            vec![PeerAddress::new("10.0.0.2", 2412, Direction::Outgoing)]
        );

        let peer = peers.remove(PeerToken(2)).unwrap();
        manager.handle_peer_disconnected(&peers, peer, &PeerError::Closed, 2000);
        assert!(disk.peers.lock().unwrap().is_empty());
        assert_eq!(*disk.peer_writes.lock().unwrap(), 2);

        // Outgoing peers come back as candidates
        assert_eq!(manager.candidates_count(), 1);
    }

    #[test]
    fn test_self_connection_is_never_retried() {
        let disk = Arc::new(MemoryDisk::default());
        let mut manager = manager_with(disk, &[]);
        let mut peers = Peers::new();

        let (peer, _rx) = test_peer(1, "127.0.0.1", Direction::Outgoing);
        manager.handle_peer_disconnected(&peers, peer, &PeerError::SelfConnection, 10);
        assert_eq!(manager.candidates_count(), 0);

        let message = Message::Peers(vec![PeerAddress::new("127.0.0.1", 2412, Direction::Outgoing)]);
        let (asker, _rx2) = test_peer(2, "10.0.0.9", Direction::Incoming);
        peers.insert(asker);
        manager.handle_message(&mut peers, PeerToken(2), &message).unwrap();
        assert_eq!(manager.candidates_count(), 0);
    }

    #[test]
    fn test_incoming_listening_port_becomes_candidate() {
        let disk = Arc::new(MemoryDisk::default());
        let mut manager = manager_with(disk, &[]);
        let mut peers = Peers::new();

        let (mut incoming, _rx) = test_peer(1, "10.0.0.1", Direction::Incoming);
        incoming.hello = Some(Hello::new(5, Some(3000), Some(0)));
        peers.insert(incoming);
        manager.handle_hello(&mut peers, PeerToken(1));

        let candidate = manager.candidates().next().unwrap();
        assert_eq!(candidate.port, 3000);
        assert_eq!(candidate.direction, Direction::Outgoing);
    }

    #[test]
    fn test_get_peers_reply_lists_other_peers() {
        let disk = Arc::new(MemoryDisk::default());
        let mut manager = manager_with(disk, &[]);
        let mut peers = Peers::new();

        let (mut asker, mut asker_rx) = test_peer(1, "10.0.0.1", Direction::Incoming);
        asker.hello = Some(Hello::new(5, None, Some(0)));
        let (mut other, _rx) = test_peer(2, "10.0.0.2", Direction::Outgoing);
        other.hello = Some(Hello::new(6, Some(2412), Some(0)));
        peers.insert(asker);
        peers.insert(other);

        manager
            .handle_message(&mut peers, PeerToken(1), &Message::GetPeers)
            .unwrap();
        assert_eq!(
            asker_rx.try_recv().unwrap(),
            Message::Peers(vec![PeerAddress::new("10.0.0.2", 2412, Direction::Outgoing)])
        );
    }

    #[test]
    fn test_learned_candidates_are_capped() {
        let disk = Arc::new(MemoryDisk::default());
        let mut manager = manager_with(disk.clone(), &[]);
        let mut peers = Peers::new();
        let (mut sender, _rx) = test_peer(1, "10.0.0.1", Direction::Outgoing);
        sender.hello = Some(Hello::new(5, Some(2412), Some(0)));
        peers.insert(sender);

        let mut port = 0u16;
        while manager.candidates_count() < MAX_CANDIDATES {
            let addresses = (0..MAX_CONNECTIONS)
                .map(|_| {
                    port += 1;
                    PeerAddress::new("10.1.0.1", port, Direction::Outgoing)
                })
                .collect();
            manager
                .handle_message(&mut peers, PeerToken(1), &Message::Peers(addresses))
                .unwrap();
        }

        let flood = (1..=u16::MAX)
            .map(|port| PeerAddress::new("10.2.0.1", port, Direction::Outgoing))
            .collect();
        manager
            .handle_message(&mut peers, PeerToken(1), &Message::Peers(flood))
            .unwrap();
        assert_eq!(manager.candidates_count(), MAX_CANDIDATES);
        assert!(manager.candidates().all(|candidate| candidate.host == "10.1.0.1"));

        // Learned addresses never reach the address book by themselves
        assert_eq!(*disk.peer_writes.lock().unwrap(), 0);

        // Peers we were connected to still come back as candidates
        let peer = peers.remove(PeerToken(1)).unwrap();
        manager.handle_peer_disconnected(&peers, peer, &PeerError::Closed, 100);
        assert_eq!(manager.candidates_count(), MAX_CANDIDATES + 1);
    }
}
