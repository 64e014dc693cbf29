//! Block synchronization
//!
//! The chain manager owns the [`CoinState`] and runs a two-state machine.
//! During initial block download (IBD) it pulls blocks from at most
//! [`MAX_IBD_PEERS`] peers, preferring those that claim the highest head. Peers
//! that stall are dropped, peers with nothing new are released. Once the head
//! is recent it asks every peer for inventory on a timer and relays new heads.
//!
//! Blocks from peers are always fully validated.

use crate::core::{
    validate_non_coinbase_transaction_by_itself, validate_non_coinbase_transaction_in_coinstate,
    Block, BlockError, BlockOutcome, CoinState, Transaction, ValidationError, ValidationLevel,
};
use crate::crypto::{short_hex, Hash, NULL_HASH};
use crate::network::message::{DataPayload, InventoryItem, InventoryKind, Message};
use crate::network::params::{
    ACTIVE_MODE_GET_BLOCKS_INTERVAL, EMPTY_INVENTORY_BACKOFF, GET_BLOCKS_INVENTORY_SIZE,
    IBD_PEER_TIMEOUT, MAX_IBD_PEERS, SWITCH_TO_ACTIVE_MODE_TIMEOUT,
};
use crate::network::peer::{ConnectedRemotePeer, PeerError, PeerToken, Peers};
use crate::storage::DiskInterface;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Initial block download
    Ibd,
    Active,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Ibd => write!(f, "IBD"),
            SyncMode::Active => write!(f, "active"),
        }
    }
}

fn backing_off(peer: &ConnectedRemotePeer, current_time: u64) -> bool {
    peer.last_empty_inventory
        .map_or(false, |last| current_time.saturating_sub(last) < EMPTY_INVENTORY_BACKOFF)
}

fn peer_mut(peers: &mut Peers, token: PeerToken) -> Result<&mut ConnectedRemotePeer, PeerError> {
    peers
        .get_mut(token)
        .ok_or_else(|| PeerError::Internal(format!("unknown peer {}", token)))
}

pub struct ChainManager {
    coinstate: CoinState,
    storage: Arc<dyn DiskInterface>,
    mode: SyncMode,
    ibd_peers: HashSet<PeerToken>,
    transaction_pool: HashMap<Hash, Transaction>,
}

impl ChainManager {
    pub fn new(coinstate: CoinState, storage: Arc<dyn DiskInterface>, current_time: u64) -> Self {
        let mode = Self::mode_for(&coinstate, current_time);
        log::info!("Chain manager starting in {} mode", mode);
        Self {
            coinstate,
            storage,
            mode,
            ibd_peers: HashSet::new(),
            transaction_pool: HashMap::new(),
        }
    }

    pub fn coinstate(&self) -> &CoinState {
        &self.coinstate
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    pub fn head_height(&self) -> Option<u32> {
        self.coinstate.head().map(|head| head.height)
    }

    pub fn transaction_pool_len(&self) -> usize {
        self.transaction_pool.len()
    }

    fn mode_for(coinstate: &CoinState, current_time: u64) -> SyncMode {
        match coinstate.head() {
            Some(head)
                if current_time.saturating_sub(head.timestamp()) <= SWITCH_TO_ACTIVE_MODE_TIMEOUT =>
            {
                SyncMode::Active
            }
            _ => SyncMode::Ibd,
        }
    }

    pub fn step(&mut self, peers: &mut Peers, current_time: u64) {
        let mode = Self::mode_for(&self.coinstate, current_time);
        if mode != self.mode {
            log::info!("Switching from {} to {} mode", self.mode, mode);
            self.mode = mode;
        }

        match self.mode {
            SyncMode::Ibd => self.step_ibd(peers, current_time),
            SyncMode::Active => {
                self.ibd_peers.clear();
                self.step_active(peers, current_time);
            }
        }
    }

    fn step_ibd(&mut self, peers: &mut Peers, current_time: u64) {
        self.ibd_peers.retain(|token| peers.get(*token).is_some());

        let stalled: Vec<PeerToken> = self
            .ibd_peers
            .iter()
            .copied()
            .filter(|token| {
                peers.get(*token).map_or(false, |peer| {
                    !peer.inventory_batch_handled()
                        && current_time.saturating_sub(peer.last_progress) > IBD_PEER_TIMEOUT
                })
            })
            .collect();
        for token in &stalled {
            self.ibd_peers.remove(token);
            peers.request_disconnect(
                *token,
                PeerError::Protocol("no progress during initial block download".to_string()),
            );
        }

        if self.ibd_peers.len() < MAX_IBD_PEERS {
            let mut available: Vec<(Option<u32>, PeerToken)> = peers
                .active()
                .filter(|peer| {
                    !self.ibd_peers.contains(&peer.token)
                        && !stalled.contains(&peer.token)
                        && !backing_off(peer, current_time)
                })
                .map(|peer| (peer.hello.as_ref().and_then(|hello| hello.head_height), peer.token))
                .collect();
            // Random among peers claiming the same head
            available.sort();
            available.shuffle(&mut rand::thread_rng());
            available.sort_by_key(|(head_height, _)| Reverse(*head_height));

            for (_, token) in available
                .into_iter()
                .take(MAX_IBD_PEERS - self.ibd_peers.len())
            {
                if let Some(peer) = peers.get_mut(token) {
                    log::info!("{:>15} selected for initial block download", peer.host);
                    peer.last_progress = current_time;
                }
                self.ibd_peers.insert(token);
            }
        }

        let tokens: Vec<PeerToken> = self.ibd_peers.iter().copied().collect();
        self.request_blocks_where_idle(peers, tokens, current_time, 0);
    }

    fn step_active(&mut self, peers: &mut Peers, current_time: u64) {
        let tokens: Vec<PeerToken> = peers.active().map(|peer| peer.token).collect();
        self.request_blocks_where_idle(peers, tokens, current_time, ACTIVE_MODE_GET_BLOCKS_INTERVAL);
    }

    /// Send `GetBlocks` to every listed peer that has no batch outstanding
    fn request_blocks_where_idle(
        &self,
        peers: &mut Peers,
        tokens: Vec<PeerToken>,
        current_time: u64,
        interval: u64,
    ) {
        let mut failed = Vec::new();
        for token in tokens {
            let Some(peer) = peers.get_mut(token) else {
                continue;
            };

            let idle = peer.inventory_batch_handled();
            let interval_passed = peer
                .last_get_blocks
                .map_or(true, |last| current_time.saturating_sub(last) >= interval);

            if idle && !backing_off(peer, current_time) && interval_passed {
                if let Err(e) = self.request_blocks(peer, current_time) {
                    failed.push((token, e));
                }
            }
        }

        for (token, error) in failed {
            peers.request_disconnect(token, error);
        }
    }

    fn request_blocks(
        &self,
        peer: &mut ConnectedRemotePeer,
        current_time: u64,
    ) -> Result<(), PeerError> {
        peer.send(Message::GetBlocks {
            start_hashes: self.coinstate.locator_hashes(),
            stop_hash: NULL_HASH,
        })?;
        peer.waiting_for_inventory = true;
        peer.last_get_blocks = Some(current_time);
        Ok(())
    }

    pub fn handle_peer_disconnected(&mut self, token: PeerToken) {
        self.ibd_peers.remove(&token);
    }

    pub fn handle_message(
        &mut self,
        peers: &mut Peers,
        token: PeerToken,
        message: Message,
        current_time: u64,
    ) -> Result<(), PeerError> {
        match message {
            Message::GetBlocks {
                start_hashes,
                stop_hash,
            } => {
                let items = self
                    .coinstate
                    .inventory_after(&start_hashes, &stop_hash, GET_BLOCKS_INVENTORY_SIZE)
                    .into_iter()
                    .map(InventoryItem::block)
                    .collect();
                peer_mut(peers, token)?.send(Message::Inventory(items))
            }
            Message::Inventory(items) => self.handle_inventory(peers, token, items, current_time),
            Message::GetData(item) => self.handle_get_data(peers, token, item),
            Message::Data(DataPayload::Block(block)) => {
                let peer = peer_mut(peers, token)?;
                peer.requested_blocks.remove(&block.hash());
                peer.last_progress = current_time;
                self.handle_block(peers, token, block, current_time)
            }
            Message::Data(DataPayload::Transaction(transaction)) => {
                self.handle_transaction(peers, token, transaction);
                Ok(())
            }
            Message::Hello(_) | Message::GetPeers | Message::Peers(_) => Ok(()),
        }
    }

    fn handle_inventory(
        &mut self,
        peers: &mut Peers,
        token: PeerToken,
        items: Vec<InventoryItem>,
        current_time: u64,
    ) -> Result<(), PeerError> {
        if items.len() > GET_BLOCKS_INVENTORY_SIZE {
            return Err(PeerError::Protocol(format!(
                "inventory of {} items exceeds {}",
                items.len(),
                GET_BLOCKS_INVENTORY_SIZE
            )));
        }

        let coinstate = &self.coinstate;
        let pool = &self.transaction_pool;
        let peer = peer_mut(peers, token)?;
        peer.waiting_for_inventory = false;
        peer.last_progress = current_time;

        let mut requested = 0;
        for item in items {
            let wanted = match item.kind {
                InventoryKind::Block => {
                    !coinstate.contains(&item.hash) && peer.requested_blocks.insert(item.hash)
                }
                InventoryKind::Transaction => !pool.contains_key(&item.hash),
            };
            if wanted {
                peer.send(Message::GetData(item))?;
                requested += 1;
            }
        }

        if requested == 0 {
            log::debug!("{:>15} has nothing new for us", peer.host);
            peer.last_empty_inventory = Some(current_time);
            if self.ibd_peers.remove(&token) {
                log::info!("{:>15} released from initial block download", peer.host);
            }
        }
        Ok(())
    }

    fn handle_get_data(
        &self,
        peers: &mut Peers,
        token: PeerToken,
        item: InventoryItem,
    ) -> Result<(), PeerError> {
        let payload = match item.kind {
            InventoryKind::Block => self
                .coinstate
                .get_block(&item.hash)
                .map(|block| DataPayload::Block(block.clone())),
            InventoryKind::Transaction => self
                .transaction_pool
                .get(&item.hash)
                .map(|transaction| DataPayload::Transaction(transaction.clone())),
        };

        let peer = peer_mut(peers, token)?;
        match payload {
            Some(payload) => peer.send(Message::Data(payload)),
            None => {
                log::debug!("{:>15} asked for unknown {}", peer.host, short_hex(&item.hash));
                Ok(())
            }
        }
    }

    fn handle_block(
        &mut self,
        peers: &mut Peers,
        token: PeerToken,
        block: Block,
        current_time: u64,
    ) -> Result<(), PeerError> {
        let hash = block.hash();

        match self.coinstate.add_block(block, current_time) {
            Ok(BlockOutcome::AlreadyKnown) => Ok(()),
            Ok(outcome) => {
                self.block_accepted(&hash, &outcome);
                if outcome.is_new_head() && self.mode == SyncMode::Active {
                    self.announce(peers, InventoryItem::block(hash), Some(token));
                }
                Ok(())
            }
            Err(ValidationError::Block(BlockError::UnknownParent(parent))) => {
                // We are missing history; ask this peer for it
                let peer = peer_mut(peers, token)?;
                log::info!(
                    "{:>15} sent block {} with unknown parent {}",
                    peer.host,
                    short_hex(&hash),
                    parent
                );
                if !peer.waiting_for_inventory {
                    self.request_blocks(peer, current_time)?;
                }
                Ok(())
            }
            Err(e) => Err(PeerError::Validation(e)),
        }
    }

    fn block_accepted(&mut self, hash: &Hash, outcome: &BlockOutcome) {
        if let Some(block) = self.coinstate.get_block(hash) {
            if let Err(e) = self.storage.save_block(block) {
                log::warn!("Could not save block {}: {}", short_hex(hash), e);
            }

            match outcome {
                BlockOutcome::Extended if self.mode == SyncMode::Ibd && block.height % 100 != 0 => {
                    log::debug!("Block {} at height {}", short_hex(hash), block.height)
                }
                BlockOutcome::Forked => {
                    log::info!("Side branch block {} at height {}", short_hex(hash), block.height)
                }
                _ => log::info!("New head {} at height {}", short_hex(hash), block.height),
            }
        }

        self.prune_transaction_pool();
    }

    /// Announce an object to every handshaked peer except its source
    fn announce(&self, peers: &mut Peers, item: InventoryItem, source: Option<PeerToken>) {
        let tokens: Vec<PeerToken> = peers
            .active()
            .map(|peer| peer.token)
            .filter(|token| Some(*token) != source)
            .collect();
        for token in tokens {
            peers.send_to(token, Message::Inventory(vec![item]));
        }
    }

    /// Drop pooled transactions whose inputs are no longer unspent
    fn prune_transaction_pool(&mut self) {
        let unspent = self.coinstate.unspent();
        self.transaction_pool.retain(|_, transaction| {
            transaction
                .inputs
                .iter()
                .all(|input| unspent.contains_key(&input.output_reference))
        });
    }

    fn handle_transaction(&mut self, peers: &mut Peers, token: PeerToken, transaction: Transaction) {
        let hash = transaction.hash();
        if self.transaction_pool.contains_key(&hash) {
            return;
        }

        let result = validate_non_coinbase_transaction_by_itself(&transaction).and_then(|()| {
            validate_non_coinbase_transaction_in_coinstate(
                &transaction,
                self.coinstate.unspent(),
                ValidationLevel::Full,
            )
        });

        let host = peers.get(token).map_or("?", |peer| peer.host.as_str());
        match result {
            Ok(fee) => {
                log::debug!("{:>15} sent transaction {} (fee {})", host, short_hex(&hash), fee);
                self.transaction_pool.insert(hash, transaction);
                self.announce(peers, InventoryItem::transaction(hash), Some(token));
            }
            Err(e) => {
                log::info!("{:>15} sent invalid transaction {}: {}", host, short_hex(&hash), e);
                match self.storage.save_transaction_for_debugging(&transaction) {
                    Ok(path) => log::info!("Transaction saved to {}", path.display()),
                    Err(e) => log::warn!("Could not save transaction: {}", e),
                }
            }
        }
    }

    /// Add a locally produced block and announce it
    pub fn submit_block(
        &mut self,
        peers: &mut Peers,
        block: Block,
        current_time: u64,
    ) -> Result<BlockOutcome, ValidationError> {
        let hash = block.hash();
        let outcome = self.coinstate.add_block(block, current_time)?;

        if outcome != BlockOutcome::AlreadyKnown {
            self.block_accepted(&hash, &outcome);
        }
        if outcome.is_new_head() {
            self.announce(peers, InventoryItem::block(hash), None);
        }
        Ok(outcome)
    }
}
