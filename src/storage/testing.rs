//! In-memory disk for tests of the managers and the event loop

use crate::core::{Block, Transaction};
use crate::network::PeerAddress;
use crate::storage::{DiskInterface, StorageError};
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Default)]
pub struct MemoryDisk {
    pub blocks: Mutex<Vec<Block>>,
    pub peers: Mutex<Vec<PeerAddress>>,
    pub peer_writes: Mutex<usize>,
    pub dumped_transactions: Mutex<Vec<Transaction>>,
}

impl DiskInterface for MemoryDisk {
    fn save_block(&self, block: &Block) -> Result<(), StorageError> {
        self.blocks.lock().unwrap().push(block.clone());
        Ok(())
    }

    fn overwrite_peers(&self, peers: &[PeerAddress]) -> Result<(), StorageError> {
        *self.peers.lock().unwrap() = peers.to_vec();
        *self.peer_writes.lock().unwrap() += 1;
        Ok(())
    }

    fn load_peers(&self) -> Result<Vec<PeerAddress>, StorageError> {
        Ok(self.peers.lock().unwrap().clone())
    }

    fn save_transaction_for_debugging(
        &self,
        transaction: &Transaction,
    ) -> Result<PathBuf, StorageError> {
        self.dumped_transactions
            .lock()
            .unwrap()
            .push(transaction.clone());
        Ok(PathBuf::from(format!("{}.transaction", hex::encode(transaction.hash()))))
    }
}
