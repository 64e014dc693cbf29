//! Disk persistence layer
//!
//! Blocks are written one file per block under the chain directory, named
//! `{height:08}-{hash}` so that a sorted directory listing is a parent-first
//! load order. The peer address book is a JSON array that is rewritten in full
//! through a temporary file and a rename.

use crate::core::{Block, CoinState, Transaction};
use crate::network::params::IBD_VALIDATION_SKIP;
use crate::network::PeerAddress;
use std::fs;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const TEMP_SUFFIX: &str = ".tmp";

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Encoding error: {0}")]
    EncodingError(#[from] bincode::Error),
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// Sub-directory of `data_dir` holding one file per block
    pub chain_dir: String,
    /// File in `data_dir` holding the peer address book
    pub peers_file: String,
    /// Where rejected transactions are dumped
    pub temp_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            chain_dir: "chain".to_string(),
            peers_file: "peers.json".to_string(),
            temp_dir: std::env::temp_dir(),
        }
    }
}

/// What the node needs from the disk; injected so tests can observe it
pub trait DiskInterface: Send + Sync {
    /// Persist an accepted block
    fn save_block(&self, block: &Block) -> Result<(), StorageError>;

    /// Replace the address book; an empty list removes it
    fn overwrite_peers(&self, peers: &[PeerAddress]) -> Result<(), StorageError>;

    /// Read the address book; a missing file is an empty book
    fn load_peers(&self) -> Result<Vec<PeerAddress>, StorageError>;

    /// Dump a transaction that failed validation, returning the file written
    fn save_transaction_for_debugging(
        &self,
        transaction: &Transaction,
    ) -> Result<PathBuf, StorageError>;
}

/// Deterministic file name of a block
pub fn block_filename(block: &Block) -> String {
    format!("{:08}-{}", block.height, hex::encode(block.hash()))
}

/// Write `bytes` to `path` so that readers never observe a partial file
fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let mut temp_name = path.as_os_str().to_owned();
    temp_name.push(TEMP_SUFFIX);
    let temp_path = PathBuf::from(temp_name);

    let mut writer = BufWriter::new(fs::File::create(&temp_path)?);
    writer.write_all(bytes)?;
    writer.flush()?;
    drop(writer);

    fs::rename(&temp_path, path)?;
    Ok(())
}

/// Filesystem-backed storage
pub struct Storage {
    config: StorageConfig,
}

impl Storage {
    /// Create a new storage manager; the chain directory is created if missing
    pub fn new(config: StorageConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(config.data_dir.join(&config.chain_dir))?;
        Ok(Self { config })
    }

    pub fn chain_path(&self) -> PathBuf {
        self.config.data_dir.join(&self.config.chain_dir)
    }

    pub fn peers_path(&self) -> PathBuf {
        self.config.data_dir.join(&self.config.peers_file)
    }

    /// Rebuild the chain state from the block directory
    ///
    /// Stored blocks are validated again; signatures are only checked at
    /// every `IBD_VALIDATION_SKIP`-th height and near the stored head.
    pub fn read_chain_from_disk(&self) -> Result<CoinState, StorageError> {
        let mut paths: Vec<PathBuf> = fs::read_dir(self.chain_path())?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| {
                path.is_file()
                    && !path
                        .to_string_lossy()
                        .ends_with(TEMP_SUFFIX)
            })
            .collect();
        paths.sort();

        let mut blocks = Vec::with_capacity(paths.len());
        for path in &paths {
            let bytes = fs::read(path)?;
            blocks.push(Block::deserialize(&bytes)?);
        }

        let now = chrono::Utc::now().timestamp() as u64;
        let mut coinstate = CoinState::empty();
        coinstate
            .replay_blocks(blocks, IBD_VALIDATION_SKIP, now)
            .map_err(|e| StorageError::InvalidData(e.to_string()))?;

        log::info!(
            "Loaded {} blocks from {}",
            paths.len(),
            self.chain_path().display()
        );
        Ok(coinstate)
    }
}

impl DiskInterface for Storage {
    fn save_block(&self, block: &Block) -> Result<(), StorageError> {
        let path = self.chain_path().join(block_filename(block));
        write_atomically(&path, &block.serialize())
    }

    fn overwrite_peers(&self, peers: &[PeerAddress]) -> Result<(), StorageError> {
        let path = self.peers_path();

        if peers.is_empty() {
            if path.exists() {
                fs::remove_file(&path)?;
            }
            return Ok(());
        }

        write_atomically(&path, &serde_json::to_vec_pretty(peers)?)
    }

    fn load_peers(&self) -> Result<Vec<PeerAddress>, StorageError> {
        let path = self.peers_path();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(fs::File::open(&path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    fn save_transaction_for_debugging(
        &self,
        transaction: &Transaction,
    ) -> Result<PathBuf, StorageError> {
        let path = self
            .config
            .temp_dir
            .join(format!("{}.transaction", hex::encode(transaction.hash())));
        fs::write(&path, transaction.serialize())?;
        Ok(path)
    }
}
