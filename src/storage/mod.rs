//! Storage module for block and peer persistence

pub mod persistence;

#[cfg(test)]
pub(crate) mod testing;

pub use persistence::{block_filename, DiskInterface, Storage, StorageConfig, StorageError};
