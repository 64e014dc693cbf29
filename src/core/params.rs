//! Consensus parameters
//!
//! These values are part of the protocol: changing any of them forks the node
//! off the network.

/// Smallest units per coin
pub const SASHIMI_PER_COIN: u64 = 100_000_000;

/// Exclusive upper bound for the total value of a transaction's outputs
pub const MAX_SASHIMI: u64 = 21_000_000 * SASHIMI_PER_COIN;

/// Subsidy of the blocks before the first halving
pub const INITIAL_SUBSIDY: u64 = 10 * SASHIMI_PER_COIN;

/// Number of blocks between subsidy halvings
pub const SUBSIDY_HALVING_INTERVAL: u32 = 1_050_000;

/// Largest serialized size of a block, and therefore of any transaction; a
/// size equal to it is accepted
pub const MAX_BLOCK_SIZE: usize = 1_000_000;

/// Maximum size of the miner-chosen data in a coinbase input
pub const MAX_COINBASE_RANDOM_DATA_SIZE: usize = 256;

/// Maximum allowed clock drift into the future for a block timestamp (2 hours)
pub const MAX_FUTURE_BLOCK_TIME: u64 = 2 * 60 * 60;

/// Intended average time between blocks (seconds)
pub const DESIRED_BLOCK_TIMESPAN: u64 = 2 * 60;

/// Number of blocks a target stays in force before it is readjusted
pub const BLOCKS_BETWEEN_TARGET_READJUSTMENT: u32 = 1008;

/// A single readjustment never moves the target by more than this factor
pub const MAX_TARGET_READJUSTMENT_FACTOR: u64 = 4;

/// Number of ancestor block hashes a non-genesis header samples as PoW evidence
pub const CHAIN_SAMPLE_COUNT: usize = 10;

/// Version of the block summary layout
pub const SUMMARY_VERSION: u8 = 0;

/// Target of the genesis block; also the easiest target the chain ever accepts.
/// Big-endian: 12 leading zero bits.
pub const INITIAL_TARGET: [u8; 32] = {
    let mut target = [0xff; 32];
    target[0] = 0x00;
    target[1] = 0x0f;
    target
};
