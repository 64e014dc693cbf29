//! Consensus rules
//!
//! Validation is layered. The `*_by_itself` functions look at a single
//! transaction, header or block without any chain context. The `*_in_coinstate`
//! functions check the same object against the branch it extends: ancestry,
//! difficulty, chain sample, unspent outputs and signatures.
//!
//! Nothing in here mutates state or performs I/O; [`CoinState`] calls into this
//! module before it accepts a block.

use crate::core::block::{Block, BlockHeader, BlockSummary, PowEvidence};
use crate::core::chain_state::CoinState;
use crate::core::params::{
    BLOCKS_BETWEEN_TARGET_READJUSTMENT, CHAIN_SAMPLE_COUNT, DESIRED_BLOCK_TIMESPAN,
    INITIAL_SUBSIDY, INITIAL_TARGET, MAX_BLOCK_SIZE, MAX_COINBASE_RANDOM_DATA_SIZE,
    MAX_FUTURE_BLOCK_TIME, MAX_SASHIMI, MAX_TARGET_READJUSTMENT_FACTOR, SUBSIDY_HALVING_INTERVAL,
    SUMMARY_VERSION,
};
use crate::core::transaction::{
    Input, Output, OutputReference, PublicKey, Signature, Transaction, UnspentOutputs,
};
use crate::crypto::{calculate_merkle_root, sha256, short_hex, verify_signature, Hash, NULL_HASH};
use primitive_types::U256;
use std::collections::HashSet;
use thiserror::Error;

// =============================================================================
// Errors
// =============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    #[error("Unsupported summary version {0}")]
    UnsupportedVersion(u8),
    #[error("Block from the future: timestamp {timestamp} is after {limit}")]
    FromTheFuture { timestamp: u64, limit: u64 },
    #[error("Timestamp {timestamp} is not after the parent's {parent}")]
    TimestampNotAfterParent { timestamp: u64, parent: u64 },
    #[error("Target {actual} does not match the expected target {expected}")]
    WrongTarget { expected: String, actual: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PowError {
    #[error("Summary hash does not match the summary")]
    SummaryHashMismatch,
    #[error("Chain sample has {actual} entries, expected {expected}")]
    ChainSampleLength { expected: usize, actual: usize },
    #[error("Chain sample does not match the branch")]
    ChainSampleMismatch,
    #[error("Block hash {0} exceeds the target")]
    InsufficientWork(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("No inputs")]
    NoInputs,
    #[error("No outputs")]
    NoOutputs,
    #[error("Transaction size {0} exceeds MAX_BLOCK_SIZE")]
    TooLarge(usize),
    #[error("Output reference {0} referenced more than once")]
    DuplicateReference(OutputReference),
    #[error("Null-reference in non-coinbase transaction")]
    NullReference,
    #[error("Non-signature Signature class used in input {0}")]
    NotASignature(usize),
    #[error("Total output out of range")]
    OutputOutOfRange,
    #[error("Output reference {0} does not exist or is already spent")]
    UnknownOutputReference(OutputReference),
    #[error("Signature of input {0} is not valid")]
    InvalidSignature(usize),
    #[error("Overspending: inputs {inputs}, outputs {outputs}")]
    Overspend { inputs: u64, outputs: u64 },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoinbaseError {
    #[error("Coinbase must have exactly 1 input, got {0}")]
    InputCount(usize),
    #[error("Coinbase must create money from thin air (null reference expected)")]
    NotFromThinAir,
    #[error("Coinbase input must hold non-empty CoinbaseData")]
    MissingCoinbaseData,
    #[error("Coinbase data of {0} bytes exceeds MAX_COINBASE_RANDOM_DATA_SIZE")]
    DataTooLarge(usize),
    #[error("Coinbase total output out of range")]
    OutputOutOfRange,
    #[error("Coinbase claims {claimed}, only {allowed} allowed")]
    ExcessiveReward { claimed: u64, allowed: u64 },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("Declared height {declared} does not match height {expected}")]
    HeightMismatch { declared: u32, expected: u32 },
    #[error("Block has no transactions")]
    NoTransactions,
    #[error("Block size {0} exceeds MAX_BLOCK_SIZE")]
    TooLarge(usize),
    #[error("Merkle root does not match the transactions")]
    MerkleRootMismatch,
    #[error("First transaction is not a coinbase")]
    FirstNotCoinbase,
    #[error("Unknown parent block {0}")]
    UnknownParent(String),
    #[error("Genesis block on a non-empty chain")]
    UnexpectedGenesis,
    #[error("Output reference {0} spent twice within the block")]
    DoubleSpend(OutputReference),
    #[error("Total fees overflow")]
    FeeOverflow,
}

/// Any reason a block or transaction is rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid header: {0}")]
    Header(#[from] HeaderError),
    #[error("Invalid proof of work: {0}")]
    Pow(#[from] PowError),
    #[error("Invalid transaction: {0}")]
    Transaction(#[from] TransactionError),
    #[error("Invalid coinbase: {0}")]
    Coinbase(#[from] CoinbaseError),
    #[error("Invalid block: {0}")]
    Block(#[from] BlockError),
}

/// How thoroughly a block is checked against its branch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationLevel {
    Full,
    /// Skips signature checks; used when replaying blocks from local storage
    Reduced,
}

// =============================================================================
// Targets and Work
// =============================================================================

pub fn target_to_u256(target: &Hash) -> U256 {
    U256::from_big_endian(target)
}

pub fn u256_to_target(value: U256) -> Hash {
    let mut target = [0u8; 32];
    value.to_big_endian(&mut target);
    target
}

/// Whether a block hash satisfies the target, both read as big-endian integers
pub fn hash_meets_target(hash: &Hash, target: &Hash) -> bool {
    target_to_u256(hash) <= target_to_u256(target)
}

/// Expected number of hashes needed to meet `target`: 2^256 / (target + 1)
pub fn calc_work(target: &Hash) -> U256 {
    let target = target_to_u256(target);
    match target.checked_add(U256::one()) {
        Some(denominator) => (!target) / denominator + U256::one(),
        None => U256::one(),
    }
}

/// Rescale `target` by the observed over the desired timespan
pub fn readjusted_target(target: &Hash, actual_timespan: u64, desired_timespan: u64) -> Hash {
    let desired_timespan = desired_timespan.max(1);
    let actual_timespan = actual_timespan.clamp(
        desired_timespan / MAX_TARGET_READJUSTMENT_FACTOR,
        desired_timespan * MAX_TARGET_READJUSTMENT_FACTOR,
    );

    let initial = target_to_u256(&INITIAL_TARGET);
    let scaled = (target_to_u256(target) / U256::from(desired_timespan))
        .checked_mul(U256::from(actual_timespan))
        .unwrap_or(initial);

    u256_to_target(scaled.min(initial))
}

/// Target a block at `height` on top of `previous_block_hash` must carry
pub fn expected_target(
    coinstate: &CoinState,
    previous_block_hash: &Hash,
    height: u32,
) -> Result<Hash, BlockError> {
    if height == 0 {
        return Ok(INITIAL_TARGET);
    }

    let parent = coinstate
        .get_block(previous_block_hash)
        .ok_or_else(|| BlockError::UnknownParent(short_hex(previous_block_hash)))?;

    if height % BLOCKS_BETWEEN_TARGET_READJUSTMENT != 0 {
        return Ok(*parent.target());
    }

    let window_start = coinstate
        .block_at_height_on_branch(previous_block_hash, height - BLOCKS_BETWEEN_TARGET_READJUSTMENT)
        .ok_or_else(|| BlockError::UnknownParent(short_hex(previous_block_hash)))?;

    let actual_timespan = parent.timestamp().saturating_sub(window_start.timestamp());
    let desired_timespan =
        DESIRED_BLOCK_TIMESPAN * u64::from(BLOCKS_BETWEEN_TARGET_READJUSTMENT - 1);

    Ok(readjusted_target(
        parent.target(),
        actual_timespan,
        desired_timespan,
    ))
}

// =============================================================================
// Chain Sampling
// =============================================================================

/// Heights (all below `height`) that a block's evidence must sample
pub fn chain_sample_heights(summary_hash: &Hash, height: u32) -> Vec<u32> {
    if height == 0 {
        return Vec::new();
    }

    (0..CHAIN_SAMPLE_COUNT as u32)
        .map(|i| {
            let mut data = [0u8; 36];
            data[..32].copy_from_slice(summary_hash);
            data[32..].copy_from_slice(&i.to_le_bytes());
            (U256::from_big_endian(&sha256(&data)) % U256::from(height)).low_u32()
        })
        .collect()
}

/// The sampled block hashes of the branch ending at `previous_block_hash`
pub fn chain_sample(
    coinstate: &CoinState,
    previous_block_hash: &Hash,
    summary_hash: &Hash,
    height: u32,
) -> Result<Vec<Hash>, BlockError> {
    chain_sample_heights(summary_hash, height)
        .into_iter()
        .map(|sample_height| {
            coinstate
                .block_at_height_on_branch(previous_block_hash, sample_height)
                .map(Block::hash)
                .ok_or_else(|| BlockError::UnknownParent(short_hex(previous_block_hash)))
        })
        .collect()
}

// =============================================================================
// Subsidy and Fees
// =============================================================================

/// Newly minted value allowed in the coinbase at `height`
pub fn get_block_subsidy(height: u32) -> u64 {
    let halvings = height / SUBSIDY_HALVING_INTERVAL;
    if halvings >= 64 {
        return 0;
    }
    INITIAL_SUBSIDY >> halvings
}

/// Sum of referenced outputs minus sum of declared outputs
pub fn get_transaction_fee(
    transaction: &Transaction,
    unspent_transaction_outs: &impl UnspentOutputs,
) -> Result<u64, TransactionError> {
    let mut inputs: u64 = 0;
    for input in &transaction.inputs {
        let output = unspent_transaction_outs
            .get_output(&input.output_reference)
            .ok_or(TransactionError::UnknownOutputReference(input.output_reference))?;
        inputs = inputs
            .checked_add(output.value)
            .ok_or(TransactionError::OutputOutOfRange)?;
    }

    let outputs = transaction
        .total_output()
        .ok_or(TransactionError::OutputOutOfRange)?;

    inputs
        .checked_sub(outputs)
        .ok_or(TransactionError::Overspend { inputs, outputs })
}

fn total_output_in_range(transaction: &Transaction) -> bool {
    matches!(transaction.total_output(), Some(total) if total < MAX_SASHIMI)
}

// =============================================================================
// Validation by itself
// =============================================================================

pub fn validate_non_coinbase_transaction_by_itself(
    transaction: &Transaction,
) -> Result<(), TransactionError> {
    if transaction.inputs.is_empty() {
        return Err(TransactionError::NoInputs);
    }

    if transaction.outputs.is_empty() {
        return Err(TransactionError::NoOutputs);
    }

    let size = transaction.serialized_size();
    if size > MAX_BLOCK_SIZE {
        return Err(TransactionError::TooLarge(size));
    }

    let mut seen = HashSet::with_capacity(transaction.inputs.len());
    for input in &transaction.inputs {
        if !seen.insert(input.output_reference) {
            return Err(TransactionError::DuplicateReference(input.output_reference));
        }
    }

    if transaction
        .inputs
        .iter()
        .any(|input| input.output_reference.is_null())
    {
        return Err(TransactionError::NullReference);
    }

    if let Some(index) = transaction
        .inputs
        .iter()
        .position(|input| !input.signature.is_signature())
    {
        return Err(TransactionError::NotASignature(index));
    }

    if !total_output_in_range(transaction) {
        return Err(TransactionError::OutputOutOfRange);
    }

    Ok(())
}

pub fn validate_coinbase_transaction_by_itself(
    transaction: &Transaction,
) -> Result<(), CoinbaseError> {
    if transaction.inputs.len() != 1 {
        return Err(CoinbaseError::InputCount(transaction.inputs.len()));
    }

    let input = &transaction.inputs[0];
    if !input.output_reference.is_null() {
        return Err(CoinbaseError::NotFromThinAir);
    }

    match &input.signature {
        Signature::CoinbaseData(data) if data.is_empty() => {
            return Err(CoinbaseError::MissingCoinbaseData);
        }
        Signature::CoinbaseData(data) if data.len() > MAX_COINBASE_RANDOM_DATA_SIZE => {
            return Err(CoinbaseError::DataTooLarge(data.len()));
        }
        Signature::CoinbaseData(_) => {}
        _ => return Err(CoinbaseError::MissingCoinbaseData),
    }

    if !total_output_in_range(transaction) {
        return Err(CoinbaseError::OutputOutOfRange);
    }

    Ok(())
}

pub fn validate_block_header_by_itself(
    header: &BlockHeader,
    current_timestamp: u64,
) -> Result<(), ValidationError> {
    let summary = &header.summary;

    if summary.version != SUMMARY_VERSION {
        return Err(HeaderError::UnsupportedVersion(summary.version).into());
    }

    if header.pow_evidence.summary_hash != summary.hash() {
        return Err(PowError::SummaryHashMismatch.into());
    }

    let expected = if summary.previous_block_hash == NULL_HASH {
        0
    } else {
        CHAIN_SAMPLE_COUNT
    };
    let actual = header.pow_evidence.chain_sample.len();
    if actual != expected {
        return Err(PowError::ChainSampleLength { expected, actual }.into());
    }

    let hash = header.hash();
    if !hash_meets_target(&hash, &summary.target) {
        return Err(PowError::InsufficientWork(short_hex(&hash)).into());
    }

    let limit = current_timestamp.saturating_add(MAX_FUTURE_BLOCK_TIME);
    if summary.timestamp > limit {
        return Err(HeaderError::FromTheFuture {
            timestamp: summary.timestamp,
            limit,
        }
        .into());
    }

    Ok(())
}

pub fn validate_block_by_itself(block: &Block, current_timestamp: u64) -> Result<(), ValidationError> {
    // The coinbase marker commits to the height, so a mismatch is caught first
    let coinbase_height = block
        .transactions
        .first()
        .and_then(|transaction| transaction.inputs.first())
        .map(|input| input.output_reference)
        .filter(OutputReference::is_null)
        .map(|reference| reference.index);

    if let Some(expected) = coinbase_height {
        if block.height != expected {
            return Err(BlockError::HeightMismatch {
                declared: block.height,
                expected,
            }
            .into());
        }
    }

    if block.is_genesis() && block.height != 0 {
        return Err(BlockError::HeightMismatch {
            declared: block.height,
            expected: 0,
        }
        .into());
    }

    if block.transactions.is_empty() {
        return Err(BlockError::NoTransactions.into());
    }

    validate_block_header_by_itself(&block.header, current_timestamp)?;

    let size = block.serialized_size();
    if size > MAX_BLOCK_SIZE {
        return Err(BlockError::TooLarge(size).into());
    }

    if block.calculate_merkle_root() != block.header.summary.merkle_root_hash {
        return Err(BlockError::MerkleRootMismatch.into());
    }

    let coinbase = block.coinbase().ok_or(BlockError::FirstNotCoinbase)?;
    validate_coinbase_transaction_by_itself(coinbase)?;

    for transaction in &block.transactions[1..] {
        validate_non_coinbase_transaction_by_itself(transaction)?;
    }

    Ok(())
}

// =============================================================================
// Validation in coinstate
// =============================================================================

/// Check a non-coinbase transaction against an unspent output set; returns its fee
///
/// Assumes the transaction already passed the by-itself checks.
pub fn validate_non_coinbase_transaction_in_coinstate(
    transaction: &Transaction,
    unspent_transaction_outs: &impl UnspentOutputs,
    level: ValidationLevel,
) -> Result<u64, TransactionError> {
    let digest = transaction.signing_digest();

    for (index, input) in transaction.inputs.iter().enumerate() {
        let output = unspent_transaction_outs
            .get_output(&input.output_reference)
            .ok_or(TransactionError::UnknownOutputReference(input.output_reference))?;

        if level == ValidationLevel::Full && !signature_valid(input, output, &digest) {
            return Err(TransactionError::InvalidSignature(index));
        }
    }

    get_transaction_fee(transaction, unspent_transaction_outs)
}

fn signature_valid(input: &Input, output: &Output, digest: &Hash) -> bool {
    match (&input.signature, &output.public_key) {
        (Signature::Secp256k1(signature), PublicKey::Secp256k1(public_key)) => {
            verify_signature(public_key, digest, signature).unwrap_or(false)
        }
        _ => false,
    }
}

/// Check a block against the branch it extends
///
/// Assumes the block already passed [`validate_block_by_itself`].
pub fn validate_block_in_coinstate(
    block: &Block,
    coinstate: &CoinState,
    level: ValidationLevel,
) -> Result<(), ValidationError> {
    let previous_block_hash = block.previous_block_hash();

    if block.is_genesis() {
        if !coinstate.is_empty() {
            return Err(BlockError::UnexpectedGenesis.into());
        }
    } else {
        let parent = coinstate
            .get_block(previous_block_hash)
            .ok_or_else(|| BlockError::UnknownParent(short_hex(previous_block_hash)))?;

        if block.height != parent.height + 1 {
            return Err(BlockError::HeightMismatch {
                declared: block.height,
                expected: parent.height + 1,
            }
            .into());
        }

        if block.timestamp() <= parent.timestamp() {
            return Err(HeaderError::TimestampNotAfterParent {
                timestamp: block.timestamp(),
                parent: parent.timestamp(),
            }
            .into());
        }
    }

    let target = expected_target(coinstate, previous_block_hash, block.height)?;
    if &target != block.target() {
        return Err(HeaderError::WrongTarget {
            expected: hex::encode(target),
            actual: hex::encode(block.target()),
        }
        .into());
    }

    let sample = chain_sample(
        coinstate,
        previous_block_hash,
        &block.header.pow_evidence.summary_hash,
        block.height,
    )?;
    if sample != block.header.pow_evidence.chain_sample {
        return Err(PowError::ChainSampleMismatch.into());
    }

    let (coinbase, transactions) = block
        .transactions
        .split_first()
        .ok_or(BlockError::NoTransactions)?;

    let unspent = coinstate
        .unspent_at(previous_block_hash)
        .ok_or_else(|| BlockError::UnknownParent(short_hex(previous_block_hash)))?;

    let mut spent_in_block = HashSet::new();
    let mut fees: u64 = 0;

    for transaction in transactions {
        for input in &transaction.inputs {
            if !spent_in_block.insert(input.output_reference) {
                return Err(BlockError::DoubleSpend(input.output_reference).into());
            }
        }

        let fee = validate_non_coinbase_transaction_in_coinstate(transaction, &*unspent, level)?;
        fees = fees.checked_add(fee).ok_or(BlockError::FeeOverflow)?;
    }

    let allowed = get_block_subsidy(block.height)
        .checked_add(fees)
        .ok_or(BlockError::FeeOverflow)?;
    let claimed = coinbase
        .total_output()
        .ok_or(CoinbaseError::OutputOutOfRange)?;
    if claimed > allowed {
        return Err(CoinbaseError::ExcessiveReward { claimed, allowed }.into());
    }

    Ok(())
}

// =============================================================================
// Construction
// =============================================================================

pub fn construct_coinbase_transaction(
    height: u32,
    non_coinbase_transactions: &[Transaction],
    unspent_transaction_outs: &impl UnspentOutputs,
    random_data: Vec<u8>,
    public_key: PublicKey,
) -> Result<Transaction, ValidationError> {
    if random_data.is_empty() {
        return Err(CoinbaseError::MissingCoinbaseData.into());
    }

    let mut fees: u64 = 0;
    for transaction in non_coinbase_transactions {
        let fee = get_transaction_fee(transaction, unspent_transaction_outs)?;
        fees = fees
            .checked_add(fee)
            .ok_or(TransactionError::OutputOutOfRange)?;
    }

    let value = get_block_subsidy(height)
        .checked_add(fees)
        .ok_or(TransactionError::OutputOutOfRange)?;

    Ok(Transaction::new(
        vec![Input::new(
            OutputReference::null(height),
            Signature::CoinbaseData(random_data),
        )],
        vec![Output::new(value, public_key)],
    ))
}

/// Summary for a block on top of the current head (or a genesis summary)
pub fn construct_minable_summary(
    coinstate: &CoinState,
    transactions: &[Transaction],
    timestamp: u64,
    nonce: u32,
) -> Result<BlockSummary, BlockError> {
    let (previous_block_hash, height) = match coinstate.head() {
        Some(head) => (head.hash(), head.height + 1),
        None => (NULL_HASH, 0),
    };

    let hashes: Vec<Hash> = transactions.iter().map(Transaction::hash).collect();

    Ok(BlockSummary {
        version: SUMMARY_VERSION,
        previous_block_hash,
        merkle_root_hash: calculate_merkle_root(&hashes),
        timestamp,
        target: expected_target(coinstate, &previous_block_hash, height)?,
        nonce,
    })
}

pub fn construct_pow_evidence(
    coinstate: &CoinState,
    summary: &BlockSummary,
    height: u32,
) -> Result<PowEvidence, BlockError> {
    let summary_hash = summary.hash();
    let chain_sample = chain_sample(
        coinstate,
        &summary.previous_block_hash,
        &summary_hash,
        height,
    )?;

    Ok(PowEvidence {
        summary_hash,
        chain_sample,
    })
}

/// A complete candidate block on top of the head; the miner varies `nonce`
pub fn construct_block_for_mining(
    coinstate: &CoinState,
    transactions: Vec<Transaction>,
    public_key: PublicKey,
    timestamp: u64,
    random_data: Vec<u8>,
    nonce: u32,
) -> Result<Block, ValidationError> {
    let height = coinstate.head().map_or(0, |head| head.height + 1);

    let coinbase = construct_coinbase_transaction(
        height,
        &transactions,
        coinstate.unspent(),
        random_data,
        public_key,
    )?;

    let mut all_transactions = Vec::with_capacity(transactions.len() + 1);
    all_transactions.push(coinbase);
    all_transactions.extend(transactions);

    let summary = construct_minable_summary(coinstate, &all_transactions, timestamp, nonce)?;
    let pow_evidence = construct_pow_evidence(coinstate, &summary, height)?;

    Ok(Block::new(
        height,
        BlockHeader {
            summary,
            pow_evidence,
        },
        all_transactions,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::params::SASHIMI_PER_COIN;
    use crate::core::testing::{
        example_genesis_block, example_key_pair, example_public_key, mine_block, spend,
        GENESIS_TIMESTAMP,
    };
    use crate::core::transaction::UtxoSet;

    fn example_public_key_bytes() -> PublicKey {
        PublicKey::Secp256k1(vec![b'x'; 33])
    }

    fn signed_input(hash_byte: u8, index: u32) -> Input {
        Input::new(
            OutputReference::new([hash_byte; 32], index),
            Signature::Secp256k1(vec![b'y'; 64]),
        )
    }

    fn example_coinbase() -> Transaction {
        construct_coinbase_transaction(
            123,
            &[],
            &UtxoSet::new(),
            b"No need to get all political here".to_vec(),
            example_public_key_bytes(),
        )
        .unwrap()
    }

    // -------------------------------------------------------------------------
    // Subsidy and fees
    // -------------------------------------------------------------------------

    #[test]
    fn test_get_block_subsidy() {
        assert_eq!(get_block_subsidy(0), 10 * SASHIMI_PER_COIN);
        assert_eq!(get_block_subsidy(1_049_999), 10 * SASHIMI_PER_COIN);
        assert_eq!(get_block_subsidy(1_050_000), 5 * SASHIMI_PER_COIN);
        assert_eq!(get_block_subsidy(31_499_999), 1);
        assert_eq!(get_block_subsidy(31_500_000), 0);
        assert_eq!(get_block_subsidy(u32::MAX), 0);
    }

    #[test]
    fn test_get_block_subsidy_non_increasing() {
        let mut previous = get_block_subsidy(0);
        for height in (0..40_000_000u32).step_by(525_000) {
            let subsidy = get_block_subsidy(height);
            assert!(subsidy <= previous);
            previous = subsidy;
        }
    }

    #[test]
    fn test_get_transaction_fee() {
        let previous_transaction_hash = [b'a'; 32];
        let mut unspent = UtxoSet::new();
        unspent.insert(
            OutputReference::new(previous_transaction_hash, 0),
            Output::new(40, example_public_key_bytes()),
        );
        unspent.insert(
            OutputReference::new(previous_transaction_hash, 1),
            Output::new(34, example_public_key_bytes()),
        );

        let transaction = Transaction::new(
            vec![signed_input(b'a', 1)],
            vec![Output::new(30, example_public_key_bytes())],
        );

        assert_eq!(get_transaction_fee(&transaction, &unspent), Ok(4));
    }

    #[test]
    fn test_get_transaction_fee_overspend_and_unknown() {
        let mut unspent = UtxoSet::new();
        unspent.insert(
            OutputReference::new([b'a'; 32], 0),
            Output::new(10, example_public_key_bytes()),
        );

        let overspend = Transaction::new(
            vec![signed_input(b'a', 0)],
            vec![Output::new(11, example_public_key_bytes())],
        );
        assert_eq!(
            get_transaction_fee(&overspend, &unspent),
            Err(TransactionError::Overspend {
                inputs: 10,
                outputs: 11
            })
        );

        let unknown = Transaction::new(
            vec![signed_input(b'b', 0)],
            vec![Output::new(1, example_public_key_bytes())],
        );
        assert!(matches!(
            get_transaction_fee(&unknown, &unspent),
            Err(TransactionError::UnknownOutputReference(_))
        ));
    }

    // -------------------------------------------------------------------------
    // Non-coinbase transactions by themselves
    // -------------------------------------------------------------------------

    #[test]
    fn test_non_coinbase_no_inputs() {
        let transaction = Transaction::new(vec![], vec![Output::new(30, example_public_key_bytes())]);
        assert_eq!(
            validate_non_coinbase_transaction_by_itself(&transaction),
            Err(TransactionError::NoInputs)
        );
    }

    #[test]
    fn test_non_coinbase_no_outputs() {
        let transaction = Transaction::new(vec![signed_input(b'a', 1)], vec![]);
        assert_eq!(
            validate_non_coinbase_transaction_by_itself(&transaction),
            Err(TransactionError::NoOutputs)
        );
    }

    #[test]
    fn test_non_coinbase_max_size() {
        let transaction = Transaction::new(
            vec![signed_input(b'a', 1); 30_000],
            vec![Output::new(30, example_public_key_bytes())],
        );
        assert!(matches!(
            validate_non_coinbase_transaction_by_itself(&transaction),
            Err(TransactionError::TooLarge(_))
        ));
    }

    #[test]
    fn test_non_coinbase_max_total_output() {
        let transaction = Transaction::new(
            vec![signed_input(b'a', 1)],
            vec![Output::new(21_000_000 * SASHIMI_PER_COIN, example_public_key_bytes())],
        );
        assert_eq!(
            validate_non_coinbase_transaction_by_itself(&transaction),
            Err(TransactionError::OutputOutOfRange)
        );
    }

    #[test]
    fn test_non_coinbase_output_overflow_is_out_of_range() {
        let transaction = Transaction::new(
            vec![signed_input(b'a', 1)],
            vec![
                Output::new(u64::MAX, example_public_key_bytes()),
                Output::new(u64::MAX, example_public_key_bytes()),
            ],
        );
        assert_eq!(
            validate_non_coinbase_transaction_by_itself(&transaction),
            Err(TransactionError::OutputOutOfRange)
        );
    }

    #[test]
    fn test_non_coinbase_duplicate_output_references() {
        let transaction = Transaction::new(
            vec![signed_input(b'a', 1); 2],
            vec![Output::new(30, example_public_key_bytes())],
        );
        assert!(matches!(
            validate_non_coinbase_transaction_by_itself(&transaction),
            Err(TransactionError::DuplicateReference(_))
        ));
    }

    #[test]
    fn test_non_coinbase_null_reference() {
        let transaction = Transaction::new(
            vec![Input::new(
                OutputReference::null(0),
                Signature::Secp256k1(vec![b'y'; 64]),
            )],
            vec![Output::new(30, example_public_key_bytes())],
        );
        assert_eq!(
            validate_non_coinbase_transaction_by_itself(&transaction),
            Err(TransactionError::NullReference)
        );
    }

    #[test]
    fn test_non_coinbase_placeholder_signature() {
        let transaction = Transaction::new(
            vec![Input::new(
                OutputReference::new([b'a'; 32], 1),
                Signature::SignableEquivalent,
            )],
            vec![Output::new(30, example_public_key_bytes())],
        );
        assert_eq!(
            validate_non_coinbase_transaction_by_itself(&transaction),
            Err(TransactionError::NotASignature(0))
        );
    }

    #[test]
    fn test_non_coinbase_size_at_the_maximum() {
        let with_key_of = |len: usize| {
            Transaction::new(
                vec![signed_input(b'a', 1)],
                vec![Output::new(30, PublicKey::Secp256k1(vec![b'x'; len]))],
            )
        };
        let overhead = with_key_of(0).serialized_size();

        let at_maximum = with_key_of(MAX_BLOCK_SIZE - overhead);
        assert_eq!(at_maximum.serialized_size(), MAX_BLOCK_SIZE);
        assert_eq!(validate_non_coinbase_transaction_by_itself(&at_maximum), Ok(()));

        let over = with_key_of(MAX_BLOCK_SIZE - overhead + 1);
        assert_eq!(
            validate_non_coinbase_transaction_by_itself(&over),
            Err(TransactionError::TooLarge(MAX_BLOCK_SIZE + 1))
        );
    }

    // -------------------------------------------------------------------------
    // Coinbase by itself
    // -------------------------------------------------------------------------

    #[test]
    fn test_coinbase_valid() {
        assert_eq!(validate_coinbase_transaction_by_itself(&example_coinbase()), Ok(()));
    }

    #[test]
    fn test_coinbase_exactly_one_input() {
        let mut coinbase = example_coinbase();
        coinbase.inputs.push(coinbase.inputs[0].clone());
        assert_eq!(
            validate_coinbase_transaction_by_itself(&coinbase),
            Err(CoinbaseError::InputCount(2))
        );
    }

    #[test]
    fn test_coinbase_must_reference_null() {
        let mut coinbase = example_coinbase();
        coinbase.inputs[0].output_reference = OutputReference::new([b'c'; 32], 4);
        assert_eq!(
            validate_coinbase_transaction_by_itself(&coinbase),
            Err(CoinbaseError::NotFromThinAir)
        );
    }

    #[test]
    fn test_coinbase_must_carry_coinbase_data() {
        let mut coinbase = example_coinbase();
        coinbase.inputs[0].signature = Signature::Secp256k1(vec![b'c'; 64]);
        assert_eq!(
            validate_coinbase_transaction_by_itself(&coinbase),
            Err(CoinbaseError::MissingCoinbaseData)
        );

        coinbase.inputs[0].signature = Signature::SignableEquivalent;
        assert_eq!(
            validate_coinbase_transaction_by_itself(&coinbase),
            Err(CoinbaseError::MissingCoinbaseData)
        );
    }

    #[test]
    fn test_coinbase_data_must_not_be_empty() {
        let mut coinbase = example_coinbase();
        coinbase.inputs[0].signature = Signature::CoinbaseData(Vec::new());
        assert_eq!(
            validate_coinbase_transaction_by_itself(&coinbase),
            Err(CoinbaseError::MissingCoinbaseData)
        );

        coinbase.inputs[0].signature = Signature::CoinbaseData(vec![0]);
        assert_eq!(validate_coinbase_transaction_by_itself(&coinbase), Ok(()));
    }

    #[test]
    fn test_construct_coinbase_refuses_empty_data() {
        let result = construct_coinbase_transaction(
            123,
            &[],
            &UtxoSet::new(),
            Vec::new(),
            example_public_key_bytes(),
        );
        assert_eq!(result, Err(CoinbaseError::MissingCoinbaseData.into()));
    }

    #[test]
    fn test_coinbase_maximum_data_size() {
        let mut coinbase = example_coinbase();
        coinbase.inputs[0].signature =
            Signature::CoinbaseData(vec![b'x'; MAX_COINBASE_RANDOM_DATA_SIZE + 1]);
        assert_eq!(
            validate_coinbase_transaction_by_itself(&coinbase),
            Err(CoinbaseError::DataTooLarge(MAX_COINBASE_RANDOM_DATA_SIZE + 1))
        );

        coinbase.inputs[0].signature =
            Signature::CoinbaseData(vec![b'x'; MAX_COINBASE_RANDOM_DATA_SIZE]);
        assert_eq!(validate_coinbase_transaction_by_itself(&coinbase), Ok(()));
    }

    // -------------------------------------------------------------------------
    // Headers and blocks by themselves
    // -------------------------------------------------------------------------

    #[test]
    fn test_header_no_errors() {
        let block = example_genesis_block();
        assert_eq!(
            validate_block_header_by_itself(&block.header, GENESIS_TIMESTAMP),
            Ok(())
        );
    }

    #[test]
    fn test_header_bad_pow() {
        let mut block = example_genesis_block();
        block.header.summary.nonce = block.header.summary.nonce.wrapping_add(1);
        assert!(matches!(
            validate_block_header_by_itself(&block.header, GENESIS_TIMESTAMP),
            Err(ValidationError::Pow(_))
        ));
    }

    #[test]
    fn test_header_insufficient_work() {
        let mut block = example_genesis_block();
        block.header.summary.target = [0u8; 32];
        block.header.pow_evidence.summary_hash = block.header.summary.hash();
        assert!(matches!(
            validate_block_header_by_itself(&block.header, GENESIS_TIMESTAMP),
            Err(ValidationError::Pow(PowError::InsufficientWork(_)))
        ));
    }

    #[test]
    fn test_header_from_the_future() {
        let block = example_genesis_block();
        let now = block.timestamp() - MAX_FUTURE_BLOCK_TIME - 100;
        assert!(matches!(
            validate_block_header_by_itself(&block.header, now),
            Err(ValidationError::Header(HeaderError::FromTheFuture { .. }))
        ));
    }

    #[test]
    fn test_block_correct() {
        assert_eq!(
            validate_block_by_itself(&example_genesis_block(), GENESIS_TIMESTAMP),
            Ok(())
        );
    }

    #[test]
    fn test_block_mismatched_heights() {
        let mut block = example_genesis_block();
        block.height = 1;
        assert!(matches!(
            validate_block_by_itself(&block, GENESIS_TIMESTAMP),
            Err(ValidationError::Block(BlockError::HeightMismatch { .. }))
        ));
    }

    #[test]
    fn test_block_height_checked_before_anything_else() {
        let mut block = example_genesis_block();
        block.height = 5;
        block.header.summary.nonce = block.header.summary.nonce.wrapping_add(1);
        block.transactions.push(Transaction::new(vec![], vec![]));
        assert!(matches!(
            validate_block_by_itself(&block, 0),
            Err(ValidationError::Block(BlockError::HeightMismatch { .. }))
        ));
    }

    #[test]
    fn test_block_merkle_mismatch() {
        let mut block = example_genesis_block();
        block.transactions[0].outputs[0].value -= 1;
        assert_eq!(
            validate_block_by_itself(&block, GENESIS_TIMESTAMP),
            Err(BlockError::MerkleRootMismatch.into())
        );
    }

    // -------------------------------------------------------------------------
    // Targets and sampling
    // -------------------------------------------------------------------------

    #[test]
    fn test_calc_work() {
        assert_eq!(calc_work(&[0xff; 32]), U256::one());
        let mut half = [0xff; 32];
        half[0] = 0x7f;
        assert_eq!(calc_work(&half), U256::from(2));
        assert_eq!(calc_work(&INITIAL_TARGET), U256::from(4096));
    }

    #[test]
    fn test_readjusted_target_is_clamped() {
        let mut target = [0u8; 32];
        target[4] = 0x10;

        let faster = readjusted_target(&target, 1, 1000);
        assert_eq!(
            target_to_u256(&faster),
            target_to_u256(&target) / U256::from(1000) * U256::from(250)
        );

        let slower = readjusted_target(&target, 1_000_000, 1000);
        assert_eq!(
            target_to_u256(&slower),
            target_to_u256(&target) / U256::from(1000) * U256::from(4000)
        );

        assert_eq!(readjusted_target(&INITIAL_TARGET, 4000, 1000), INITIAL_TARGET);
    }

    #[test]
    fn test_chain_sample_heights_are_below_height() {
        let heights = chain_sample_heights(&[7u8; 32], 5);
        assert_eq!(heights.len(), CHAIN_SAMPLE_COUNT);
        assert!(heights.iter().all(|h| *h < 5));
        assert!(chain_sample_heights(&[7u8; 32], 0).is_empty());
    }

    // -------------------------------------------------------------------------
    // In coinstate
    // -------------------------------------------------------------------------

    #[test]
    fn test_spend_in_coinstate() {
        let mut coinstate = CoinState::empty();
        let genesis = example_genesis_block();
        coinstate.add_block(genesis.clone(), GENESIS_TIMESTAMP).unwrap();

        let source = OutputReference::new(genesis.transactions[0].hash(), 0);
        let transaction = spend(source, 3 * SASHIMI_PER_COIN);

        assert_eq!(
            validate_non_coinbase_transaction_by_itself(&transaction),
            Ok(())
        );
        assert_eq!(
            validate_non_coinbase_transaction_in_coinstate(
                &transaction,
                coinstate.unspent(),
                ValidationLevel::Full
            ),
            Ok(7 * SASHIMI_PER_COIN)
        );

        let block = mine_block(&coinstate, vec![transaction], GENESIS_TIMESTAMP + 120);
        assert_eq!(
            block.transactions[0].total_output(),
            Some(17 * SASHIMI_PER_COIN)
        );
        assert_eq!(
            validate_block_in_coinstate(&block, &coinstate, ValidationLevel::Full),
            Ok(())
        );
    }

    #[test]
    fn test_invalid_signature_in_coinstate() {
        let mut coinstate = CoinState::empty();
        let genesis = example_genesis_block();
        coinstate.add_block(genesis.clone(), GENESIS_TIMESTAMP).unwrap();

        let source = OutputReference::new(genesis.transactions[0].hash(), 0);
        let mut transaction = spend(source, SASHIMI_PER_COIN);
        transaction.outputs[0].value += 1;

        assert_eq!(
            validate_non_coinbase_transaction_in_coinstate(
                &transaction,
                coinstate.unspent(),
                ValidationLevel::Full
            ),
            Err(TransactionError::InvalidSignature(0))
        );
        assert!(validate_non_coinbase_transaction_in_coinstate(
            &transaction,
            coinstate.unspent(),
            ValidationLevel::Reduced
        )
        .is_ok());
    }

    #[test]
    fn test_excessive_coinbase_in_coinstate() {
        let mut coinstate = CoinState::empty();
        coinstate
            .add_block(example_genesis_block(), GENESIS_TIMESTAMP)
            .unwrap();

        let mut block = mine_block(&coinstate, vec![], GENESIS_TIMESTAMP + 120);
        block.transactions[0].outputs[0].value += 1;

        assert!(matches!(
            validate_block_in_coinstate(&block, &coinstate, ValidationLevel::Full),
            Err(ValidationError::Coinbase(CoinbaseError::ExcessiveReward { .. }))
        ));
    }

    #[test]
    fn test_timestamp_must_increase() {
        let mut coinstate = CoinState::empty();
        coinstate
            .add_block(example_genesis_block(), GENESIS_TIMESTAMP)
            .unwrap();

        let block = mine_block(&coinstate, vec![], GENESIS_TIMESTAMP);
        assert!(matches!(
            validate_block_in_coinstate(&block, &coinstate, ValidationLevel::Full),
            Err(ValidationError::Header(HeaderError::TimestampNotAfterParent { .. }))
        ));
    }

    #[test]
    fn test_chain_sample_checked_at_every_level() {
        let mut coinstate = CoinState::empty();
        coinstate
            .add_block(example_genesis_block(), GENESIS_TIMESTAMP)
            .unwrap();

        let mut block = mine_block(&coinstate, vec![], GENESIS_TIMESTAMP + 120);
        block.header.pow_evidence.chain_sample[0] = [9u8; 32];

        for level in [ValidationLevel::Full, ValidationLevel::Reduced] {
            assert_eq!(
                validate_block_in_coinstate(&block, &coinstate, level),
                Err(PowError::ChainSampleMismatch.into())
            );
        }
    }

    #[test]
    fn test_second_genesis_rejected() {
        let mut coinstate = CoinState::empty();
        coinstate
            .add_block(example_genesis_block(), GENESIS_TIMESTAMP)
            .unwrap();

        assert_eq!(
            validate_block_in_coinstate(
                &example_genesis_block(),
                &coinstate,
                ValidationLevel::Full
            ),
            Err(BlockError::UnexpectedGenesis.into())
        );
    }

    #[test]
    fn test_construct_block_for_mining_on_empty_chain() {
        let block = construct_block_for_mining(
            &CoinState::empty(),
            vec![],
            example_public_key(),
            GENESIS_TIMESTAMP,
            b"Political statement goes here".to_vec(),
            0,
        )
        .unwrap();

        assert_eq!(block.height, 0);
        assert!(block.is_genesis());
        assert!(block.header.pow_evidence.chain_sample.is_empty());
        assert_eq!(block.target(), &INITIAL_TARGET);
        assert_eq!(
            block.transactions[0].outputs[0].public_key,
            PublicKey::from_key_pair(&example_key_pair())
        );
    }
}
