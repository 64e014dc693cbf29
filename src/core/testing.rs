//! Deterministic builders shared by the unit tests
//!
//! Blocks are mined for real at the initial target, which takes a few thousand
//! hash attempts per block.

use crate::core::block::{Block, BlockHeader};
use crate::core::chain_state::CoinState;
use crate::core::consensus::{
    construct_coinbase_transaction, construct_minable_summary, construct_pow_evidence,
    get_transaction_fee, hash_meets_target,
};
use crate::core::transaction::{Input, Output, OutputReference, PublicKey, Signature, Transaction};
use crate::crypto::KeyPair;
use std::sync::OnceLock;

pub const GENESIS_TIMESTAMP: u64 = 1_615_209_942;

/// Spacing between the blocks of [`linear_blocks`]
pub const BLOCK_SPACING: u64 = 120;

pub fn example_key_pair() -> KeyPair {
    KeyPair::from_secret_bytes(&[0x11; 32]).expect("valid secret key")
}

pub fn example_public_key() -> PublicKey {
    PublicKey::from_key_pair(&example_key_pair())
}

/// Mine a block on top of the head of `coinstate`
///
/// Fees of transactions that cannot be priced against the head are left out
/// of the coinbase, so invalid blocks can be built too.
pub fn mine_block(coinstate: &CoinState, transactions: Vec<Transaction>, timestamp: u64) -> Block {
    let height = coinstate.head().map_or(0, |head| head.height + 1);

    let fees: u64 = transactions
        .iter()
        .filter_map(|transaction| get_transaction_fee(transaction, coinstate.unspent()).ok())
        .sum();

    let mut coinbase = construct_coinbase_transaction(
        height,
        &[],
        coinstate.unspent(),
        b"testing".to_vec(),
        example_public_key(),
    )
    .expect("coinbase without fees");
    coinbase.outputs[0].value += fees;

    let mut all_transactions = vec![coinbase];
    all_transactions.extend(transactions);

    for nonce in 0..=u32::MAX {
        let summary = construct_minable_summary(coinstate, &all_transactions, timestamp, nonce)
            .expect("summary on a known head");
        let pow_evidence =
            construct_pow_evidence(coinstate, &summary, height).expect("sample on a known head");
        let header = BlockHeader {
            summary,
            pow_evidence,
        };

        if hash_meets_target(&header.hash(), &header.summary.target) {
            return Block::new(height, header, all_transactions);
        }
    }

    panic!("no nonce meets the target");
}

pub fn example_genesis_block() -> Block {
    static GENESIS: OnceLock<Block> = OnceLock::new();
    GENESIS
        .get_or_init(|| mine_block(&CoinState::empty(), vec![], GENESIS_TIMESTAMP))
        .clone()
}

/// A valid chain of `length` empty blocks, genesis first
pub fn linear_blocks(length: usize) -> Vec<Block> {
    let mut coinstate = CoinState::empty();
    let mut blocks = Vec::with_capacity(length);

    for i in 0..length {
        let block = if i == 0 {
            example_genesis_block()
        } else {
            mine_block(&coinstate, vec![], GENESIS_TIMESTAMP + BLOCK_SPACING * i as u64)
        };
        coinstate
            .add_block_no_validation(block.clone())
            .expect("linear chain");
        blocks.push(block);
    }

    blocks
}

pub fn linear_chain(length: usize) -> CoinState {
    let mut coinstate = CoinState::empty();
    coinstate
        .load_blocks(linear_blocks(length))
        .expect("linear chain");
    coinstate
}

/// Signed transaction moving `amount` of `source` (owned by the example key) back to it
pub fn spend(source: OutputReference, amount: u64) -> Transaction {
    let mut transaction = Transaction::new(
        vec![Input::new(source, Signature::SignableEquivalent)],
        vec![Output::new(amount, example_public_key())],
    );
    transaction.sign(&example_key_pair());
    transaction
}
