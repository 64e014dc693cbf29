//! Core blockchain components
//!
//! This module contains the fundamental building blocks:
//! - Transactions (UTXO model, secp256k1 signatures)
//! - Blocks (summary plus chain-sampling proof of work)
//! - Consensus rules (validation, subsidy, difficulty, block construction)
//! - Chain state (fork-aware block tree with reorganizations)

pub mod block;
pub mod chain_state;
pub mod consensus;
pub(crate) mod encoding;
pub mod params;
pub mod transaction;

#[cfg(test)]
pub(crate) mod testing;

pub use block::{Block, BlockHeader, BlockSummary, PowEvidence};
pub use chain_state::{BlockOutcome, BlockRecord, CoinState, UndoData};
pub use consensus::{
    construct_block_for_mining, construct_coinbase_transaction, construct_minable_summary,
    construct_pow_evidence, get_block_subsidy, get_transaction_fee, validate_block_by_itself,
    validate_block_header_by_itself, validate_block_in_coinstate,
    validate_coinbase_transaction_by_itself, validate_non_coinbase_transaction_by_itself,
    validate_non_coinbase_transaction_in_coinstate, BlockError, CoinbaseError, HeaderError,
    PowError, TransactionError, ValidationError, ValidationLevel,
};
pub use transaction::{
    Input, Output, OutputReference, PublicKey, Signature, Transaction, UnspentOutputs, UtxoSet,
};
