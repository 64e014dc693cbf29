//! Chain State Management
//!
//! [`CoinState`] holds every known valid block as a record in an arena keyed
//! by block hash, each record pointing at its parent through the summary's
//! `previous_block_hash`. The canonical chain is the branch whose tip carries
//! the most cumulative work; ties go to the tip that was seen first.
//!
//! Only the canonical head's unspent output set is materialized. Views at other
//! tips are derived on demand by undoing canonical blocks down to the fork
//! point and replaying the branch on a copy.

use crate::core::block::Block;
use crate::core::consensus::{
    calc_work, validate_block_by_itself, validate_block_in_coinstate, BlockError,
    ValidationError, ValidationLevel,
};
use crate::core::transaction::{Output, OutputReference, UtxoSet};
use crate::crypto::{short_hex, Hash, NULL_HASH};
use primitive_types::U256;
use std::borrow::Cow;
use std::collections::HashMap;

/// Number of most recent heights a locator lists one by one
const LOCATOR_DENSE_COUNT: u32 = 10;

/// Data required to undo a block during reorganization
#[derive(Debug, Clone, Default)]
pub struct UndoData {
    /// Outputs consumed by the block, to be restored
    pub spent_outputs: Vec<(OutputReference, Output)>,
    /// Outputs created by the block, to be removed
    pub created: Vec<OutputReference>,
}

/// A block together with what the chain state knows about it
#[derive(Debug, Clone)]
pub struct BlockRecord {
    pub block: Block,
    pub hash: Hash,
    /// Cumulative work from genesis up to and including this block
    pub chain_work: U256,
    undo: UndoData,
}

/// Result of adding a block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    /// The block extended the canonical chain
    Extended,
    /// The block was stored on a side branch
    Forked,
    /// The block's branch overtook the canonical chain
    Reorganized { disconnected: u32, connected: u32 },
    /// The block was already known
    AlreadyKnown,
}

impl BlockOutcome {
    /// Whether the canonical head changed
    pub fn is_new_head(&self) -> bool {
        matches!(
            self,
            BlockOutcome::Extended | BlockOutcome::Reorganized { .. }
        )
    }
}

/// Fork-aware view of every known valid block
#[derive(Debug, Clone, Default)]
pub struct CoinState {
    records: HashMap<Hash, BlockRecord>,
    /// Branch tips in the order they were first seen
    tips: Vec<Hash>,
    /// Canonical chain, indexed by height
    by_height: Vec<Hash>,
    /// Unspent outputs at the canonical head
    unspent: UtxoSet,
}

impl CoinState {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of known blocks across all branches
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.records.contains_key(hash)
    }

    pub fn get_record(&self, hash: &Hash) -> Option<&BlockRecord> {
        self.records.get(hash)
    }

    pub fn get_block(&self, hash: &Hash) -> Option<&Block> {
        self.records.get(hash).map(|record| &record.block)
    }

    fn head_record(&self) -> Option<&BlockRecord> {
        self.by_height.last().and_then(|hash| self.records.get(hash))
    }

    /// The canonical head, `None` while the chain is empty
    pub fn head(&self) -> Option<&Block> {
        self.head_record().map(|record| &record.block)
    }

    pub fn head_hash(&self) -> Option<Hash> {
        self.by_height.last().copied()
    }

    pub fn head_work(&self) -> U256 {
        self.head_record()
            .map_or_else(U256::zero, |record| record.chain_work)
    }

    /// Unspent outputs at the canonical head
    pub fn unspent(&self) -> &UtxoSet {
        &self.unspent
    }

    pub fn is_canonical(&self, hash: &Hash) -> bool {
        self.records
            .get(hash)
            .and_then(|record| self.by_height.get(record.block.height as usize))
            == Some(hash)
    }

    /// Canonical block at `height`
    pub fn block_at_height(&self, height: u32) -> Option<&Block> {
        self.by_height
            .get(height as usize)
            .and_then(|hash| self.get_block(hash))
    }

    /// Ancestor at `height` of the branch ending at `tip` (the tip included)
    pub fn block_at_height_on_branch(&self, tip: &Hash, height: u32) -> Option<&Block> {
        let mut cursor = *tip;
        loop {
            let record = self.records.get(&cursor)?;
            if record.block.height < height {
                return None;
            }
            if self.is_canonical(&cursor) {
                return self.block_at_height(height);
            }
            if record.block.height == height {
                return Some(&record.block);
            }
            cursor = *record.block.previous_block_hash();
        }
    }

    /// Walk from `tip` back to the canonical chain
    ///
    /// Returns the canonical ancestor and the non-canonical blocks above it,
    /// lowest first.
    fn branch_path(&self, tip: &Hash) -> Option<(Hash, Vec<Hash>)> {
        let mut path = Vec::new();
        let mut cursor = *tip;

        while !self.is_canonical(&cursor) {
            let record = self.records.get(&cursor)?;
            path.push(cursor);
            cursor = *record.block.previous_block_hash();
        }

        path.reverse();
        Some((cursor, path))
    }

    /// Unspent outputs as seen from the tip `tip`; the null hash means "before genesis"
    pub fn unspent_at(&self, tip: &Hash) -> Option<Cow<'_, UtxoSet>> {
        if *tip == NULL_HASH {
            return Some(Cow::Owned(UtxoSet::new()));
        }
        if self.head_hash().as_ref() == Some(tip) {
            return Some(Cow::Borrowed(&self.unspent));
        }

        let (ancestor, path) = self.branch_path(tip)?;
        let ancestor_height = self.records.get(&ancestor)?.block.height;

        let mut view = self.unspent.clone();
        for hash in self.by_height[ancestor_height as usize + 1..].iter().rev() {
            undo_block(&mut view, &self.records.get(hash)?.undo);
        }
        for hash in &path {
            apply_block(&mut view, &self.records.get(hash)?.block);
        }

        Some(Cow::Owned(view))
    }

    /// Every non-canonical tip paired with its last common ancestor on the canonical chain
    pub fn forks(&self) -> Vec<(&Block, &Block)> {
        let head = self.head_hash();
        self.tips
            .iter()
            .filter(|tip| Some(**tip) != head)
            .filter_map(|tip| {
                let (ancestor, _) = self.branch_path(tip)?;
                Some((self.get_block(tip)?, self.get_block(&ancestor)?))
            })
            .collect()
    }

    // =========================================================================
    // Adding blocks
    // =========================================================================

    /// Validate fully and add
    pub fn add_block(&mut self, block: Block, current_timestamp: u64) -> Result<BlockOutcome, ValidationError> {
        self.add_block_with_level(block, current_timestamp, ValidationLevel::Full)
    }

    pub fn add_block_with_level(
        &mut self,
        block: Block,
        current_timestamp: u64,
        level: ValidationLevel,
    ) -> Result<BlockOutcome, ValidationError> {
        if self.contains(&block.hash()) {
            return Ok(BlockOutcome::AlreadyKnown);
        }

        validate_block_by_itself(&block, current_timestamp)?;
        validate_block_in_coinstate(&block, self, level)?;

        Ok(self.add_block_no_validation(block)?)
    }

    /// Add a block from a trusted source; only its position in the tree is checked
    pub fn add_block_no_validation(&mut self, block: Block) -> Result<BlockOutcome, BlockError> {
        let hash = block.hash();
        if self.contains(&hash) {
            return Ok(BlockOutcome::AlreadyKnown);
        }

        let previous_block_hash = *block.previous_block_hash();
        let parent_work = if block.is_genesis() {
            if !self.is_empty() {
                return Err(BlockError::UnexpectedGenesis);
            }
            U256::zero()
        } else {
            self.records
                .get(&previous_block_hash)
                .ok_or_else(|| BlockError::UnknownParent(short_hex(&previous_block_hash)))?
                .chain_work
        };
        let chain_work = parent_work.saturating_add(calc_work(block.target()));

        let extends_head = self.head_hash() == Some(previous_block_hash) || self.is_empty();

        let undo = if extends_head {
            apply_block(&mut self.unspent, &block)
        } else {
            let mut view = self
                .unspent_at(&previous_block_hash)
                .ok_or_else(|| BlockError::UnknownParent(short_hex(&previous_block_hash)))?
                .into_owned();
            apply_block(&mut view, &block)
        };

        self.tips.retain(|tip| *tip != previous_block_hash);
        self.tips.push(hash);
        self.records.insert(
            hash,
            BlockRecord {
                block,
                hash,
                chain_work,
                undo,
            },
        );

        if extends_head {
            self.by_height.push(hash);
            return Ok(BlockOutcome::Extended);
        }

        if chain_work > self.head_work() {
            return Ok(self.reorganize(&hash));
        }

        Ok(BlockOutcome::Forked)
    }

    /// Batch-load a trusted, parent-first block sequence
    pub fn load_blocks(&mut self, blocks: impl IntoIterator<Item = Block>) -> Result<(), BlockError> {
        for block in blocks {
            self.add_block_no_validation(block)?;
        }
        Ok(())
    }

    /// Re-validate and add a parent-first sequence read back from local storage
    ///
    /// Blocks at least `skip` heights below the highest one in the sequence get
    /// [`ValidationLevel::Reduced`], except at multiples of `skip`.
    pub fn replay_blocks(
        &mut self,
        blocks: Vec<Block>,
        skip: u32,
        current_timestamp: u64,
    ) -> Result<(), ValidationError> {
        let frontier = blocks.iter().map(|block| block.height).max().unwrap_or(0);
        for block in blocks {
            let level = replay_level(block.height, frontier, skip);
            self.add_block_with_level(block, current_timestamp, level)?;
        }
        Ok(())
    }

    fn reorganize(&mut self, new_tip: &Hash) -> BlockOutcome {
        let Some((ancestor, path)) = self.branch_path(new_tip) else {
            return BlockOutcome::Forked;
        };
        let Some(ancestor_height) = self.records.get(&ancestor).map(|r| r.block.height) else {
            return BlockOutcome::Forked;
        };

        let disconnected_hashes = self.by_height.split_off(ancestor_height as usize + 1);
        for hash in disconnected_hashes.iter().rev() {
            if let Some(record) = self.records.get(hash) {
                undo_block(&mut self.unspent, &record.undo);
            }
        }

        for hash in &path {
            if let Some(record) = self.records.get(hash) {
                apply_block(&mut self.unspent, &record.block);
            }
            self.by_height.push(*hash);
        }

        log::info!(
            "Chain reorganization at height {}: {} blocks disconnected, {} connected, new head {}",
            ancestor_height,
            disconnected_hashes.len(),
            path.len(),
            short_hex(new_tip)
        );

        BlockOutcome::Reorganized {
            disconnected: disconnected_hashes.len() as u32,
            connected: path.len() as u32,
        }
    }

    // =========================================================================
    // Sync support
    // =========================================================================

    /// Block locator for the canonical chain: dense near the head, then
    /// quadratically sparser, always ending at genesis
    pub fn locator_hashes(&self) -> Vec<Hash> {
        let Some(head) = self.head() else {
            return Vec::new();
        };
        let head_height = head.height;

        let mut heights: Vec<u32> = (0..LOCATOR_DENSE_COUNT)
            .filter_map(|offset| head_height.checked_sub(offset))
            .collect();
        heights.extend((4..64u32).filter_map(|i| head_height.checked_sub(i * i)));
        heights.push(0);
        heights.sort_unstable_by(|a, b| b.cmp(a));
        heights.dedup();

        heights
            .into_iter()
            .filter_map(|height| self.by_height.get(height as usize).copied())
            .collect()
    }

    /// Canonical hashes following the first locator hash on the canonical chain
    ///
    /// Starts at genesis when no locator hash is known. Stops after `stop_hash`
    /// or after `max` hashes.
    pub fn inventory_after(&self, locator: &[Hash], stop_hash: &Hash, max: usize) -> Vec<Hash> {
        let start = locator
            .iter()
            .find(|hash| self.is_canonical(hash))
            .and_then(|hash| self.records.get(hash))
            .map_or(0, |record| record.block.height as usize + 1);

        let mut inventory = Vec::new();
        for hash in self.by_height.iter().skip(start).take(max) {
            inventory.push(*hash);
            if hash == stop_hash {
                break;
            }
        }
        inventory
    }
}

/// Apply a block's transactions to `utxos`, returning what is needed to undo it
fn apply_block(utxos: &mut UtxoSet, block: &Block) -> UndoData {
    let mut undo = UndoData::default();

    for transaction in &block.transactions {
        if !transaction.is_coinbase() {
            for input in &transaction.inputs {
                if let Some(output) = utxos.remove(&input.output_reference) {
                    undo.spent_outputs.push((input.output_reference, output));
                }
            }
        }

        for (reference, output) in transaction.output_references() {
            utxos.insert(reference, output.clone());
            undo.created.push(reference);
        }
    }

    undo
}

fn undo_block(utxos: &mut UtxoSet, undo: &UndoData) {
    for reference in undo.created.iter().rev() {
        utxos.remove(reference);
    }
    for (reference, output) in undo.spent_outputs.iter().rev() {
        utxos.insert(*reference, output.clone());
    }
}

/// Validation level for a stored block at `height` when the stored chain reaches `frontier`
fn replay_level(height: u32, frontier: u32, skip: u32) -> ValidationLevel {
    let behind = u64::from(height) + u64::from(skip) <= u64::from(frontier);
    if skip > 0 && behind && height % skip != 0 {
        ValidationLevel::Reduced
    } else {
        ValidationLevel::Full
    }
}
