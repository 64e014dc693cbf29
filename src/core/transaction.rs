//! Transactions
//!
//! A UTXO-style model: every input spends an earlier output identified by an
//! [`OutputReference`], every output locks an amount to a public key. The
//! coinbase transaction is the exception: its single input carries the null
//! reference and miner-chosen data instead of a signature.

use crate::core::encoding::{decode, encode, encoded_size};
use crate::crypto::{double_sha256, short_hex, Hash, KeyPair, NULL_HASH};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// =============================================================================
// Output Reference
// =============================================================================

/// Points at output `index` of the transaction with hash `hash`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutputReference {
    pub hash: Hash,
    pub index: u32,
}

impl OutputReference {
    pub fn new(hash: Hash, index: u32) -> Self {
        Self { hash, index }
    }

    /// The coinbase marker: the null hash, with the block height as index
    pub fn null(height: u32) -> Self {
        Self {
            hash: NULL_HASH,
            index: height,
        }
    }

    /// Whether this is the coinbase marker rather than a real output
    pub fn is_null(&self) -> bool {
        self.hash == NULL_HASH
    }
}

impl fmt::Display for OutputReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", short_hex(&self.hash), self.index)
    }
}

// =============================================================================
// Signatures and Keys
// =============================================================================

/// The contents of an input's signature slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Signature {
    /// Compact secp256k1 ECDSA signature
    Secp256k1(Vec<u8>),
    /// Miner-chosen data; only valid in a coinbase input
    CoinbaseData(Vec<u8>),
    /// Stand-in used when computing the signed digest; never valid on the wire
    SignableEquivalent,
}

impl Signature {
    /// Whether this is an actual signature scheme, as opposed to a placeholder
    pub fn is_signature(&self) -> bool {
        matches!(self, Signature::Secp256k1(_))
    }
}

/// Recipient of an output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PublicKey {
    /// Compressed secp256k1 public key
    Secp256k1(Vec<u8>),
}

impl PublicKey {
    pub fn from_key_pair(key_pair: &KeyPair) -> Self {
        PublicKey::Secp256k1(key_pair.public_key_bytes())
    }
}

// =============================================================================
// Inputs and Outputs
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Input {
    pub output_reference: OutputReference,
    pub signature: Signature,
}

impl Input {
    pub fn new(output_reference: OutputReference, signature: Signature) -> Self {
        Self {
            output_reference,
            signature,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    /// Amount in smallest units
    pub value: u64,
    pub public_key: PublicKey,
}

impl Output {
    pub fn new(value: u64, public_key: PublicKey) -> Self {
        Self { value, public_key }
    }
}

// =============================================================================
// Unspent output views
// =============================================================================

/// Read access to a set of unspent outputs
pub trait UnspentOutputs {
    fn get_output(&self, reference: &OutputReference) -> Option<&Output>;
}

/// Owned unspent output set
pub type UtxoSet = HashMap<OutputReference, Output>;

impl UnspentOutputs for UtxoSet {
    fn get_output(&self, reference: &OutputReference) -> Option<&Output> {
        self.get(reference)
    }
}

// =============================================================================
// Transaction
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
}

impl Transaction {
    pub fn new(inputs: Vec<Input>, outputs: Vec<Output>) -> Self {
        Self { inputs, outputs }
    }

    /// Canonical bytes
    pub fn serialize(&self) -> Vec<u8> {
        encode(self)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        decode(bytes)
    }

    /// Size of the canonical encoding in bytes
    pub fn serialized_size(&self) -> usize {
        encoded_size(self)
    }

    /// Transaction identity
    pub fn hash(&self) -> Hash {
        double_sha256(&self.serialize())
    }

    /// Shape check only: one input carrying the null reference
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].output_reference.is_null()
    }

    /// Sum of output values, `None` on overflow
    pub fn total_output(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |total, output| total.checked_add(output.value))
    }

    /// References to the outputs created by this transaction
    pub fn output_references(&self) -> impl Iterator<Item = (OutputReference, &Output)> {
        let hash = self.hash();
        self.outputs
            .iter()
            .enumerate()
            .map(move |(index, output)| (OutputReference::new(hash, index as u32), output))
    }

    /// The transaction with every signature slot replaced by the placeholder
    pub fn signable_equivalent(&self) -> Transaction {
        Transaction {
            inputs: self
                .inputs
                .iter()
                .map(|input| Input::new(input.output_reference, Signature::SignableEquivalent))
                .collect(),
            outputs: self.outputs.clone(),
        }
    }

    /// Digest every input signature commits to
    pub fn signing_digest(&self) -> Hash {
        self.signable_equivalent().hash()
    }

    /// Sign all inputs with the provided key pair
    pub fn sign(&mut self, key_pair: &KeyPair) {
        let digest = self.signing_digest();
        let signature = key_pair.sign(&digest);

        for input in &mut self.inputs {
            input.signature = Signature::Secp256k1(signature.clone());
        }
    }
}
