//! ECDSA key handling for transaction signatures
//!
//! Signatures are secp256k1 ECDSA in 64-byte compact form over a 32-byte
//! digest; public keys travel as 33-byte compressed encodings.

use rand::rngs::OsRng;
use secp256k1::{ecdsa, Message, PublicKey, Secp256k1, SecretKey};
use thiserror::Error;

/// Length of a compressed public key
pub const PUBLIC_KEY_SIZE: usize = 33;

/// Length of a compact ECDSA signature
pub const SIGNATURE_SIZE: usize = 64;

/// Errors that can occur during key operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("Invalid private key")]
    InvalidPrivateKey,
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Invalid signature encoding")]
    InvalidSignature,
}

/// A key pair consisting of a private key and its corresponding public key
#[derive(Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let (secret_key, public_key) = secp.generate_keypair(&mut OsRng);
        Self {
            secret_key,
            public_key,
        }
    }

    /// Create a key pair from raw secret key bytes
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let secret_key = SecretKey::from_slice(bytes).map_err(|_| KeyError::InvalidPrivateKey)?;
        let secp = Secp256k1::new();
        let public_key = PublicKey::from_secret_key(&secp, &secret_key);
        Ok(Self {
            secret_key,
            public_key,
        })
    }

    /// Compressed public key bytes, as stored in transaction outputs
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.public_key.serialize().to_vec()
    }

    /// Sign a 32-byte digest, returning the compact signature
    pub fn sign(&self, digest: &[u8; 32]) -> Vec<u8> {
        let secp = Secp256k1::new();
        let message = Message::from_digest(*digest);
        secp.sign_ecdsa(&message, &self.secret_key)
            .serialize_compact()
            .to_vec()
    }
}

/// Verify a compact signature over `digest` against a compressed public key
///
/// Malformed keys or signatures are errors; a well-formed signature that does
/// not match is `Ok(false)`.
pub fn verify_signature(
    public_key: &[u8],
    digest: &[u8; 32],
    signature: &[u8],
) -> Result<bool, KeyError> {
    let secp = Secp256k1::verification_only();

    let public_key = PublicKey::from_slice(public_key).map_err(|_| KeyError::InvalidPublicKey)?;
    let signature =
        ecdsa::Signature::from_compact(signature).map_err(|_| KeyError::InvalidSignature)?;
    let message = Message::from_digest(*digest);

    Ok(secp.verify_ecdsa(&message, &signature, &public_key).is_ok())
}
