//! # Key Management
//!
//! Ed25519 node keys and the address scheme built on top of them.
//!
//! A Driftcast address is `0x` followed by the last 20 bytes of the
//! SHA-256 of the public key, hex encoded. Wallets, node operators and the
//! registry all speak in addresses, never in raw public keys.
//!
//! Ed25519 has no public-key recovery, so a signature on the wire is
//! carried together with the signer's public key (see
//! [`RecoverableSignature`]). "Recovering" the signer then means verifying
//! the signature under the embedded key and deriving the address from it.
//! The address check against the claimed identity happens one layer up.
//!
//! Key bytes are never logged.

use ed25519_dalek::{Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::crypto::hash::sha256_array;

/// Length of a public key on the wire.
pub const PUBLIC_KEY_LENGTH: usize = 32;

/// Length of a raw Ed25519 signature.
pub const SIGNATURE_LENGTH: usize = 64;

/// Length of a [`RecoverableSignature`]: public key followed by signature.
pub const RECOVERABLE_SIGNATURE_LENGTH: usize = PUBLIC_KEY_LENGTH + SIGNATURE_LENGTH;

/// Errors that can occur during key operations.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid secret key bytes")]
    InvalidSecretKey,

    #[error("invalid public key bytes: not a valid Ed25519 point")]
    InvalidPublicKey,

    #[error("invalid signature encoding")]
    InvalidSignature,
}

/// The signing identity of a node or wallet.
///
/// Deliberately not `Serialize`: exporting key material goes through
/// [`NodeKeypair::secret_key_hex`] and is always an explicit act.
pub struct NodeKeypair {
    signing_key: SigningKey,
}

/// The public half of a [`NodeKeypair`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodePublicKey {
    bytes: [u8; PUBLIC_KEY_LENGTH],
}

/// A signature bundled with the public key that produced it.
#[derive(Clone, PartialEq, Eq)]
pub struct RecoverableSignature {
    public_key: [u8; PUBLIC_KEY_LENGTH],
    signature: [u8; SIGNATURE_LENGTH],
}

impl NodeKeypair {
    /// Generate a fresh keypair from the OS RNG.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Build a keypair deterministically from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Parse a hex-encoded 32-byte secret key, as stored in `node.key`.
    pub fn from_hex(hex_str: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_str.trim()).map_err(|_| KeyError::InvalidSecretKey)?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::InvalidSecretKey)?;
        Ok(Self::from_seed(&seed))
    }

    pub fn public_key(&self) -> NodePublicKey {
        NodePublicKey {
            bytes: self.signing_key.verifying_key().to_bytes(),
        }
    }

    /// The address derived from this keypair's public key.
    pub fn address(&self) -> String {
        self.public_key().to_address()
    }

    /// Sign a message, bundling the public key so the signer can be
    /// recovered by whoever receives it.
    pub fn sign(&self, message: &[u8]) -> RecoverableSignature {
        let sig = self.signing_key.sign(message);
        RecoverableSignature {
            public_key: self.signing_key.verifying_key().to_bytes(),
            signature: sig.to_bytes(),
        }
    }

    /// Hex export of the secret key. Handle with care.
    pub fn secret_key_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }
}

impl Clone for NodeKeypair {
    fn clone(&self) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&self.signing_key.to_bytes()),
        }
    }
}

impl fmt::Debug for NodeKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeKeypair(addr={})", self.address())
    }
}

// ---------------------------------------------------------------------------
// NodePublicKey
// ---------------------------------------------------------------------------

impl NodePublicKey {
    /// Validate and wrap raw public key bytes.
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_LENGTH]) -> Result<Self, KeyError> {
        VerifyingKey::from_bytes(&bytes).map_err(|_| KeyError::InvalidPublicKey)?;
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        &self.bytes
    }

    /// `0x` + hex of the last 20 bytes of SHA-256(public key).
    pub fn to_address(&self) -> String {
        let digest = sha256_array(&self.bytes);
        format!("0x{}", hex::encode(&digest[12..]))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }
}

impl fmt::Display for NodePublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for NodePublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodePublicKey({})", &self.to_hex()[..16])
    }
}

// ---------------------------------------------------------------------------
// RecoverableSignature
// ---------------------------------------------------------------------------

impl RecoverableSignature {
    /// Verify the signature under the embedded key and return the signer.
    ///
    /// Fails when the key is not a valid point or the signature does not
    /// match the message.
    pub fn recover_signer(&self, message: &[u8]) -> Result<NodePublicKey, KeyError> {
        let verifying_key =
            VerifyingKey::from_bytes(&self.public_key).map_err(|_| KeyError::InvalidPublicKey)?;
        let signature = DalekSignature::from_bytes(&self.signature);
        verifying_key
            .verify(message, &signature)
            .map_err(|_| KeyError::InvalidSignature)?;
        Ok(NodePublicKey {
            bytes: self.public_key,
        })
    }

    pub fn to_bytes(&self) -> [u8; RECOVERABLE_SIGNATURE_LENGTH] {
        let mut out = [0u8; RECOVERABLE_SIGNATURE_LENGTH];
        out[..PUBLIC_KEY_LENGTH].copy_from_slice(&self.public_key);
        out[PUBLIC_KEY_LENGTH..].copy_from_slice(&self.signature);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.len() != RECOVERABLE_SIGNATURE_LENGTH {
            return Err(KeyError::InvalidSignature);
        }
        let mut public_key = [0u8; PUBLIC_KEY_LENGTH];
        let mut signature = [0u8; SIGNATURE_LENGTH];
        public_key.copy_from_slice(&bytes[..PUBLIC_KEY_LENGTH]);
        signature.copy_from_slice(&bytes[PUBLIC_KEY_LENGTH..]);
        Ok(Self {
            public_key,
            signature,
        })
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// Accepts an optional `0x` prefix.
    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s).map_err(|_| KeyError::InvalidSignature)?;
        Self::from_bytes(&bytes)
    }
}

impl fmt::Debug for RecoverableSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex_str = self.to_hex();
        write!(
            f,
            "RecoverableSignature({}...{})",
            &hex_str[..8],
            &hex_str[hex_str.len() - 8..]
        )
    }
}

impl Serialize for RecoverableSignature {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for RecoverableSignature {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}
