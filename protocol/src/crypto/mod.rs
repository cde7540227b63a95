//! # Cryptographic Primitives
//!
//! Everything security-related in Driftcast flows through here:
//!
//! - **Ed25519** node and wallet keys, with addresses derived from SHA-256
//!   of the public key.
//! - **Signed protocol messages** (`NODE:`, `VOTE:`, `VIEW:`) and the
//!   `recover` primitive that turns a signature back into an address.
//! - **SHA-256** content hashing; BLAKE3 for local cache keys.
//! - **AES-256-GCM** chunked streaming encryption for hosted media.
//!
//! All of it is a thin, typed layer over audited crates.

pub mod cipher;
pub mod hash;
pub mod keys;
pub mod signatures;

pub use cipher::{decrypt, encrypt, ContentKey, EncryptionSummary};
pub use hash::{sha256_array, sha256_hex};
pub use keys::{NodeKeypair, NodePublicKey, RecoverableSignature};
pub use signatures::{node_claim_message, recover, recover_hex};
