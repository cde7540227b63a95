//! # Signed Protocol Messages
//!
//! Every claim a node or wallet makes on the network is a short, canonical
//! text message signed with a [`RecoverableSignature`]. This module owns
//! the message formats and the `recover` primitive the rest of the crate
//! uses to turn a signature back into an address.
//!
//! | Message                                   | Signed by          |
//! |-------------------------------------------|--------------------|
//! | `NODE:<name>:<endpoint>`                  | node operator key  |
//! | `VOTE:<mediaId>:<uploader>:<up\|down>`    | voter wallet       |
//! | `VIEW:<linkId>:<campaignId>:<clientKey>`  | viewer wallet      |

use thiserror::Error;

use super::keys::{NodeKeypair, RecoverableSignature};
use crate::config::NODE_CLAIM_PREFIX;

/// Errors during signature recovery.
#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("malformed signature")]
    Malformed,

    #[error("signature verification failed")]
    VerificationFailed,
}

/// The message a node signs to claim its `(name, endpoint)` pair.
pub fn node_claim_message(name: &str, endpoint: &str) -> String {
    format!("{}:{}:{}", NODE_CLAIM_PREFIX, name, endpoint)
}

/// The message a wallet signs to vote on a catalog entry.
pub fn vote_message(media_id: &str, uploader: &str, upvote: bool) -> String {
    let direction = if upvote { "up" } else { "down" };
    format!("VOTE:{}:{}:{}", media_id, uploader, direction)
}

/// The message a viewer signs to prove an ad (or premium) view.
///
/// `campaign_id` is `premium` for subscriber proofs.
pub fn view_proof_message(link_id: &str, campaign_id: &str, client_key: &str) -> String {
    format!("VIEW:{}:{}:{}", link_id, campaign_id, client_key)
}

/// Sign a node claim with the node's key.
pub fn sign_node_claim(keypair: &NodeKeypair, name: &str, endpoint: &str) -> RecoverableSignature {
    keypair.sign(node_claim_message(name, endpoint).as_bytes())
}

/// Recover the signer address of `message`.
pub fn recover(message: &str, signature: &RecoverableSignature) -> Result<String, SignatureError> {
    signature
        .recover_signer(message.as_bytes())
        .map(|pk| pk.to_address())
        .map_err(|_| SignatureError::VerificationFailed)
}

/// Like [`recover`], for signatures that arrived hex-encoded.
pub fn recover_hex(message: &str, signature_hex: &str) -> Result<String, SignatureError> {
    let signature =
        RecoverableSignature::from_hex(signature_hex).map_err(|_| SignatureError::Malformed)?;
    recover(message, &signature)
}

/// Case-insensitive address comparison (hex addresses may arrive in either
/// case from wallets).
pub fn addresses_match(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}
