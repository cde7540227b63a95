//! Peer records and the documents peers exchange about each other.

use serde::{Deserialize, Serialize};

use crate::catalog::entry::ContentSummary;
use crate::crypto::keys::RecoverableSignature;
use crate::identity::NodeIdentity;

// ---------------------------------------------------------------------------
// Directory record
// ---------------------------------------------------------------------------

/// A known peer.
///
/// `is_trusted` is only ever set by the directory after the claim
/// signature verified (or the registry attested the address during
/// bootstrap).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub name: String,
    pub endpoint: String,
    /// Unix seconds.
    pub last_seen: i64,
    pub signature: Option<RecoverableSignature>,
    pub wallet_address: Option<String>,
    pub is_trusted: bool,
}

impl PeerRecord {
    /// Wire form for gossip and `/peers`. `None` for unsigned records,
    /// which no receiver would accept.
    pub fn to_entry(&self) -> Option<PeerEntry> {
        let signature = self.signature.clone()?;
        Some(PeerEntry {
            name: self.name.clone(),
            endpoint: self.endpoint.clone(),
            signature: Some(signature),
            wallet_address: self.wallet_address.clone(),
        })
    }

    /// Same name, endpoint, signer and trust. Ignores `last_seen`.
    pub fn same_claim(&self, other: &PeerRecord) -> bool {
        self.name == other.name
            && self.endpoint == other.endpoint
            && self.signature == other.signature
            && self.wallet_address == other.wallet_address
            && self.is_trusted == other.is_trusted
    }
}

// ---------------------------------------------------------------------------
// Wire documents
// ---------------------------------------------------------------------------

/// A peer claim as it travels between nodes. Nothing in it is trusted
/// until the signature over `NODE:<name>:<endpoint>` checks out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub name: String,
    pub endpoint: String,
    #[serde(default, deserialize_with = "lenient_signature")]
    pub signature: Option<RecoverableSignature>,
    #[serde(default, rename = "walletAddress", alias = "wallet_address")]
    pub wallet_address: Option<String>,
}

impl PeerEntry {
    /// This node's own signed claim.
    pub fn for_identity(identity: &NodeIdentity) -> Self {
        Self {
            name: identity.name().to_string(),
            endpoint: identity.endpoint().to_string(),
            signature: Some(identity.signed_claim()),
            wallet_address: Some(identity.address()),
        }
    }
}

/// A malformed signature downgrades the entry to unsigned instead of
/// failing the whole payload.
fn lenient_signature<'de, D>(deserializer: D) -> Result<Option<RecoverableSignature>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.and_then(|s| RecoverableSignature::from_hex(&s).ok()))
}

/// Body of `POST /gossip` and of `GET /peers`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipPayload {
    pub peers: Vec<PeerEntry>,
}

/// Capacity figures advertised to trackers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeStats {
    pub active_streams: u32,
    pub hosted_items: usize,
    pub known_peers: usize,
    pub region: String,
    pub version: String,
}

/// Body of `POST /announce`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    #[serde(rename = "nodeId", alias = "node_id")]
    pub node_id: String,
    pub endpoint: String,
    pub stats: NodeStats,
    pub content: Vec<ContentSummary>,
    #[serde(default)]
    pub signature: Option<RecoverableSignature>,
}

impl Announcement {
    /// The announcing node's claim, for verification by the receiver.
    pub fn as_entry(&self) -> PeerEntry {
        PeerEntry {
            name: self.node_id.clone(),
            endpoint: self.endpoint.clone(),
            signature: self.signature.clone(),
            wallet_address: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::NodeKeypair;

    #[test]
    fn unsigned_record_has_no_wire_form() {
        let record = PeerRecord {
            name: "beta".into(),
            endpoint: "http://10.0.0.9:7440".into(),
            last_seen: 0,
            signature: None,
            wallet_address: None,
            is_trusted: true,
        };
        assert!(record.to_entry().is_none());
    }

    #[test]
    fn entry_serializes_wallet_in_camel_case() {
        let id = NodeIdentity::new(
            NodeKeypair::from_seed(&[3u8; 32]),
            "gamma",
            "http://10.0.0.3:7440",
            "global",
        );
        let entry = PeerEntry::for_identity(&id);
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["walletAddress"], serde_json::json!(id.address()));

        let back: PeerEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn malformed_signature_becomes_unsigned() {
        let json = r#"{"peers":[{"name":"x","endpoint":"http://1.1.1.1:7440","signature":"zz"}]}"#;
        let payload: GossipPayload = serde_json::from_str(json).unwrap();
        assert_eq!(payload.peers.len(), 1);
        assert!(payload.peers[0].signature.is_none());
    }

    #[test]
    fn same_claim_ignores_last_seen() {
        let a = PeerRecord {
            name: "beta".into(),
            endpoint: "http://10.0.0.9:7440".into(),
            last_seen: 1,
            signature: None,
            wallet_address: None,
            is_trusted: false,
        };
        let b = PeerRecord {
            last_seen: 99,
            ..a.clone()
        };
        assert!(a.same_claim(&b));
    }
}
