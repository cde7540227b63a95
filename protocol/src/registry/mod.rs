//! # Registry Collaborator
//!
//! The registry is the external trust anchor: an on-chain (or equivalent)
//! directory mapping node names to operator addresses, plus the campaign
//! ledger the replication scheduler polls. Driftcast only ever talks to it
//! through the [`Registry`] trait, and every call returns a typed struct
//! validated at the boundary instead of a loosely typed tuple.
//!
//! The signature primitive the registry is usually credited with
//! (`recover(message, signature) -> address`) is local: see
//! [`crate::crypto::signatures::recover`].
//!
//! ## Implementations
//!
//! - [`InMemoryRegistry`]: a process-local registry. Used by tests and by
//!   single-operator deployments that load a static registry file.
//! - [`HttpRegistry`]: a JSON gateway client.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::endpoint::is_address_literal;

pub use http::HttpRegistry;
pub use memory::InMemoryRegistry;

/// Errors from registry calls. All of them are transient from the caller's
/// point of view: the next scheduled cycle tries again.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry request failed: {0}")]
    Request(String),

    #[error("registry returned an invalid record: {0}")]
    Invalid(String),

    #[error("registry I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A node's registry record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryNode {
    pub name: String,
    /// Wallet that registered the name.
    pub operator: String,
    /// Address the node signs with.
    pub node_address: String,
    /// Unix seconds.
    pub expires_at: i64,
    pub active: bool,
    pub current_ip: Option<String>,
}

impl RegistryNode {
    /// Active and not expired at `now` (unix seconds).
    pub fn is_live(&self, now: i64) -> bool {
        self.active && self.expires_at > now
    }

    /// Boundary validation for records that came off the wire.
    pub fn validate(self) -> Result<Self, RegistryError> {
        if self.name.trim().is_empty() {
            return Err(RegistryError::Invalid("empty node name".into()));
        }
        if !is_wallet_address(&self.node_address) {
            return Err(RegistryError::Invalid(format!(
                "node address {:?} is not an address",
                self.node_address
            )));
        }
        Ok(self)
    }
}

/// Recently active nodes returned by `getBootstrapNodes`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapNodes {
    pub names: Vec<String>,
    pub ips: Vec<String>,
}

impl BootstrapNodes {
    /// Zips names with IPs, dropping unpaired trailing entries.
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.names
            .iter()
            .zip(self.ips.iter())
            .map(|(n, i)| (n.as_str(), i.as_str()))
    }
}

/// A replicable content item (an ad campaign or promoted media) as listed
/// in the registry's ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    /// Content id of the media the campaign points at.
    pub content_id: String,
    /// Authority currently hosting the content.
    pub source: String,
    pub title: String,
    pub active: bool,
    pub views_remaining: u64,
    /// `global` or a region tag.
    pub region: String,
    /// Registry block the campaign was created in.
    pub block: u64,
}

impl Campaign {
    pub fn has_capacity(&self) -> bool {
        self.active && self.views_remaining > 0
    }
}

/// Campaigns created after a cursor, plus the new cursor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignBatch {
    pub campaigns: Vec<Campaign>,
    pub latest_block: u64,
}

/// Transactions this node submits to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegistryTransaction {
    /// A verified ad view, consuming one view from the campaign budget.
    RecordAdView {
        campaign_id: String,
        viewer: String,
        link_id: String,
    },
}

/// The trust oracle as seen by the core.
#[async_trait]
pub trait Registry: Send + Sync {
    /// `getNode(name)`.
    async fn get_node(&self, name: &str) -> Result<Option<RegistryNode>, RegistryError>;

    /// `getBootstrapNodes(limit)`.
    async fn bootstrap_nodes(&self, limit: usize) -> Result<BootstrapNodes, RegistryError>;

    /// Campaigns created strictly after `block`.
    async fn campaigns_since(&self, block: u64) -> Result<CampaignBatch, RegistryError>;

    /// Current state of one campaign.
    async fn campaign(&self, id: &str) -> Result<Option<Campaign>, RegistryError>;

    /// Every currently active campaign, for ad selection.
    async fn active_campaigns(&self) -> Result<Vec<Campaign>, RegistryError>;

    /// Whether `wallet` holds an active premium subscription.
    async fn has_premium(&self, wallet: &str) -> Result<bool, RegistryError>;

    /// Submits a transaction; returns its id.
    async fn submit(&self, tx: RegistryTransaction) -> Result<String, RegistryError>;
}

/// `0x` followed by 40 hex digits.
pub fn is_wallet_address(s: &str) -> bool {
    s.len() == 42
        && s.starts_with("0x")
        && s[2..].chars().all(|c| c.is_ascii_hexdigit())
}

/// A registry-style name: neither a raw address nor an IP literal.
pub fn is_registry_name(s: &str) -> bool {
    let s = s.trim();
    !s.is_empty() && !is_wallet_address(s) && !is_address_literal(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> RegistryNode {
        RegistryNode {
            name: "alpha".into(),
            operator: "0x1111111111111111111111111111111111111111".into(),
            node_address: "0x2222222222222222222222222222222222222222".into(),
            expires_at: 2_000,
            active: true,
            current_ip: Some("10.0.0.1".into()),
        }
    }

    #[test]
    fn liveness_respects_expiry_and_flag() {
        let n = node();
        assert!(n.is_live(1_000));
        assert!(!n.is_live(2_000));
        assert!(!RegistryNode { active: false, ..n }.is_live(1_000));
    }

    #[test]
    fn validation_rejects_bad_addresses() {
        assert!(node().validate().is_ok());
        let bad = RegistryNode {
            node_address: "not-an-address".into(),
            ..node()
        };
        assert!(matches!(bad.validate(), Err(RegistryError::Invalid(_))));
    }

    #[test]
    fn bootstrap_pairs_drop_unpaired() {
        let b = BootstrapNodes {
            names: vec!["a".into(), "b".into(), "c".into()],
            ips: vec!["1.1.1.1".into(), "2.2.2.2".into()],
        };
        assert_eq!(b.pairs().count(), 2);
    }

    #[test]
    fn registry_name_classification() {
        assert!(is_registry_name("alpha.dc"));
        assert!(!is_registry_name("0x2222222222222222222222222222222222222222"));
        assert!(!is_registry_name("10.0.0.1"));
        assert!(!is_registry_name(""));
    }

    #[test]
    fn campaign_capacity() {
        let c = Campaign {
            id: "c1".into(),
            content_id: "m1".into(),
            source: "alpha".into(),
            title: "Spot".into(),
            active: true,
            views_remaining: 0,
            region: "global".into(),
            block: 1,
        };
        assert!(!c.has_capacity());
        assert!(Campaign {
            views_remaining: 3,
            ..c
        }
        .has_capacity());
    }
}
