//! Process-local registry.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::{
    BootstrapNodes, Campaign, CampaignBatch, Registry, RegistryError, RegistryNode,
    RegistryTransaction,
};

/// Serializable contents of an [`InMemoryRegistry`], as found in a static
/// registry file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    #[serde(default)]
    pub nodes: Vec<RegistryNode>,
    #[serde(default)]
    pub campaigns: Vec<Campaign>,
    #[serde(default)]
    pub premium: Vec<String>,
}

/// A registry held entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    nodes: RwLock<HashMap<String, RegistryNode>>,
    /// Insertion order doubles as "recently active" order for bootstrap.
    node_order: RwLock<Vec<String>>,
    campaigns: RwLock<HashMap<String, Campaign>>,
    premium: RwLock<HashSet<String>>,
    submitted: RwLock<Vec<RegistryTransaction>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: RegistrySnapshot) -> Self {
        let registry = Self::new();
        for node in snapshot.nodes {
            registry.register_node(node);
        }
        for campaign in snapshot.campaigns {
            registry.put_campaign(campaign);
        }
        for wallet in snapshot.premium {
            registry.grant_premium(&wallet);
        }
        registry
    }

    /// Loads a JSON [`RegistrySnapshot`].
    pub fn from_json_file(path: &Path) -> Result<Self, RegistryError> {
        let raw = std::fs::read(path)?;
        let snapshot: RegistrySnapshot =
            serde_json::from_slice(&raw).map_err(|e| RegistryError::Invalid(e.to_string()))?;
        Ok(Self::from_snapshot(snapshot))
    }

    pub fn register_node(&self, node: RegistryNode) {
        let name = node.name.clone();
        let fresh = self.nodes.write().insert(name.clone(), node).is_none();
        if fresh {
            self.node_order.write().push(name);
        }
    }

    pub fn put_campaign(&self, campaign: Campaign) {
        self.campaigns.write().insert(campaign.id.clone(), campaign);
    }

    pub fn grant_premium(&self, wallet: &str) {
        self.premium.write().insert(wallet.to_ascii_lowercase());
    }

    /// Transactions submitted so far, oldest first.
    pub fn submitted(&self) -> Vec<RegistryTransaction> {
        self.submitted.read().clone()
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn get_node(&self, name: &str) -> Result<Option<RegistryNode>, RegistryError> {
        Ok(self.nodes.read().get(name).cloned())
    }

    async fn bootstrap_nodes(&self, limit: usize) -> Result<BootstrapNodes, RegistryError> {
        let nodes = self.nodes.read();
        let order = self.node_order.read();
        let mut out = BootstrapNodes::default();

        // Most recently registered first.
        for name in order.iter().rev() {
            if out.names.len() >= limit {
                break;
            }
            let Some(node) = nodes.get(name) else {
                continue;
            };
            let Some(ip) = node.current_ip.as_ref() else {
                continue;
            };
            if node.active {
                out.names.push(node.name.clone());
                out.ips.push(ip.clone());
            }
        }
        Ok(out)
    }

    async fn campaigns_since(&self, block: u64) -> Result<CampaignBatch, RegistryError> {
        let campaigns = self.campaigns.read();
        let mut fresh: Vec<Campaign> = campaigns
            .values()
            .filter(|c| c.block > block)
            .cloned()
            .collect();
        fresh.sort_by_key(|c| c.block);
        let latest_block = fresh.last().map(|c| c.block).unwrap_or(block);
        Ok(CampaignBatch {
            campaigns: fresh,
            latest_block,
        })
    }

    async fn campaign(&self, id: &str) -> Result<Option<Campaign>, RegistryError> {
        Ok(self.campaigns.read().get(id).cloned())
    }

    async fn active_campaigns(&self) -> Result<Vec<Campaign>, RegistryError> {
        Ok(self
            .campaigns
            .read()
            .values()
            .filter(|c| c.active)
            .cloned()
            .collect())
    }

    async fn has_premium(&self, wallet: &str) -> Result<bool, RegistryError> {
        Ok(self.premium.read().contains(&wallet.to_ascii_lowercase()))
    }

    async fn submit(&self, tx: RegistryTransaction) -> Result<String, RegistryError> {
        match &tx {
            RegistryTransaction::RecordAdView { campaign_id, .. } => {
                if let Some(c) = self.campaigns.write().get_mut(campaign_id) {
                    c.views_remaining = c.views_remaining.saturating_sub(1);
                }
            }
        }
        let mut submitted = self.submitted.write();
        submitted.push(tx);
        Ok(format!("local-tx-{}", submitted.len()))
    }
}
