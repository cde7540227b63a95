//! JSON gateway client for a remote registry.
//!
//! | Call                 | Request                          |
//! |----------------------|----------------------------------|
//! | `get_node`           | `GET  /nodes/{name}`             |
//! | `bootstrap_nodes`    | `GET  /bootstrap?limit={n}`      |
//! | `campaigns_since`    | `GET  /campaigns?since={block}`  |
//! | `campaign`           | `GET  /campaigns/{id}`           |
//! | `active_campaigns`   | `GET  /campaigns/active`         |
//! | `has_premium`        | `GET  /subscriptions/{wallet}`   |
//! | `submit`             | `POST /transactions`             |

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use super::{
    BootstrapNodes, Campaign, CampaignBatch, Registry, RegistryError, RegistryNode,
    RegistryTransaction,
};
use crate::identity::endpoint::join;

#[derive(Debug, Deserialize)]
struct SubscriptionResponse {
    active: bool,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    tx_id: String,
}

/// Registry client speaking JSON over HTTP.
#[derive(Debug, Clone)]
pub struct HttpRegistry {
    base_url: String,
    client: Client,
}

impl HttpRegistry {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, RegistryError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RegistryError::Request(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    /// GET a JSON document; 404 maps to `None`.
    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, RegistryError> {
        let url = join(&self.base_url, path);
        debug!(%url, "registry request");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| RegistryError::Request(e.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(RegistryError::Request(format!(
                "HTTP {} from {}",
                response.status(),
                url
            )));
        }

        response
            .json::<T>()
            .await
            .map(Some)
            .map_err(|e| RegistryError::Invalid(e.to_string()))
    }
}

#[async_trait]
impl Registry for HttpRegistry {
    async fn get_node(&self, name: &str) -> Result<Option<RegistryNode>, RegistryError> {
        match self.get_json::<RegistryNode>(&format!("nodes/{}", name)).await? {
            Some(node) => node.validate().map(Some),
            None => Ok(None),
        }
    }

    async fn bootstrap_nodes(&self, limit: usize) -> Result<BootstrapNodes, RegistryError> {
        let nodes: BootstrapNodes = self
            .get_json(&format!("bootstrap?limit={}", limit))
            .await?
            .unwrap_or_default();
        if nodes.names.len() != nodes.ips.len() {
            return Err(RegistryError::Invalid(format!(
                "bootstrap returned {} names but {} ips",
                nodes.names.len(),
                nodes.ips.len()
            )));
        }
        Ok(nodes)
    }

    async fn campaigns_since(&self, block: u64) -> Result<CampaignBatch, RegistryError> {
        let batch: CampaignBatch = self
            .get_json(&format!("campaigns?since={}", block))
            .await?
            .unwrap_or_default();
        if batch.latest_block < block {
            return Err(RegistryError::Invalid(format!(
                "cursor moved backwards: {} < {}",
                batch.latest_block, block
            )));
        }
        Ok(batch)
    }

    async fn campaign(&self, id: &str) -> Result<Option<Campaign>, RegistryError> {
        self.get_json(&format!("campaigns/{}", id)).await
    }

    async fn active_campaigns(&self) -> Result<Vec<Campaign>, RegistryError> {
        Ok(self
            .get_json::<Vec<Campaign>>("campaigns/active")
            .await?
            .unwrap_or_default())
    }

    async fn has_premium(&self, wallet: &str) -> Result<bool, RegistryError> {
        Ok(self
            .get_json::<SubscriptionResponse>(&format!("subscriptions/{}", wallet))
            .await?
            .map(|s| s.active)
            .unwrap_or(false))
    }

    async fn submit(&self, tx: RegistryTransaction) -> Result<String, RegistryError> {
        let url = join(&self.base_url, "transactions");
        let response = self
            .client
            .post(&url)
            .json(&tx)
            .send()
            .await
            .map_err(|e| RegistryError::Request(e.to_string()))?;
        if !response.status().is_success() {
            return Err(RegistryError::Request(format!("HTTP {}", response.status())));
        }
        let body: SubmitResponse = response
            .json()
            .await
            .map_err(|e| RegistryError::Invalid(e.to_string()))?;
        Ok(body.tx_id)
    }
}
