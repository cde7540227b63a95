//! # Peer Client
//!
//! Outbound calls to other nodes and trackers. Every call carries a timeout
//! and never retries: a failed call is logged by the caller and the next
//! scheduled cycle is the retry.
//!
//! [`PeerClient`] is the seam tests fake; [`HttpPeerClient`] is the real
//! thing on `reqwest`.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use super::peer::{Announcement, GossipPayload, PeerEntry};
use crate::catalog::entry::{ContentSummary, Manifest};
use crate::config::CONTENT_DOWNLOAD_TIMEOUT;
use crate::identity::endpoint::join;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("request to {url} failed: {reason}")]
    Request { url: String, reason: String },

    #[error("{url} answered HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("{url} sent more than the expected {limit} bytes")]
    TooLarge { url: String, limit: u64 },

    #[error("could not decode response from {url}: {reason}")]
    Decode { url: String, reason: String },

    #[error("local I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PeerError {
    fn from_reqwest(url: &str, e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout { url: url.to_string() }
        } else {
            Self::Request {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Calls one node makes to another.
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// `GET {endpoint}/peers`. Trackers answer the same route.
    async fn fetch_peers(&self, endpoint: &str) -> Result<Vec<PeerEntry>, PeerError>;

    /// `POST {endpoint}/gossip`.
    async fn push_gossip(&self, endpoint: &str, payload: &GossipPayload) -> Result<(), PeerError>;

    /// `GET {endpoint}/catalog`.
    async fn fetch_catalog(&self, endpoint: &str) -> Result<Vec<ContentSummary>, PeerError>;

    /// `GET {endpoint}/manifest/{id}`.
    async fn fetch_manifest(&self, endpoint: &str, id: &str) -> Result<Manifest, PeerError>;

    /// `GET {endpoint}/assets/{name}`.
    async fn fetch_asset(&self, endpoint: &str, name: &str) -> Result<Vec<u8>, PeerError>;

    /// Streams `GET {endpoint}/content/{id}` (encrypted bytes) into `dest`.
    /// Returns the number of bytes written. Fails with
    /// [`PeerError::TooLarge`] as soon as the body would exceed
    /// `max_bytes`; `dest` may then hold a partial prefix.
    async fn download_content(
        &self,
        endpoint: &str,
        id: &str,
        dest: &Path,
        max_bytes: u64,
    ) -> Result<u64, PeerError>;

    /// `POST {tracker}/announce`.
    async fn announce(&self, tracker: &str, announcement: &Announcement) -> Result<(), PeerError>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HttpPeerClient {
    client: Client,
    /// Separate client for blob downloads, which legitimately run long.
    bulk: Client,
}

impl HttpPeerClient {
    pub fn new(request_timeout: Duration) -> Result<Self, PeerError> {
        let build = |timeout: Duration| {
            Client::builder()
                .timeout(timeout)
                .user_agent(concat!("driftcast/", env!("CARGO_PKG_VERSION")))
                .build()
                .map_err(|e| PeerError::Request {
                    url: String::new(),
                    reason: e.to_string(),
                })
        };
        Ok(Self {
            client: build(request_timeout)?,
            bulk: build(CONTENT_DOWNLOAD_TIMEOUT)?,
        })
    }

    fn checked(url: &str, result: Result<Response, reqwest::Error>) -> Result<Response, PeerError> {
        let response = result.map_err(|e| PeerError::from_reqwest(url, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(PeerError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, PeerError> {
        let response = Self::checked(url, self.client.get(url).send().await)?;
        response.json::<T>().await.map_err(|e| PeerError::Decode {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn fetch_peers(&self, endpoint: &str) -> Result<Vec<PeerEntry>, PeerError> {
        let url = join(endpoint, "peers");
        let payload: GossipPayload = self.get_json(&url).await?;
        Ok(payload.peers)
    }

    async fn push_gossip(&self, endpoint: &str, payload: &GossipPayload) -> Result<(), PeerError> {
        let url = join(endpoint, "gossip");
        Self::checked(&url, self.client.post(&url).json(payload).send().await)?;
        Ok(())
    }

    async fn fetch_catalog(&self, endpoint: &str) -> Result<Vec<ContentSummary>, PeerError> {
        self.get_json(&join(endpoint, "catalog")).await
    }

    async fn fetch_manifest(&self, endpoint: &str, id: &str) -> Result<Manifest, PeerError> {
        self.get_json(&join(endpoint, &format!("manifest/{}", id))).await
    }

    async fn fetch_asset(&self, endpoint: &str, name: &str) -> Result<Vec<u8>, PeerError> {
        let url = join(endpoint, &format!("assets/{}", name));
        let response = Self::checked(&url, self.client.get(&url).send().await)?;
        let body = response
            .bytes()
            .await
            .map_err(|e| PeerError::from_reqwest(&url, e))?;
        Ok(body.to_vec())
    }

    async fn download_content(
        &self,
        endpoint: &str,
        id: &str,
        dest: &Path,
        max_bytes: u64,
    ) -> Result<u64, PeerError> {
        let url = join(endpoint, &format!("content/{}", id));
        let response = Self::checked(&url, self.bulk.get(&url).send().await)?;
        let too_large = || PeerError::TooLarge {
            url: url.clone(),
            limit: max_bytes,
        };
        if response.content_length().is_some_and(|len| len > max_bytes) {
            return Err(too_large());
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| PeerError::from_reqwest(&url, e))?;
            written += chunk.len() as u64;
            if written > max_bytes {
                return Err(too_large());
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }

    async fn announce(&self, tracker: &str, announcement: &Announcement) -> Result<(), PeerError> {
        let url = join(tracker, "announce");
        Self::checked(&url, self.client.post(&url).json(announcement).send().await)?;
        Ok(())
    }
}
