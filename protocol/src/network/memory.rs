//! In-process [`PeerClient`] that serves canned data per endpoint and
//! records what was pushed to it. Used by tests and local simulations.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::client::{PeerClient, PeerError};
use super::peer::{Announcement, GossipPayload, PeerEntry};
use crate::catalog::entry::{ContentSummary, Manifest};
use crate::identity::endpoint::normalize_endpoint;

/// Everything one simulated node serves.
#[derive(Debug, Clone, Default)]
pub struct SimulatedPeer {
    pub peers: Vec<PeerEntry>,
    pub catalog: Vec<ContentSummary>,
    pub manifests: HashMap<String, Manifest>,
    pub assets: HashMap<String, Vec<u8>>,
    pub content: HashMap<String, Vec<u8>>,
}

#[derive(Debug, Default)]
pub struct MemoryPeerClient {
    nodes: RwLock<HashMap<String, SimulatedPeer>>,
    unreachable: RwLock<HashSet<String>>,
    /// Downloads that write half the blob and then fail.
    broken_downloads: RwLock<HashSet<(String, String)>>,
    gossip_received: RwLock<Vec<(String, GossipPayload)>>,
    announcements: RwLock<Vec<(String, Announcement)>>,
}

fn key(endpoint: &str) -> String {
    normalize_endpoint(endpoint).unwrap_or_else(|| endpoint.trim_end_matches('/').to_string())
}

impl MemoryPeerClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(&self, endpoint: &str, peer: SimulatedPeer) {
        self.nodes.write().insert(key(endpoint), peer);
    }

    /// Mutates the data served at `endpoint`, creating it if needed.
    pub fn update(&self, endpoint: &str, f: impl FnOnce(&mut SimulatedPeer)) {
        f(self.nodes.write().entry(key(endpoint)).or_default());
    }

    pub fn set_unreachable(&self, endpoint: &str, down: bool) {
        let mut set = self.unreachable.write();
        if down {
            set.insert(key(endpoint));
        } else {
            set.remove(&key(endpoint));
        }
    }

    pub fn break_download(&self, endpoint: &str, id: &str) {
        self.broken_downloads
            .write()
            .insert((key(endpoint), id.to_string()));
    }

    pub fn gossip_received(&self) -> Vec<(String, GossipPayload)> {
        self.gossip_received.read().clone()
    }

    pub fn announcements(&self) -> Vec<(String, Announcement)> {
        self.announcements.read().clone()
    }

    fn with_peer<T>(
        &self,
        endpoint: &str,
        f: impl FnOnce(&SimulatedPeer) -> Option<T>,
    ) -> Result<T, PeerError> {
        let k = key(endpoint);
        if self.unreachable.read().contains(&k) {
            return Err(PeerError::Timeout { url: k });
        }
        let nodes = self.nodes.read();
        let peer = nodes.get(&k).ok_or_else(|| PeerError::Request {
            url: k.clone(),
            reason: "connection refused".into(),
        })?;
        f(peer).ok_or(PeerError::Status { url: k, status: 404 })
    }
}

#[async_trait]
impl PeerClient for MemoryPeerClient {
    async fn fetch_peers(&self, endpoint: &str) -> Result<Vec<PeerEntry>, PeerError> {
        self.with_peer(endpoint, |p| Some(p.peers.clone()))
    }

    async fn push_gossip(&self, endpoint: &str, payload: &GossipPayload) -> Result<(), PeerError> {
        self.with_peer(endpoint, |_| Some(()))?;
        self.gossip_received
            .write()
            .push((key(endpoint), payload.clone()));
        Ok(())
    }

    async fn fetch_catalog(&self, endpoint: &str) -> Result<Vec<ContentSummary>, PeerError> {
        self.with_peer(endpoint, |p| Some(p.catalog.clone()))
    }

    async fn fetch_manifest(&self, endpoint: &str, id: &str) -> Result<Manifest, PeerError> {
        self.with_peer(endpoint, |p| p.manifests.get(id).cloned())
    }

    async fn fetch_asset(&self, endpoint: &str, name: &str) -> Result<Vec<u8>, PeerError> {
        self.with_peer(endpoint, |p| p.assets.get(name).cloned())
    }

    async fn download_content(
        &self,
        endpoint: &str,
        id: &str,
        dest: &Path,
        max_bytes: u64,
    ) -> Result<u64, PeerError> {
        let bytes = self.with_peer(endpoint, |p| p.content.get(id).cloned())?;
        let cap = usize::try_from(max_bytes).unwrap_or(usize::MAX);
        if bytes.len() > cap {
            tokio::fs::write(dest, &bytes[..cap]).await?;
            return Err(PeerError::TooLarge {
                url: key(endpoint),
                limit: max_bytes,
            });
        }
        let broken = self
            .broken_downloads
            .read()
            .contains(&(key(endpoint), id.to_string()));

        if broken {
            tokio::fs::write(dest, &bytes[..bytes.len() / 2]).await?;
            return Err(PeerError::Request {
                url: key(endpoint),
                reason: "connection reset".into(),
            });
        }

        tokio::fs::write(dest, &bytes).await?;
        Ok(bytes.len() as u64)
    }

    async fn announce(&self, tracker: &str, announcement: &Announcement) -> Result<(), PeerError> {
        self.with_peer(tracker, |_| Some(()))?;
        self.announcements
            .write()
            .push((key(tracker), announcement.clone()));
        Ok(())
    }
}
