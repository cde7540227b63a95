//! Tracker discovery and the heartbeat announce loop.
//!
//! Trackers are optional rendezvous servers. Pulling from them is just
//! another source of signed claims fed through the directory; pushing to
//! them advertises this node's capacity and hosted content.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::client::PeerClient;
use super::directory::PeerDirectory;
use super::peer::{Announcement, NodeStats};
use crate::catalog::entry::ContentSummary;
use crate::config::GossipConfig;

/// Supplies the live figures for each announce.
pub trait AnnouncementSource: Send + Sync {
    fn stats(&self) -> NodeStats;
    fn content(&self) -> Vec<ContentSummary>;
}

pub struct TrackerClient {
    directory: Arc<PeerDirectory>,
    client: Arc<dyn PeerClient>,
    trackers: Vec<String>,
    config: GossipConfig,
}

impl TrackerClient {
    pub fn new(
        directory: Arc<PeerDirectory>,
        client: Arc<dyn PeerClient>,
        trackers: Vec<String>,
        config: GossipConfig,
    ) -> Self {
        Self {
            directory,
            client,
            trackers,
            config,
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.trackers.is_empty()
    }

    /// Pulls peer lists from every tracker. Returns claims admitted.
    pub async fn discover(&self) -> usize {
        let mut admitted = 0;
        for tracker in &self.trackers {
            let fetched =
                tokio::time::timeout(self.config.request_timeout, self.client.fetch_peers(tracker)).await;
            match fetched {
                Ok(Ok(entries)) => {
                    let offered = entries.len();
                    let n = self.directory.ingest(entries).await;
                    debug!(%tracker, offered, admitted = n, "tracker peers ingested");
                    admitted += n;
                }
                Ok(Err(e)) => warn!(%tracker, error = %e, "tracker fetch failed"),
                Err(_) => warn!(%tracker, "tracker fetch timed out"),
            }
        }
        admitted
    }

    pub fn announcement(&self, source: &dyn AnnouncementSource) -> Announcement {
        let identity = self.directory.identity();
        Announcement {
            node_id: identity.name().to_string(),
            endpoint: identity.endpoint().to_string(),
            stats: source.stats(),
            content: source.content(),
            signature: Some(identity.signed_claim()),
        }
    }

    /// Posts one announcement to every tracker. Returns successful posts.
    pub async fn announce_once(&self, source: &dyn AnnouncementSource) -> usize {
        let announcement = self.announcement(source);
        let timeout = self.config.request_timeout;

        let posts: Vec<_> = self
            .trackers
            .iter()
            .map(|tracker| {
                let announcement = &announcement;
                async move {
                    match tokio::time::timeout(timeout, self.client.announce(tracker, announcement)).await {
                        Ok(Ok(())) => true,
                        Ok(Err(e)) => {
                            debug!(%tracker, error = %e, "announce failed");
                            false
                        }
                        Err(_) => {
                            debug!(%tracker, "announce timed out");
                            false
                        }
                    }
                }
            })
            .collect();
        stream::iter(posts)
            .buffer_unordered(self.config.max_concurrency.max(1))
            .filter(|ok| futures::future::ready(*ok))
            .count()
            .await
    }

    /// Announce every `heartbeat_interval` until shutdown. Returns at once
    /// when no trackers are configured.
    pub async fn run_heartbeat(
        &self,
        source: Arc<dyn AnnouncementSource>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        if !self.is_configured() {
            debug!("no trackers configured, heartbeat disabled");
            return;
        }
        info!(trackers = self.trackers.len(), "heartbeat loop starting");
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let ok = self.announce_once(source.as_ref()).await;
                    debug!(ok, total = self.trackers.len(), "heartbeat sent");
                }
                _ = shutdown.changed() => {
                    info!("heartbeat loop shutting down");
                    return;
                }
            }
        }
    }
}
