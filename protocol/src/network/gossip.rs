//! # Gossip
//!
//! Push-based peer propagation. Every round this node sends its own signed
//! claim plus a random sample of known peers to a few random targets. There
//! is no acknowledgement and no retry; the next round covers losses.
//!
//! Receivers run the payload through [`PeerDirectory::ingest`], which
//! verifies each claim and upserts, so duplicate or reordered delivery
//! leaves the table unchanged.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tracing::{debug, info};

use super::client::PeerClient;
use super::directory::PeerDirectory;
use super::peer::{GossipPayload, PeerEntry, PeerRecord};
use crate::config::GossipConfig;

/// Outcome of one gossip round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GossipRound {
    pub targets: usize,
    pub delivered: usize,
    pub entries: usize,
}

pub struct GossipEngine {
    directory: Arc<PeerDirectory>,
    client: Arc<dyn PeerClient>,
    config: GossipConfig,
    rounds: AtomicU64,
}

impl GossipEngine {
    pub fn new(directory: Arc<PeerDirectory>, client: Arc<dyn PeerClient>, config: GossipConfig) -> Self {
        Self {
            directory,
            client,
            config,
            rounds: AtomicU64::new(0),
        }
    }

    /// Rounds completed since start.
    pub fn rounds(&self) -> u64 {
        self.rounds.load(Ordering::Relaxed)
    }

    /// Self claim followed by up to `sample_size` signed peers.
    pub fn build_payload(&self) -> GossipPayload {
        let mut peers = vec![PeerEntry::for_identity(self.directory.identity())];
        peers.extend(
            self.directory
                .sample(self.config.sample_size)
                .iter()
                .filter_map(PeerRecord::to_entry),
        );
        GossipPayload { peers }
    }

    /// `fanout` random trusted peers, never this node.
    pub fn select_targets(&self) -> Vec<PeerRecord> {
        let identity = self.directory.identity();
        self.directory
            .sample(usize::MAX)
            .into_iter()
            .filter(|p| !identity.is_self(&p.name, &p.endpoint))
            .take(self.config.fanout)
            .collect()
    }

    /// Pushes one payload to the selected targets concurrently.
    pub async fn run_round(&self) -> GossipRound {
        let payload = self.build_payload();
        let targets = self.select_targets();
        let timeout = self.config.request_timeout;

        let pushes: Vec<_> = targets
            .iter()
            .map(|target| {
                let payload = &payload;
                async move {
                    match tokio::time::timeout(
                        timeout,
                        self.client.push_gossip(&target.endpoint, payload),
                    )
                    .await
                    {
                        Ok(Ok(())) => true,
                        Ok(Err(e)) => {
                            debug!(peer = %target.name, error = %e, "gossip push failed");
                            false
                        }
                        Err(_) => {
                            debug!(peer = %target.name, "gossip push timed out");
                            false
                        }
                    }
                }
            })
            .collect();
        let delivered = stream::iter(pushes)
            .buffer_unordered(self.config.max_concurrency.max(1))
            .filter(|ok| futures::future::ready(*ok))
            .count()
            .await;

        self.rounds.fetch_add(1, Ordering::Relaxed);
        let round = GossipRound {
            targets: targets.len(),
            delivered,
            entries: payload.peers.len(),
        };
        debug!(
            targets = round.targets,
            delivered = round.delivered,
            entries = round.entries,
            "gossip round complete"
        );
        round
    }

    /// Gossip every `interval` until `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.config.interval, fanout = self.config.fanout, "gossip loop starting");
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_round().await;
                }
                _ = shutdown.changed() => {
                    info!("gossip loop shutting down");
                    return;
                }
            }
            if *shutdown.borrow() {
                info!("gossip loop shutting down");
                return;
            }
        }
    }
}
