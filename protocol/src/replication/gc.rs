//! Replica garbage collection.
//!
//! Replicas (byte copies in the link registry and metadata-only mirrors in
//! the catalog db) older than the retention window are deleted. Content
//! this node ingested itself is never touched.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::catalog::{CatalogStore, RegisteredLink};
use crate::config::ReplicationConfig;
use crate::registry::Registry;

/// Eviction policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcPolicy {
    pub retention: Duration,
    /// Keep expired replicas whose campaign is still active.
    pub spare_active: bool,
}

impl Default for GcPolicy {
    fn default() -> Self {
        Self::from(&ReplicationConfig::default())
    }
}

impl From<&ReplicationConfig> for GcPolicy {
    fn from(config: &ReplicationConfig) -> Self {
        Self {
            retention: config.retention,
            spare_active: config.spare_active,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    pub examined: usize,
    pub evicted: usize,
    pub spared: usize,
}

pub struct GarbageCollector {
    catalog: Arc<CatalogStore>,
    registry: Arc<dyn Registry>,
    policy: GcPolicy,
    interval: Duration,
    evicted: AtomicU64,
}

impl GarbageCollector {
    pub fn new(catalog: Arc<CatalogStore>, registry: Arc<dyn Registry>, policy: GcPolicy, interval: Duration) -> Self {
        Self {
            catalog,
            registry,
            policy,
            interval,
            evicted: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> GcPolicy {
        self.policy
    }

    /// Replicas evicted since start, data and metadata together.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// One collection pass at time `now` (unix seconds).
    pub async fn collect(&self, now: i64) -> GcReport {
        let mut report = GcReport::default();
        let retention = i64::try_from(self.policy.retention.as_secs()).unwrap_or(i64::MAX);
        let cutoff = now.saturating_sub(retention);

        for link in self.catalog.links().replicas() {
            let Some(info) = link.replica.as_ref() else {
                continue;
            };
            report.examined += 1;
            if info.acquired_at > cutoff {
                continue;
            }
            if self.spared(info.campaign_id.as_deref()).await {
                report.spared += 1;
                continue;
            }
            if self.evict_link(&link) {
                report.evicted += 1;
            }
        }

        let mirrors = match self.catalog.db().mirrors() {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "cannot list mirrored metadata");
                Vec::new()
            }
        };
        for mirror in mirrors {
            report.examined += 1;
            if mirror.acquired_at > cutoff {
                continue;
            }
            if self.spared(mirror.campaign_id.as_deref()).await {
                report.spared += 1;
                continue;
            }
            match self.catalog.db().remove_mirror(&mirror.media_id) {
                Ok(true) => {
                    debug!(media = %mirror.media_id, "mirrored metadata evicted");
                    report.evicted += 1;
                }
                Ok(false) => {}
                Err(e) => warn!(media = %mirror.media_id, error = %e, "failed to evict mirrored metadata"),
            }
        }

        self.evicted.fetch_add(report.evicted as u64, Ordering::Relaxed);
        if report.evicted > 0 || report.spared > 0 {
            info!(
                examined = report.examined,
                evicted = report.evicted,
                spared = report.spared,
                "replica gc complete"
            );
        }
        report
    }

    /// Whether an expired replica survives under `spare_active`. Registry
    /// errors keep the replica for this pass.
    async fn spared(&self, campaign_id: Option<&str>) -> bool {
        if !self.policy.spare_active {
            return false;
        }
        let Some(id) = campaign_id else {
            return false;
        };
        match self.registry.campaign(id).await {
            Ok(Some(campaign)) => campaign.has_capacity(),
            Ok(None) => false,
            Err(e) => {
                debug!(campaign = %id, error = %e, "campaign lookup failed, keeping replica");
                true
            }
        }
    }

    fn evict_link(&self, link: &RegisteredLink) -> bool {
        if self.catalog.links().active_streams(&link.id).unwrap_or(0) > 0 {
            debug!(link = %link.id, "replica is streaming, eviction deferred");
            return false;
        }
        match self.catalog.links().remove(&link.id) {
            Ok(removed) => removed,
            Err(e) => {
                warn!(link = %link.id, error = %e, "failed to evict replica");
                false
            }
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval = ?self.interval,
            retention = ?self.policy.retention,
            spare_active = self.policy.spare_active,
            "replica gc loop starting"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.collect(chrono::Utc::now().timestamp()).await;
                }
                _ = shutdown.changed() => {
                    info!("replica gc loop shutting down");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogDb, LinkRegistry, Manifest, MediaRecord, MediaType, MirrorRecord, ReplicaInfo};
    use crate::config::SyncConfig;
    use crate::crypto::cipher;
    use crate::crypto::keys::NodeKeypair;
    use crate::identity::NodeIdentity;
    use crate::network::{MemoryPeerClient, PeerDirectory};
    use crate::registry::{Campaign, InMemoryRegistry};

    const DAY: i64 = 86_400;

    struct Fixture {
        catalog: Arc<CatalogStore>,
        registry: Arc<InMemoryRegistry>,
        tmp: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let identity = Arc::new(
            NodeIdentity::new(NodeKeypair::from_seed(&[9u8; 32]), "local", "http://203.0.113.90:7440", "global")
                .with_local_addrs(Vec::new()),
        );
        let registry = Arc::new(InMemoryRegistry::new());
        let directory = Arc::new(PeerDirectory::new(identity, registry.clone(), 4));
        let catalog = Arc::new(CatalogStore::new(
            CatalogDb::open_temporary().unwrap(),
            Arc::new(LinkRegistry::new(tmp.path().join("content"))),
            directory,
            Arc::new(MemoryPeerClient::new()),
            tmp.path().join("assets"),
            SyncConfig::default(),
            Duration::from_secs(1),
        ));
        Fixture { catalog, registry, tmp }
    }

    fn manifest(id: &str) -> Manifest {
        Manifest {
            id: id.into(),
            media_id: format!("media-{}", id),
            content_hash: "h".into(),
            title: "Spot".into(),
            description: None,
            media_type: MediaType::Ad,
            uploader_wallet: "0xaa".into(),
            season: None,
            episode: None,
            year: None,
            poster: None,
            backdrop: None,
            size: 4,
            created_at: 0,
            region: "global".into(),
            campaign_id: None,
        }
    }

    async fn add_replica(f: &Fixture, id: &str, campaign: &str, acquired_at: i64) {
        let staged = f.tmp.path().join(format!("{}.part", id));
        std::fs::write(&staged, vec![0u8; cipher::ciphertext_len(4) as usize]).unwrap();
        f.catalog
            .links()
            .adopt_replica(
                &staged,
                manifest(id),
                ReplicaInfo {
                    source: "origin".into(),
                    campaign_id: Some(campaign.into()),
                    acquired_at,
                },
            )
            .await
            .unwrap();
    }

    fn collector(f: &Fixture, spare_active: bool) -> GarbageCollector {
        GarbageCollector::new(
            f.catalog.clone(),
            f.registry.clone(),
            GcPolicy {
                retention: Duration::from_secs(30 * DAY as u64),
                spare_active,
            },
            Duration::from_secs(DAY as u64),
        )
    }

    fn campaign(id: &str, active: bool) -> Campaign {
        Campaign {
            id: id.into(),
            content_id: "x".into(),
            source: "origin".into(),
            title: "Spot".into(),
            active,
            views_remaining: 5,
            region: "global".into(),
            block: 1,
        }
    }

    #[tokio::test]
    async fn evicts_only_expired_replicas() {
        let f = fixture();
        let now = 100 * DAY;
        add_replica(&f, "old", "c1", now - 31 * DAY).await;
        add_replica(&f, "fresh", "c1", now - 2 * DAY).await;

        let gc = collector(&f, false);
        let report = gc.collect(now).await;
        assert_eq!(report.examined, 2);
        assert_eq!(report.evicted, 1);
        assert!(!f.catalog.links().contains("old"));
        assert!(f.catalog.links().contains("fresh"));
        assert!(!f.catalog.links().blob_path("old").exists());
        assert_eq!(gc.evicted(), 1);
    }

    #[tokio::test]
    async fn hosted_content_is_never_collected() {
        let f = fixture();
        let source = f.tmp.path().join("movie.bin");
        std::fs::write(&source, b"film").unwrap();
        let link = f
            .catalog
            .links()
            .ingest_file(&source, crate::catalog::IngestRequest::new("Film", "0xaa"))
            .await
            .unwrap();

        let report = collector(&f, false).collect(i64::MAX / 2).await;
        assert_eq!(report.examined, 0);
        assert!(f.catalog.links().contains(&link.id));
    }

    #[tokio::test]
    async fn spare_active_keeps_live_campaigns() {
        let f = fixture();
        let now = 100 * DAY;
        add_replica(&f, "live", "c-live", now - 40 * DAY).await;
        add_replica(&f, "dead", "c-dead", now - 40 * DAY).await;
        f.registry.put_campaign(campaign("c-live", true));
        f.registry.put_campaign(campaign("c-dead", false));

        let report = collector(&f, true).collect(now).await;
        assert_eq!(report.spared, 1);
        assert_eq!(report.evicted, 1);
        assert!(f.catalog.links().contains("live"));

        // Without the flag age alone decides.
        let report = collector(&f, false).collect(now).await;
        assert_eq!(report.evicted, 1);
        assert!(f.catalog.links().is_empty());
    }

    #[tokio::test]
    async fn streaming_replica_is_deferred() {
        let f = fixture();
        let now = 100 * DAY;
        add_replica(&f, "busy", "c1", now - 40 * DAY).await;
        f.catalog.links().try_acquire_stream("busy").unwrap();

        let gc = collector(&f, false);
        assert_eq!(gc.collect(now).await.evicted, 0);
        f.catalog.links().release_stream("busy");
        assert_eq!(gc.collect(now).await.evicted, 1);
    }

    #[tokio::test]
    async fn expired_metadata_mirrors_are_dropped() {
        let f = fixture();
        let now = 100 * DAY;
        let m = manifest("meta");
        f.catalog
            .db()
            .put_mirror(
                &MediaRecord::from(&m),
                &MirrorRecord {
                    media_id: m.media_id.clone(),
                    campaign_id: None,
                    acquired_at: now - 31 * DAY,
                },
            )
            .unwrap();

        let report = collector(&f, true).collect(now).await;
        assert_eq!(report.evicted, 1);
        assert!(!f.catalog.db().has_media(&m.media_id).unwrap());
    }

    #[test]
    fn policy_defaults_to_age_only() {
        let policy = GcPolicy::default();
        assert!(!policy.spare_active);
        assert_eq!(policy.retention, ReplicationConfig::default().retention);
    }
}
