//! # Replication Scheduler
//!
//! Polls the registry for campaigns published since the last processed
//! block and decides, per content id, whether this node mirrors the
//! metadata, the encrypted bytes, or both.
//!
//! ## Data copies
//!
//! A byte copy is only attempted when all of these hold:
//!
//! 1. the bucket decision (or region affinity) says yes,
//! 2. the campaign is active with views remaining,
//! 3. the data disk is below the usage threshold,
//! 4. this node does not already host the item.
//!
//! Region affinity overrides the random draw when both the node and the
//! campaign name a region: matching regions replicate, others never do.
//!
//! Downloads land in the staging directory and are adopted into the link
//! registry only after the size check passes, so a half-written blob is
//! never served. A download is cut off once it passes the size the
//! manifest implies. Manifests must name the campaign's media id and a
//! link id that is safe as a file name; otherwise the next peer is asked.
//!
//! The cursor only advances after a batch has been processed. A crash
//! mid-batch re-reads it, and every step is idempotent.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::bucket::ReplicaDecision;
use super::disk::{has_disk_budget, DiskUsage};
use crate::catalog::{is_safe_name, CatalogStore, Manifest, MediaRecord, MirrorRecord, ReplicaInfo};
use crate::config::{is_global_region, ReplicationConfig};
use crate::crypto::cipher::ciphertext_len;
use crate::network::{PeerClient, PeerDirectory, PeerRecord};
use crate::registry::{Campaign, RegistryError};

#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("registry: {0}")]
    Registry(#[from] RegistryError),

    #[error("cursor file: {0}")]
    Cursor(#[from] std::io::Error),

    #[error("cursor file is malformed: {0}")]
    CursorFormat(#[from] serde_json::Error),
}

/// Persisted position in the registry's campaign feed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub last_block: u64,
}

impl SyncCursor {
    /// Reads the cursor, starting from block zero when the file is absent.
    pub fn load(path: &Path) -> Result<Self, ReplicationError> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ReplicationError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Tally of one poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub campaigns: usize,
    pub metadata_mirrored: usize,
    pub data_acquired: usize,
    pub skipped_inactive: usize,
    pub skipped_disk: usize,
    pub failed: usize,
    pub cursor: u64,
}

pub struct ReplicationScheduler {
    catalog: Arc<CatalogStore>,
    directory: Arc<PeerDirectory>,
    client: Arc<dyn PeerClient>,
    disk: Arc<dyn DiskUsage>,
    config: ReplicationConfig,
    staging_dir: PathBuf,
    cursor_path: PathBuf,
    request_timeout: Duration,
    polls: AtomicU64,
    acquired: AtomicU64,
}

impl ReplicationScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalog: Arc<CatalogStore>,
        directory: Arc<PeerDirectory>,
        client: Arc<dyn PeerClient>,
        disk: Arc<dyn DiskUsage>,
        config: ReplicationConfig,
        staging_dir: impl Into<PathBuf>,
        cursor_path: impl Into<PathBuf>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            catalog,
            directory,
            client,
            disk,
            config,
            staging_dir: staging_dir.into(),
            cursor_path: cursor_path.into(),
            request_timeout,
            polls: AtomicU64::new(0),
            acquired: AtomicU64::new(0),
        }
    }

    pub fn polls(&self) -> u64 {
        self.polls.load(Ordering::Relaxed)
    }

    /// Byte replicas acquired since start.
    pub fn acquired(&self) -> u64 {
        self.acquired.load(Ordering::Relaxed)
    }

    pub fn cursor(&self) -> Result<SyncCursor, ReplicationError> {
        SyncCursor::load(&self.cursor_path)
    }

    /// The decision for one campaign on this node, region affinity applied.
    pub fn decide(&self, campaign: &Campaign) -> ReplicaDecision {
        let identity = self.directory.identity();
        let mut decision = ReplicaDecision::evaluate(
            &identity.address(),
            &campaign.content_id,
            self.config.metadata_rate,
            self.config.data_rate,
        );
        if identity.is_region_scoped() && !is_global_region(&campaign.region) {
            decision.data = identity.region().eq_ignore_ascii_case(&campaign.region);
        }
        decision
    }

    // -----------------------------------------------------------------------
    // Poll
    // -----------------------------------------------------------------------

    /// Processes every campaign published since the cursor, then advances it.
    pub async fn poll_once(&self) -> Result<PollReport, ReplicationError> {
        let cursor = SyncCursor::load(&self.cursor_path)?;
        let batch = self
            .directory
            .registry()
            .campaigns_since(cursor.last_block)
            .await?;

        let mut report = PollReport {
            campaigns: batch.campaigns.len(),
            cursor: cursor.last_block,
            ..PollReport::default()
        };
        for campaign in &batch.campaigns {
            self.process(campaign, &mut report).await;
        }

        let next = SyncCursor {
            last_block: batch.latest_block.max(cursor.last_block),
        };
        if next != cursor {
            next.save(&self.cursor_path)?;
        }
        report.cursor = next.last_block;
        self.polls.fetch_add(1, Ordering::Relaxed);

        if report.campaigns > 0 {
            info!(
                campaigns = report.campaigns,
                metadata = report.metadata_mirrored,
                data = report.data_acquired,
                failed = report.failed,
                cursor = report.cursor,
                "replication poll complete"
            );
        }
        Ok(report)
    }

    async fn process(&self, campaign: &Campaign, report: &mut PollReport) {
        let decision = self.decide(campaign);
        if !decision.metadata && !decision.data {
            return;
        }
        let db = self.catalog.db();
        let content_id = campaign.content_id.as_str();

        let mut manifest = None;
        if decision.metadata && !db.has_media(content_id).unwrap_or(false) {
            match self.acquire_manifest(content_id).await {
                Some((peer, m)) => {
                    let mirror = MirrorRecord {
                        media_id: m.media_id.clone(),
                        campaign_id: Some(campaign.id.clone()),
                        acquired_at: chrono::Utc::now().timestamp(),
                    };
                    match db.put_mirror(&MediaRecord::from(&m), &mirror) {
                        Ok(()) => {
                            self.catalog.hydrate_assets(&peer.endpoint, &m).await;
                            report.metadata_mirrored += 1;
                            debug!(content = %content_id, peer = %peer.name, "metadata mirrored");
                        }
                        Err(e) => {
                            warn!(content = %content_id, error = %e, "failed to store mirrored metadata");
                            report.failed += 1;
                        }
                    }
                    manifest = Some(m);
                }
                None => report.failed += 1,
            }
        }

        if !decision.data {
            return;
        }
        if !campaign.has_capacity() {
            debug!(campaign = %campaign.id, "campaign inactive or exhausted, no data copy");
            report.skipped_inactive += 1;
            return;
        }
        if self.catalog.links().find_by_media(content_id).is_some() || self.catalog.links().contains(content_id) {
            return;
        }
        let links_dir = self.catalog.links().content_dir().to_path_buf();
        if !has_disk_budget(self.disk.as_ref(), &links_dir, self.config.disk_threshold_percent) {
            debug!(campaign = %campaign.id, "disk above threshold, no data copy");
            report.skipped_disk += 1;
            return;
        }

        let manifest = match manifest {
            Some(m) => Some(m),
            None => self.acquire_manifest(content_id).await.map(|(_, m)| m),
        };
        let Some(manifest) = manifest else {
            report.failed += 1;
            return;
        };
        if self.catalog.links().contains(&manifest.id) {
            return;
        }

        if self.acquire_data(campaign, manifest).await {
            report.data_acquired += 1;
            self.acquired.fetch_add(1, Ordering::Relaxed);
        } else {
            report.failed += 1;
        }
    }

    // -----------------------------------------------------------------------
    // Acquisition
    // -----------------------------------------------------------------------

    /// Known peers in random order.
    fn candidates(&self) -> Vec<PeerRecord> {
        let mut peers = self.directory.all();
        peers.shuffle(&mut rand::thread_rng());
        peers
    }

    /// First manifest any peer returns for `content_id`.
    async fn acquire_manifest(&self, content_id: &str) -> Option<(PeerRecord, Manifest)> {
        for peer in self.candidates() {
            let fetched = tokio::time::timeout(
                self.request_timeout,
                self.client.fetch_manifest(&peer.endpoint, content_id),
            )
            .await;
            match fetched {
                Ok(Ok(manifest)) if manifest.media_id != content_id => warn!(
                    peer = %peer.name,
                    content = %content_id,
                    manifest = %manifest.media_id,
                    "manifest is for other media"
                ),
                Ok(Ok(manifest)) if !is_safe_name(&manifest.id) => warn!(
                    peer = %peer.name,
                    content = %content_id,
                    link = ?manifest.id,
                    "manifest carries an unsafe link id"
                ),
                Ok(Ok(manifest)) => return Some((peer, manifest)),
                Ok(Err(e)) => debug!(peer = %peer.name, content = %content_id, error = %e, "manifest unavailable"),
                Err(_) => debug!(peer = %peer.name, content = %content_id, "manifest fetch timed out"),
            }
        }
        debug!(content = %content_id, "no peer returned a manifest");
        None
    }

    /// Downloads the encrypted blob from the first peer that delivers a
    /// complete copy, then registers it.
    async fn acquire_data(&self, campaign: &Campaign, manifest: Manifest) -> bool {
        if let Err(e) = tokio::fs::create_dir_all(&self.staging_dir).await {
            warn!(dir = %self.staging_dir.display(), error = %e, "cannot create staging dir");
            return false;
        }

        let expected = ciphertext_len(manifest.size);
        for peer in self.candidates() {
            let staged = self
                .staging_dir
                .join(format!("{}.{}.part", manifest.id, uuid::Uuid::new_v4()));
            match self
                .client
                .download_content(&peer.endpoint, &campaign.content_id, &staged, expected)
                .await
            {
                Ok(bytes) => {
                    let info = ReplicaInfo {
                        source: peer.name.clone(),
                        campaign_id: Some(campaign.id.clone()),
                        acquired_at: chrono::Utc::now().timestamp(),
                    };
                    match self.catalog.links().adopt_replica(&staged, manifest.clone(), info).await {
                        Ok(link) => {
                            info!(link = %link.id, peer = %peer.name, bytes, "replica acquired");
                            return true;
                        }
                        Err(e) => {
                            warn!(peer = %peer.name, content = %campaign.content_id, error = %e, "replica rejected");
                        }
                    }
                }
                Err(e) => {
                    debug!(peer = %peer.name, content = %campaign.content_id, error = %e, "download failed");
                }
            }
            let _ = tokio::fs::remove_file(&staged).await;
        }
        false
    }

    // -----------------------------------------------------------------------
    // Loop
    // -----------------------------------------------------------------------

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.config.poll_interval, "replication loop starting");
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        warn!(error = %e, "replication poll failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("replication loop shutting down");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogDb, LinkRegistry, MediaType};
    use crate::config::SyncConfig;
    use crate::crypto::cipher;
    use crate::crypto::keys::NodeKeypair;
    use crate::crypto::signatures::sign_node_claim;
    use crate::identity::NodeIdentity;
    use crate::network::{MemoryPeerClient, PeerError, SimulatedPeer};
    use crate::registry::InMemoryRegistry;
    use crate::replication::disk::FixedUsage;

    const PEER: &str = "http://10.4.0.1:7440";

    struct Fixture {
        scheduler: ReplicationScheduler,
        catalog: Arc<CatalogStore>,
        registry: Arc<InMemoryRegistry>,
        client: Arc<MemoryPeerClient>,
        tmp: tempfile::TempDir,
    }

    fn fixture(region: &str, config: ReplicationConfig, disk: Option<u64>) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let identity = Arc::new(
            NodeIdentity::new(NodeKeypair::from_seed(&[8u8; 32]), "local", "http://203.0.113.80:7440", region)
                .with_local_addrs(Vec::new()),
        );
        let registry = Arc::new(InMemoryRegistry::new());
        let directory = Arc::new(PeerDirectory::new(identity, registry.clone(), 4));
        let kp = NodeKeypair::generate();
        directory.upsert(PeerRecord {
            name: "origin".into(),
            endpoint: PEER.into(),
            last_seen: 0,
            signature: Some(sign_node_claim(&kp, "origin", PEER)),
            wallet_address: Some(kp.address()),
            is_trusted: true,
        });

        let client = Arc::new(MemoryPeerClient::new());
        let catalog = Arc::new(CatalogStore::new(
            CatalogDb::open_temporary().unwrap(),
            Arc::new(LinkRegistry::new(tmp.path().join("content"))),
            directory.clone(),
            client.clone(),
            tmp.path().join("assets"),
            SyncConfig::default(),
            Duration::from_secs(1),
        ));
        let scheduler = ReplicationScheduler::new(
            catalog.clone(),
            directory,
            client.clone(),
            Arc::new(FixedUsage(disk)),
            config,
            tmp.path().join("staging"),
            tmp.path().join("cursor.json"),
            Duration::from_secs(1),
        );
        Fixture {
            scheduler,
            catalog,
            registry,
            client,
            tmp,
        }
    }

    fn always() -> ReplicationConfig {
        ReplicationConfig {
            metadata_rate: 1.0,
            data_rate: 1.0,
            ..ReplicationConfig::default()
        }
    }

    fn campaign(id: &str, content: &str, block: u64) -> Campaign {
        Campaign {
            id: id.into(),
            content_id: content.into(),
            source: "origin".into(),
            title: "Spot".into(),
            active: true,
            views_remaining: 10,
            region: "global".into(),
            block,
        }
    }

    /// Serves a manifest plus a correctly sized ciphertext for `content`.
    fn serve_item(f: &Fixture, content: &str, plaintext: &[u8]) -> Manifest {
        let key = cipher::ContentKey::generate();
        let (ciphertext, content_hash) = cipher::encrypt(&key, plaintext).unwrap();
        let manifest = Manifest {
            id: format!("link-{}", content),
            media_id: content.into(),
            content_hash,
            title: "Spot".into(),
            description: None,
            media_type: MediaType::Ad,
            uploader_wallet: "0xaa".into(),
            season: None,
            episode: None,
            year: None,
            poster: None,
            backdrop: None,
            size: plaintext.len() as u64,
            created_at: 0,
            region: "global".into(),
            campaign_id: None,
        };
        f.client.serve(
            PEER,
            SimulatedPeer {
                manifests: [(content.to_string(), manifest.clone())].into(),
                content: [(content.to_string(), ciphertext)].into(),
                ..SimulatedPeer::default()
            },
        );
        manifest
    }

    #[tokio::test]
    async fn acquires_metadata_and_data() {
        let f = fixture("global", always(), Some(10));
        serve_item(&f, "m1", b"advert bytes");
        let decision = f.scheduler.decide(&campaign("c1", "m1", 1));
        assert!(decision.data && decision.metadata);

        f.registry.put_campaign(campaign("c1", "m1", 1));
        let report = f.scheduler.poll_once().await.unwrap();
        assert_eq!(report.metadata_mirrored, 1);
        assert_eq!(report.data_acquired, 1);
        assert_eq!(report.cursor, 1);

        assert!(f.catalog.db().has_media("m1").unwrap());
        let link = f.catalog.links().get("link-m1").unwrap();
        assert!(link.is_replica());
        assert!(link.key.is_none());
        assert_eq!(link.replica.unwrap().campaign_id.as_deref(), Some("c1"));
        assert_eq!(f.scheduler.acquired(), 1);
        // Staging is left empty.
        let staged = std::fs::read_dir(f.tmp.path().join("staging")).unwrap().count();
        assert_eq!(staged, 0);
    }

    #[tokio::test]
    async fn cursor_advances_and_persists() {
        let never = ReplicationConfig {
            metadata_rate: 0.0,
            data_rate: 0.0,
            ..ReplicationConfig::default()
        };
        let f = fixture("global", never, None);
        f.registry.put_campaign(campaign("c1", "m1", 3));
        f.registry.put_campaign(campaign("c2", "m2", 7));

        let first = f.scheduler.poll_once().await.unwrap();
        assert_eq!(first.campaigns, 2);
        assert_eq!(f.scheduler.cursor().unwrap().last_block, 7);

        let second = f.scheduler.poll_once().await.unwrap();
        assert_eq!(second.campaigns, 0);
        assert_eq!(second.cursor, 7);
        assert_eq!(f.scheduler.polls(), 2);
    }

    #[tokio::test]
    async fn inactive_campaign_gets_metadata_only() {
        let f = fixture("global", always(), Some(10));
        serve_item(&f, "m1", b"bytes");
        let mut c = campaign("c1", "m1", 1);
        c.views_remaining = 0;
        f.registry.put_campaign(c);

        let report = f.scheduler.poll_once().await.unwrap();
        assert_eq!(report.metadata_mirrored, 1);
        assert_eq!(report.skipped_inactive, 1);
        assert!(f.catalog.links().is_empty());
    }

    #[tokio::test]
    async fn full_disk_blocks_data() {
        let f = fixture("global", always(), Some(95));
        serve_item(&f, "m1", b"bytes");
        f.registry.put_campaign(campaign("c1", "m1", 1));
        let report = f.scheduler.poll_once().await.unwrap();
        assert_eq!(report.skipped_disk, 1);
        assert!(f.catalog.links().is_empty());
    }

    #[tokio::test]
    async fn truncated_download_is_discarded() {
        let f = fixture("global", always(), None);
        serve_item(&f, "m1", &vec![7u8; 200_000]);
        f.client.break_download(PEER, "m1");
        f.registry.put_campaign(campaign("c1", "m1", 1));

        let report = f.scheduler.poll_once().await.unwrap();
        assert_eq!(report.data_acquired, 0);
        assert_eq!(report.failed, 1);
        assert!(f.catalog.links().is_empty());
        let staged = std::fs::read_dir(f.tmp.path().join("staging")).unwrap().count();
        assert_eq!(staged, 0);
    }

    #[tokio::test]
    async fn wrong_size_blob_is_rejected() {
        let f = fixture("global", always(), None);
        serve_item(&f, "m1", b"original");
        f.client.update(PEER, |p| {
            p.content.insert("m1".into(), b"short".to_vec());
        });
        f.registry.put_campaign(campaign("c1", "m1", 1));
        let report = f.scheduler.poll_once().await.unwrap();
        assert_eq!(report.data_acquired, 0);
        assert!(f.catalog.links().is_empty());
    }

    #[tokio::test]
    async fn oversized_download_is_cut_off() {
        let f = fixture("global", always(), None);
        let manifest = serve_item(&f, "m1", b"advert bytes");
        let expected = cipher::ciphertext_len(manifest.size) as usize;
        f.client.update(PEER, |p| {
            p.content.get_mut("m1").unwrap().extend(vec![0u8; 1 << 20]);
        });

        let staged = f.tmp.path().join("capped.part");
        let err = f
            .client
            .download_content(PEER, "m1", &staged, expected as u64)
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::TooLarge { .. }));
        assert!(std::fs::metadata(&staged).unwrap().len() <= expected as u64);

        f.registry.put_campaign(campaign("c1", "m1", 1));
        let report = f.scheduler.poll_once().await.unwrap();
        assert_eq!(report.data_acquired, 0);
        assert_eq!(report.failed, 1);
        assert!(f.catalog.links().is_empty());
        let staged = std::fs::read_dir(f.tmp.path().join("staging")).unwrap().count();
        assert_eq!(staged, 0);
    }

    #[tokio::test]
    async fn manifest_for_other_media_is_ignored() {
        let f = fixture("global", always(), None);
        let mut manifest = serve_item(&f, "m1", b"advert bytes");
        manifest.media_id = "m2".into();
        f.client.update(PEER, |p| {
            p.manifests.insert("m1".into(), manifest);
        });
        f.registry.put_campaign(campaign("c1", "m1", 1));

        let report = f.scheduler.poll_once().await.unwrap();
        assert_eq!(report.metadata_mirrored, 0);
        assert_eq!(report.data_acquired, 0);
        assert!(!f.catalog.db().has_media("m1").unwrap());
        assert!(!f.catalog.db().has_media("m2").unwrap());
        assert!(f.catalog.db().mirrors().unwrap().is_empty());
        assert!(f.catalog.links().is_empty());
    }

    #[tokio::test]
    async fn unsafe_link_id_is_never_written() {
        let f = fixture("global", always(), None);
        let mut manifest = serve_item(&f, "m1", b"advert bytes");
        manifest.id = "../../escaped".into();
        f.client.update(PEER, |p| {
            p.manifests.insert("m1".into(), manifest);
        });
        f.registry.put_campaign(campaign("c1", "m1", 1));

        let report = f.scheduler.poll_once().await.unwrap();
        assert_eq!(report.data_acquired, 0);
        assert!(f.catalog.links().is_empty());
        let outside = f.tmp.path().parent().unwrap();
        assert!(!outside.join("escaped.bin").exists());
        assert!(!outside.join("escaped.json").exists());
    }

    #[test]
    fn region_affinity_overrides_draw() {
        let zero = ReplicationConfig {
            metadata_rate: 0.0,
            data_rate: 0.0,
            ..ReplicationConfig::default()
        };
        let f = fixture("eu-west", zero, None);
        let mut c = campaign("c1", "m1", 1);

        c.region = "EU-WEST".into();
        assert!(f.scheduler.decide(&c).data);
        assert!(!f.scheduler.decide(&c).metadata);

        c.region = "us-east".into();
        assert!(!f.scheduler.decide(&c).data);

        // A global campaign falls back to the draw.
        c.region = "global".into();
        assert!(!f.scheduler.decide(&c).data);
    }

    #[test]
    fn global_node_ignores_campaign_region() {
        let f = fixture("global", always(), None);
        let mut c = campaign("c1", "m1", 1);
        c.region = "us-east".into();
        let expected = ReplicaDecision::evaluate(&f.scheduler.directory.identity().address(), "m1", 1.0, 1.0);
        assert_eq!(f.scheduler.decide(&c), expected);
    }

    #[test]
    fn cursor_file_round_trip_and_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("cursor.json");
        assert_eq!(SyncCursor::load(&path).unwrap(), SyncCursor::default());
        SyncCursor { last_block: 42 }.save(&path).unwrap();
        assert_eq!(SyncCursor::load(&path).unwrap().last_block, 42);

        std::fs::write(&path, b"not json").unwrap();
        assert!(matches!(SyncCursor::load(&path), Err(ReplicationError::CursorFormat(_))));
    }
}
