//! # Catalog Reconciliation
//!
//! Each cycle pulls `/catalog` from a small random set of trusted peers
//! and folds what they list into the local catalog db.
//!
//! ## Rules
//!
//! 1. Media this node knows nothing about is never invented from a
//!    listing. The peer's manifest is fetched first; if that fails the item
//!    is skipped until a later cycle.
//! 2. A manifest whose `media_id` disagrees with the listing is discarded.
//! 3. Known media gets an entry per `(media_id, uploader)`: created when
//!    absent, otherwise only `authority` moves to the listing peer.
//! 4. Nothing is deleted because a peer stopped listing it.
//!
//! Posters and backdrops are copied opportunistically; failures there are
//! ignored.
//!
//! A single in-flight flag keeps cycles from overlapping when a slow cycle
//! runs into the next tick.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::db::{CatalogDb, DbError, RemoteUpsert, VoteOutcome};
use super::entry::{CatalogEntry, ContentSummary, Manifest, MediaRecord};
use super::links::{is_safe_name, IngestRequest, LinkError, LinkRegistry, RegisteredLink};
use crate::config::SyncConfig;
use crate::crypto::keys::RecoverableSignature;
use crate::crypto::signatures::{recover, vote_message};
use crate::identity::endpoint::{endpoint_from_literal, is_address_literal};
use crate::network::{PeerClient, PeerDirectory, PeerRecord};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog db: {0}")]
    Db(#[from] DbError),

    #[error("link store: {0}")]
    Link(#[from] LinkError),

    #[error("vote signature does not verify")]
    BadVote,
}

/// Tally of one reconciliation cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub peers_contacted: usize,
    pub peers_failed: usize,
    pub created: usize,
    pub moved: usize,
    pub skipped: usize,
    pub hydrated: usize,
}

/// Clears the in-flight flag on every exit path.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct CatalogStore {
    db: CatalogDb,
    links: Arc<LinkRegistry>,
    directory: Arc<PeerDirectory>,
    client: Arc<dyn PeerClient>,
    asset_dir: PathBuf,
    config: SyncConfig,
    request_timeout: Duration,
    in_flight: AtomicBool,
    cycles: AtomicU64,
}

impl CatalogStore {
    pub fn new(
        db: CatalogDb,
        links: Arc<LinkRegistry>,
        directory: Arc<PeerDirectory>,
        client: Arc<dyn PeerClient>,
        asset_dir: impl Into<PathBuf>,
        config: SyncConfig,
        request_timeout: Duration,
    ) -> Self {
        Self {
            db,
            links,
            directory,
            client,
            asset_dir: asset_dir.into(),
            config,
            request_timeout,
            in_flight: AtomicBool::new(false),
            cycles: AtomicU64::new(0),
        }
    }

    pub fn db(&self) -> &CatalogDb {
        &self.db
    }

    pub fn links(&self) -> &Arc<LinkRegistry> {
        &self.links
    }

    pub fn asset_dir(&self) -> &Path {
        &self.asset_dir
    }

    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub fn is_syncing(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    // -----------------------------------------------------------------------
    // Reconciliation
    // -----------------------------------------------------------------------

    /// Runs one cycle. `None` when another cycle is still running.
    pub async fn sync_once(&self) -> Option<SyncReport> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("catalog sync already in flight, skipping");
            return None;
        }
        let _guard = InFlight(&self.in_flight);

        let mut report = SyncReport::default();
        for peer in self.directory.sample(self.config.peers_per_cycle) {
            report.peers_contacted += 1;
            let listing =
                tokio::time::timeout(self.request_timeout, self.client.fetch_catalog(&peer.endpoint)).await;
            let items = match listing {
                Ok(Ok(items)) => items,
                Ok(Err(e)) => {
                    debug!(peer = %peer.name, error = %e, "catalog fetch failed");
                    report.peers_failed += 1;
                    continue;
                }
                Err(_) => {
                    debug!(peer = %peer.name, "catalog fetch timed out");
                    report.peers_failed += 1;
                    continue;
                }
            };

            for item in items {
                if let Err(e) = self.sync_item(&peer, &item, &mut report).await {
                    warn!(peer = %peer.name, media = %item.media_id, error = %e, "catalog item not applied");
                    report.skipped += 1;
                }
            }
        }

        self.cycles.fetch_add(1, Ordering::Relaxed);
        info!(
            peers = report.peers_contacted,
            failed = report.peers_failed,
            created = report.created,
            moved = report.moved,
            skipped = report.skipped,
            "catalog sync complete"
        );
        Some(report)
    }

    async fn sync_item(
        &self,
        peer: &PeerRecord,
        item: &ContentSummary,
        report: &mut SyncReport,
    ) -> Result<(), CatalogError> {
        if item.media_id.is_empty() || item.uploader_wallet.is_empty() {
            report.skipped += 1;
            return Ok(());
        }

        if !self.db.has_media(&item.media_id)? {
            let Some(manifest) = self.hydrate_manifest(peer, item).await else {
                report.skipped += 1;
                return Ok(());
            };
            self.db.put_media(&MediaRecord::from(&manifest))?;
            self.hydrate_assets(&peer.endpoint, &manifest).await;
            report.hydrated += 1;
        }

        match self.db.upsert_remote(item, &peer.name)? {
            RemoteUpsert::Created(entry) => {
                debug!(media = %entry.media_id, authority = %entry.authority, "catalog entry created");
                report.created += 1;
            }
            RemoteUpsert::AuthorityChanged { from, entry } => {
                debug!(media = %entry.media_id, %from, to = %entry.authority, "authority moved");
                report.moved += 1;
            }
            RemoteUpsert::Unchanged => {}
        }
        Ok(())
    }

    /// The peer's manifest for `item`, if it can be fetched and describes
    /// the same media.
    async fn hydrate_manifest(&self, peer: &PeerRecord, item: &ContentSummary) -> Option<Manifest> {
        let fetched = tokio::time::timeout(
            self.request_timeout,
            self.client.fetch_manifest(&peer.endpoint, &item.id),
        )
        .await;
        let manifest = match fetched {
            Ok(Ok(m)) => m,
            Ok(Err(e)) => {
                debug!(peer = %peer.name, item = %item.id, error = %e, "manifest fetch failed");
                return None;
            }
            Err(_) => {
                debug!(peer = %peer.name, item = %item.id, "manifest fetch timed out");
                return None;
            }
        };
        if manifest.media_id != item.media_id {
            warn!(
                peer = %peer.name,
                listed = %item.media_id,
                manifest = %manifest.media_id,
                "manifest media id disagrees with listing"
            );
            return None;
        }
        Some(manifest)
    }

    /// Copies referenced assets not already cached. Best effort.
    pub async fn hydrate_assets(&self, endpoint: &str, manifest: &Manifest) -> usize {
        let mut copied = 0;
        for name in manifest.assets() {
            let Some(dest) = self.asset_path(name) else {
                debug!(asset = %name, "ignoring unsafe asset name");
                continue;
            };
            if dest.exists() {
                continue;
            }
            let fetched = tokio::time::timeout(self.request_timeout, self.client.fetch_asset(endpoint, name)).await;
            let Ok(Ok(bytes)) = fetched else {
                continue;
            };
            if tokio::fs::create_dir_all(&self.asset_dir).await.is_ok()
                && tokio::fs::write(&dest, bytes).await.is_ok()
            {
                copied += 1;
            }
        }
        copied
    }

    /// Asset path for a bare file name; `None` for anything with a path
    /// component.
    pub fn asset_path(&self, name: &str) -> Option<PathBuf> {
        is_safe_name(name).then(|| self.asset_dir.join(name))
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// An endpoint for the entry's authority, resolved now. Falls back to
    /// treating the authority as a host name when resolution fails.
    pub async fn resolve_authority(&self, entry: &CatalogEntry) -> String {
        let authority = entry.authority.as_str();
        if is_address_literal(authority) {
            if let Some(endpoint) = endpoint_from_literal(authority) {
                return endpoint;
            }
        }
        if let Some(endpoint) = self.directory.resolve(authority).await {
            return endpoint;
        }
        endpoint_from_literal(authority).unwrap_or_else(|| format!("http://{}", authority))
    }

    pub fn entries(&self) -> Result<Vec<CatalogEntry>, CatalogError> {
        Ok(self.db.list_entries()?)
    }

    // -----------------------------------------------------------------------
    // Writes outside sync
    // -----------------------------------------------------------------------

    /// Encrypts and hosts a local file, records its media, and lists it
    /// under this node's own name.
    pub async fn ingest(&self, source: &Path, request: IngestRequest) -> Result<RegisteredLink, CatalogError> {
        let link = self.links.ingest_file(source, request).await?;
        self.db.put_media(&MediaRecord::from(&link.manifest))?;
        let own_name = self.directory.identity().name().to_string();
        self.db.upsert_remote(&link.manifest.summary(), &own_name)?;
        Ok(link)
    }

    /// Applies a signed vote over `VOTE:<mediaId>:<uploader>:<up|down>`.
    pub fn record_vote(
        &self,
        media_id: &str,
        uploader: &str,
        upvote: bool,
        signature: &RecoverableSignature,
    ) -> Result<VoteOutcome, CatalogError> {
        let message = vote_message(media_id, uploader, upvote);
        let voter = recover(&message, signature).map_err(|_| CatalogError::BadVote)?;
        let outcome = self.db.apply_vote(media_id, uploader, &voter, upvote)?;
        if let VoteOutcome::Applied(entry) = &outcome {
            debug!(media = %media_id, %voter, trust = entry.trust_score, "vote applied");
        }
        Ok(outcome)
    }

    // -----------------------------------------------------------------------
    // Loop
    // -----------------------------------------------------------------------

    /// Reconcile every `interval` until shutdown. The first tick fires at
    /// once, which is the startup pull.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.config.interval, "catalog sync loop starting");
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sync_once().await;
                }
                _ = shutdown.changed() => {
                    info!("catalog sync loop shutting down");
                    return;
                }
            }
        }
    }
}
