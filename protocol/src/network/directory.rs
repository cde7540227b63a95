//! # Peer Directory
//!
//! The known-peers table and the trust rules that guard it.
//!
//! ## Admission
//!
//! A claim `(name, endpoint, signature)` is admitted only when the signer
//! recovered from `NODE:<name>:<endpoint>` is the identity the claim names:
//!
//! - a registry name: the registry's `node_address` for that name, and the
//!   registry record must be live;
//! - a raw address: that address;
//! - an unregistered name: whoever signed it (anonymous node).
//!
//! Entries failing any of this are dropped without an error. Claims about
//! this node itself are never stored.
//!
//! ## Concurrency
//!
//! The table is a `parking_lot::RwLock<HashMap>` keyed by peer name. No
//! lock is held across an `.await`: verification runs first, and the write
//! lock is only taken for the final upsert.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use super::peer::{PeerEntry, PeerRecord};
use crate::crypto::signatures::{addresses_match, node_claim_message, recover};
use crate::identity::endpoint::{endpoint_from_literal, is_address_literal, normalize_endpoint};
use crate::identity::NodeIdentity;
use crate::registry::{is_registry_name, is_wallet_address, Registry};

/// Result of an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Updated,
    /// Same claim as before; only `last_seen` moved.
    Unchanged,
}

pub struct PeerDirectory {
    identity: Arc<NodeIdentity>,
    registry: Arc<dyn Registry>,
    peers: RwLock<HashMap<String, PeerRecord>>,
    max_concurrency: usize,
}

impl PeerDirectory {
    pub fn new(identity: Arc<NodeIdentity>, registry: Arc<dyn Registry>, max_concurrency: usize) -> Self {
        Self {
            identity,
            registry,
            peers: RwLock::new(HashMap::new()),
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn identity(&self) -> &Arc<NodeIdentity> {
        &self.identity
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    // -----------------------------------------------------------------------
    // Verification
    // -----------------------------------------------------------------------

    /// Checks a claim and, when it holds, returns the record to store.
    pub async fn verify_entry(&self, entry: &PeerEntry) -> Option<PeerRecord> {
        let signature = entry.signature.as_ref()?;
        normalize_endpoint(&entry.endpoint)?;

        // Stored as sent: the signature covers these exact bytes and the
        // record is re-gossiped verbatim.
        let message = node_claim_message(&entry.name, &entry.endpoint);
        let signer = match recover(&message, signature) {
            Ok(addr) => addr,
            Err(_) => {
                debug!(peer = %entry.name, "dropping claim with bad signature");
                return None;
            }
        };

        if let Some(claimed) = entry.wallet_address.as_deref() {
            if !addresses_match(claimed, &signer) {
                debug!(peer = %entry.name, "claimed wallet does not match signer");
                return None;
            }
        }

        if is_wallet_address(&entry.name) {
            if !addresses_match(&entry.name, &signer) {
                debug!(peer = %entry.name, "address-named claim signed by someone else");
                return None;
            }
        } else if is_registry_name(&entry.name) {
            match self.registry.get_node(&entry.name).await {
                Ok(Some(node)) => {
                    let now = chrono::Utc::now().timestamp();
                    if !node.is_live(now) || !addresses_match(&node.node_address, &signer) {
                        debug!(peer = %entry.name, "registry does not vouch for signer");
                        return None;
                    }
                }
                // Unregistered name: anonymous node, signer accepted as-is.
                Ok(None) => {}
                Err(e) => {
                    debug!(peer = %entry.name, error = %e, "registry unavailable, dropping claim");
                    return None;
                }
            }
        }

        Some(PeerRecord {
            name: entry.name.clone(),
            endpoint: entry.endpoint.clone(),
            last_seen: chrono::Utc::now().timestamp(),
            signature: Some(signature.clone()),
            wallet_address: Some(signer),
            is_trusted: true,
        })
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Verifies and upserts a batch of claims (gossip, `/peers`, tracker
    /// lists). Returns how many were admitted.
    pub async fn ingest(&self, entries: Vec<PeerEntry>) -> usize {
        let candidates: Vec<PeerEntry> = entries
            .into_iter()
            .filter(|e| !self.identity.is_self(&e.name, &e.endpoint))
            .collect();

        let verified: Vec<PeerRecord> = stream::iter(candidates)
            .map(|entry| async move { self.verify_entry(&entry).await })
            .buffer_unordered(self.max_concurrency)
            .filter_map(|r| async move { r })
            .collect()
            .await;

        let admitted = verified.len();
        for record in verified {
            self.upsert(record);
        }
        admitted
    }

    /// Inserts or refreshes a record. Self records are refused.
    pub fn upsert(&self, record: PeerRecord) -> Option<Upsert> {
        if self.identity.is_self(&record.name, &record.endpoint) {
            return None;
        }

        let mut peers = self.peers.write();
        match peers.get_mut(&record.name) {
            Some(existing) if existing.same_claim(&record) => {
                existing.last_seen = existing.last_seen.max(record.last_seen);
                Some(Upsert::Unchanged)
            }
            Some(existing) => {
                // An unsigned registry record never downgrades a verified one.
                if existing.signature.is_some() && record.signature.is_none() {
                    existing.last_seen = existing.last_seen.max(record.last_seen);
                    return Some(Upsert::Unchanged);
                }
                *existing = record;
                Some(Upsert::Updated)
            }
            None => {
                peers.insert(record.name.clone(), record);
                Some(Upsert::Inserted)
            }
        }
    }

    /// Seeds the table from the registry's recently active nodes. Unknown
    /// peers are added, trusted only when the registry attests their
    /// address.
    pub async fn bootstrap(&self, limit: usize) -> usize {
        let nodes = match self.registry.bootstrap_nodes(limit).await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "registry bootstrap failed");
                return 0;
            }
        };

        let mut added = 0;
        for (name, ip) in nodes.pairs() {
            let Some(endpoint) = endpoint_from_literal(ip) else {
                debug!(peer = %name, ip = %ip, "bootstrap node has unusable address");
                continue;
            };
            if self.identity.is_self(name, &endpoint) || self.contains(name) {
                continue;
            }

            let now = chrono::Utc::now().timestamp();
            let attested = match self.registry.get_node(name).await {
                Ok(Some(node)) if node.is_live(now) => Some(node.node_address),
                _ => None,
            };

            let record = PeerRecord {
                name: name.to_string(),
                endpoint,
                last_seen: now,
                signature: None,
                is_trusted: attested.is_some(),
                wallet_address: attested,
            };
            if self.upsert(record) == Some(Upsert::Inserted) {
                added += 1;
            }
        }

        info!(added, total = self.len(), "bootstrapped peers from registry");
        added
    }

    /// Drops every record that points back at this node.
    pub fn purge_self(&self) -> usize {
        let mut peers = self.peers.write();
        let before = peers.len();
        peers.retain(|_, p| !self.identity.is_self(&p.name, &p.endpoint));
        let purged = before - peers.len();
        if purged > 0 {
            info!(purged, "removed self records from peer table");
        }
        purged
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    pub fn trusted_count(&self) -> usize {
        self.peers.read().values().filter(|p| p.is_trusted).count()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.peers.read().contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<PeerRecord> {
        self.peers.read().get(name).cloned()
    }

    /// All records, sorted by name.
    pub fn all(&self) -> Vec<PeerRecord> {
        let mut out: Vec<PeerRecord> = self.peers.read().values().cloned().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Up to `n` trusted peers in random order.
    pub fn sample(&self, n: usize) -> Vec<PeerRecord> {
        let mut trusted: Vec<PeerRecord> = self
            .peers
            .read()
            .values()
            .filter(|p| p.is_trusted)
            .cloned()
            .collect();
        trusted.shuffle(&mut rand::thread_rng());
        trusted.truncate(n);
        trusted
    }

    /// Signed claims for `/peers`: this node first, then every signed
    /// peer.
    pub fn signed_entries(&self) -> Vec<PeerEntry> {
        let mut out = vec![PeerEntry::for_identity(&self.identity)];
        out.extend(self.all().iter().filter_map(PeerRecord::to_entry));
        out
    }

    /// Resolves a name or address to an endpoint: known peers first, then
    /// the registry for registry-style names. `None` when unknown or the
    /// registry record is inactive.
    pub async fn resolve(&self, identifier: &str) -> Option<String> {
        if is_address_literal(identifier) {
            return endpoint_from_literal(identifier);
        }

        let known = {
            let peers = self.peers.read();
            peers.get(identifier).cloned().or_else(|| {
                peers
                    .values()
                    .find(|p| {
                        p.wallet_address
                            .as_deref()
                            .is_some_and(|w| addresses_match(w, identifier))
                    })
                    .cloned()
            })
        };
        if let Some(peer) = known {
            return Some(peer.endpoint);
        }

        if !is_registry_name(identifier) {
            return None;
        }

        match self.registry.get_node(identifier).await {
            Ok(Some(node)) if node.is_live(chrono::Utc::now().timestamp()) => {
                let endpoint = endpoint_from_literal(node.current_ip.as_deref()?)?;
                debug!(peer = %identifier, %endpoint, "resolved through registry");
                Some(endpoint)
            }
            Ok(_) => None,
            Err(e) => {
                debug!(peer = %identifier, error = %e, "registry lookup failed");
                None
            }
        }
    }

    // -----------------------------------------------------------------------
    // Snapshot
    // -----------------------------------------------------------------------

    /// Writes the table as JSON, via a temporary file and rename.
    pub fn save_snapshot(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_vec_pretty(&self.all()).map_err(std::io::Error::other)?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        debug!(path = %path.display(), peers = self.len(), "saved peer snapshot");
        Ok(())
    }

    /// Restores records from a snapshot. A missing file is not an error.
    /// Self records that slipped in under an older identity are dropped.
    pub fn load_snapshot(&self, path: &Path) -> std::io::Result<usize> {
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };
        let records: Vec<PeerRecord> = serde_json::from_slice(&raw)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let mut loaded = 0;
        for record in records {
            if self.upsert(record).is_some() {
                loaded += 1;
            }
        }
        info!(loaded, path = %path.display(), "loaded peer snapshot");
        Ok(loaded)
    }
}
