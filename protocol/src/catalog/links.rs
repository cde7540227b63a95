//! # Link Registry
//!
//! Content this node hosts. Each link is an encrypted blob plus a JSON
//! sidecar in the content directory:
//!
//! ```text
//! content/<id>.bin    chunked AES-256-GCM ciphertext
//! content/<id>.json   LinkSidecar (manifest, key, stream cap, replica info)
//! ```
//!
//! Link ids become file names, so every id that reaches the disk must
//! pass [`is_safe_name`]; ids taken from peers are checked before any
//! path is built from them.
//!
//! A link is only inserted after its blob is complete on disk, so nothing
//! in the registry ever points at missing or partial bytes. The live
//! stream counter is held here too: admission takes and returns slots
//! through [`LinkRegistry::try_acquire_stream`] and
//! [`LinkRegistry::release_stream`], both under the map's shard lock.

use std::path::{Path, PathBuf};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::entry::{ContentSummary, Manifest, MediaType};
use crate::config::{DEFAULT_MAX_STREAMS, GLOBAL_REGION};
use crate::crypto::cipher::{self, CipherError, ContentKey};

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cipher error: {0}")]
    Cipher(#[from] CipherError),

    #[error("bad sidecar {path}: {reason}")]
    Sidecar { path: String, reason: String },

    #[error("link {0} not found")]
    NotFound(String),

    #[error("blob for {id} is {actual} bytes, expected {expected}")]
    SizeMismatch { id: String, expected: u64, actual: u64 },

    #[error("link id {0:?} is not a safe file name")]
    InvalidId(String),
}

/// Whether `name` can be used as a file name inside a node directory:
/// non-empty, no leading dot, only ASCII alphanumerics, `-`, `_` and `.`.
pub fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Why a stream slot could not be taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotError {
    NotFound,
    AtCapacity,
}

/// Provenance of a mirrored item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaInfo {
    pub source: String,
    pub campaign_id: Option<String>,
    /// Unix seconds.
    pub acquired_at: i64,
}

/// On-disk sidecar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkSidecar {
    pub manifest: Manifest,
    pub max_streams: u32,
    /// Hex key material. Absent for mirrored items, which are served
    /// encrypted only.
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub replica: Option<ReplicaInfo>,
}

/// A hosted item.
#[derive(Debug, Clone)]
pub struct RegisteredLink {
    pub id: String,
    pub file_path: PathBuf,
    pub manifest: Manifest,
    pub active_streams: u32,
    pub max_streams: u32,
    pub key: Option<ContentKey>,
    pub replica: Option<ReplicaInfo>,
}

impl RegisteredLink {
    pub fn is_replica(&self) -> bool {
        self.replica.is_some()
    }

    pub fn has_capacity(&self) -> bool {
        self.active_streams < self.max_streams
    }

    fn sidecar(&self) -> LinkSidecar {
        LinkSidecar {
            manifest: self.manifest.clone(),
            max_streams: self.max_streams,
            key: self.key.as_ref().map(ContentKey::to_hex),
            replica: self.replica.clone(),
        }
    }
}

/// Metadata supplied when ingesting a local file.
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub title: String,
    /// Defaults to the plaintext content hash.
    pub media_id: Option<String>,
    pub media_type: MediaType,
    pub uploader_wallet: String,
    pub description: Option<String>,
    pub season: Option<u32>,
    pub episode: Option<u32>,
    pub year: Option<u32>,
    pub region: String,
    pub campaign_id: Option<String>,
    pub max_streams: u32,
}

impl IngestRequest {
    pub fn new(title: &str, uploader_wallet: &str) -> Self {
        Self {
            title: title.to_string(),
            media_id: None,
            media_type: MediaType::Other,
            uploader_wallet: uploader_wallet.to_string(),
            description: None,
            season: None,
            episode: None,
            year: None,
            region: GLOBAL_REGION.to_string(),
            campaign_id: None,
            max_streams: DEFAULT_MAX_STREAMS,
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct LinkRegistry {
    content_dir: PathBuf,
    links: DashMap<String, RegisteredLink>,
}

impl LinkRegistry {
    pub fn new(content_dir: impl Into<PathBuf>) -> Self {
        Self {
            content_dir: content_dir.into(),
            links: DashMap::new(),
        }
    }

    pub fn content_dir(&self) -> &Path {
        &self.content_dir
    }

    pub fn blob_path(&self, id: &str) -> PathBuf {
        self.content_dir.join(format!("{}.bin", id))
    }

    pub fn sidecar_path(&self, id: &str) -> PathBuf {
        self.content_dir.join(format!("{}.json", id))
    }

    /// Restores every link whose sidecar and blob are both present.
    /// Unreadable sidecars and orphaned blobs are skipped with a warning.
    pub fn load_from_dir(&self) -> Result<usize, LinkError> {
        std::fs::create_dir_all(&self.content_dir)?;
        let mut loaded = 0;

        for dirent in std::fs::read_dir(&self.content_dir)? {
            let path = dirent?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.load_sidecar(&path) {
                Ok(link) => {
                    self.links.insert(link.id.clone(), link);
                    loaded += 1;
                }
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable link"),
            }
        }

        info!(loaded, dir = %self.content_dir.display(), "hosted links loaded");
        Ok(loaded)
    }

    fn load_sidecar(&self, path: &Path) -> Result<RegisteredLink, LinkError> {
        let sidecar_err = |reason: String| LinkError::Sidecar {
            path: path.display().to_string(),
            reason,
        };
        let raw = std::fs::read(path)?;
        let sidecar: LinkSidecar = serde_json::from_slice(&raw).map_err(|e| sidecar_err(e.to_string()))?;
        let id = sidecar.manifest.id.clone();
        if !is_safe_name(&id) {
            return Err(LinkError::InvalidId(id));
        }
        let blob = self.blob_path(&id);
        if !blob.exists() {
            return Err(sidecar_err("blob missing".into()));
        }
        let key = match sidecar.key.as_deref() {
            Some(hex) => Some(ContentKey::from_hex(hex)?),
            None => None,
        };
        Ok(RegisteredLink {
            id,
            file_path: blob,
            manifest: sidecar.manifest,
            active_streams: 0,
            max_streams: sidecar.max_streams,
            key,
            replica: sidecar.replica,
        })
    }

    fn write_sidecar(&self, link: &RegisteredLink) -> Result<(), LinkError> {
        let json = serde_json::to_vec_pretty(&link.sidecar()).map_err(|e| LinkError::Sidecar {
            path: link.id.clone(),
            reason: e.to_string(),
        })?;
        let path = self.sidecar_path(&link.id);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Persists the sidecar and makes the link visible. The blob must
    /// already be at [`Self::blob_path`].
    pub fn register(&self, link: RegisteredLink) -> Result<(), LinkError> {
        if !is_safe_name(&link.id) {
            return Err(LinkError::InvalidId(link.id));
        }
        if !link.file_path.exists() {
            return Err(LinkError::NotFound(link.id));
        }
        self.write_sidecar(&link)?;
        debug!(link = %link.id, replica = link.is_replica(), "link registered");
        self.links.insert(link.id.clone(), link);
        Ok(())
    }

    /// Encrypts `source` into the content directory and registers it.
    pub async fn ingest_file(&self, source: &Path, request: IngestRequest) -> Result<RegisteredLink, LinkError> {
        tokio::fs::create_dir_all(&self.content_dir).await?;
        let id = uuid::Uuid::new_v4().to_string();
        let key = ContentKey::generate();
        let blob = self.blob_path(&id);
        let partial = blob.with_extension("bin.part");

        let reader = tokio::fs::File::open(source).await?;
        let writer = tokio::fs::File::create(&partial).await?;
        let summary = match cipher::encrypt_stream(&key, reader, writer).await {
            Ok(s) => s,
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(e.into());
            }
        };
        tokio::fs::rename(&partial, &blob).await?;

        let manifest = Manifest {
            id: id.clone(),
            media_id: request.media_id.unwrap_or_else(|| summary.content_hash.clone()),
            content_hash: summary.content_hash,
            title: request.title,
            description: request.description,
            media_type: request.media_type,
            uploader_wallet: request.uploader_wallet,
            season: request.season,
            episode: request.episode,
            year: request.year,
            poster: None,
            backdrop: None,
            size: summary.plaintext_len,
            created_at: chrono::Utc::now().timestamp(),
            region: request.region,
            campaign_id: request.campaign_id,
        };

        let link = RegisteredLink {
            id,
            file_path: blob,
            manifest,
            active_streams: 0,
            max_streams: request.max_streams,
            key: Some(key),
            replica: None,
        };
        self.register(link.clone())?;
        info!(
            link = %link.id,
            media = %link.manifest.media_id,
            bytes = link.manifest.size,
            "content ingested"
        );
        Ok(link)
    }

    /// Moves a completed download into place and registers it as a
    /// replica. The staged blob must have the exact ciphertext size the
    /// manifest implies, otherwise it is deleted and nothing registers.
    pub async fn adopt_replica(
        &self,
        staged: &Path,
        manifest: Manifest,
        replica: ReplicaInfo,
    ) -> Result<RegisteredLink, LinkError> {
        if !is_safe_name(&manifest.id) {
            let _ = tokio::fs::remove_file(staged).await;
            return Err(LinkError::InvalidId(manifest.id));
        }
        let expected = cipher::ciphertext_len(manifest.size);
        let actual = tokio::fs::metadata(staged).await?.len();
        if actual != expected {
            let _ = tokio::fs::remove_file(staged).await;
            return Err(LinkError::SizeMismatch {
                id: manifest.id,
                expected,
                actual,
            });
        }

        tokio::fs::create_dir_all(&self.content_dir).await?;
        let blob = self.blob_path(&manifest.id);
        tokio::fs::rename(staged, &blob).await?;

        let link = RegisteredLink {
            id: manifest.id.clone(),
            file_path: blob,
            manifest,
            active_streams: 0,
            max_streams: DEFAULT_MAX_STREAMS,
            key: None,
            replica: Some(replica),
        };
        self.register(link.clone())?;
        Ok(link)
    }

    /// Deletes a link and its files. Returns whether it existed.
    pub fn remove(&self, id: &str) -> Result<bool, LinkError> {
        let Some((_, link)) = self.links.remove(id) else {
            return Ok(false);
        };
        for path in [link.file_path.clone(), self.sidecar_path(id)] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        info!(link = %id, "link removed");
        Ok(true)
    }

    // -- Stream slots --------------------------------------------------------

    /// Takes one stream slot if the link is below its cap.
    pub fn try_acquire_stream(&self, id: &str) -> Result<u32, SlotError> {
        let mut link = self.links.get_mut(id).ok_or(SlotError::NotFound)?;
        if !link.has_capacity() {
            return Err(SlotError::AtCapacity);
        }
        link.active_streams += 1;
        Ok(link.active_streams)
    }

    /// Returns a slot. Never goes below zero; a release for a removed link
    /// is a no-op.
    pub fn release_stream(&self, id: &str) -> u32 {
        match self.links.get_mut(id) {
            Some(mut link) => {
                link.active_streams = link.active_streams.saturating_sub(1);
                link.active_streams
            }
            None => 0,
        }
    }

    pub fn active_streams(&self, id: &str) -> Option<u32> {
        self.links.get(id).map(|l| l.active_streams)
    }

    pub fn total_active_streams(&self) -> u32 {
        self.links.iter().map(|l| l.active_streams).sum()
    }

    // -- Reads ---------------------------------------------------------------

    pub fn get(&self, id: &str) -> Option<RegisteredLink> {
        self.links.get(id).map(|l| l.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.links.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// First link carrying `media_id`.
    pub fn find_by_media(&self, media_id: &str) -> Option<RegisteredLink> {
        self.links
            .iter()
            .find(|l| l.manifest.media_id == media_id)
            .map(|l| l.clone())
    }

    pub fn replicas(&self) -> Vec<RegisteredLink> {
        self.links
            .iter()
            .filter(|l| l.is_replica())
            .map(|l| l.clone())
            .collect()
    }

    /// Public listing for `/catalog`, sorted by title.
    pub fn summaries(&self) -> Vec<ContentSummary> {
        let mut out: Vec<ContentSummary> = self.links.iter().map(|l| l.manifest.summary()).collect();
        out.sort_by(|a, b| a.title.cmp(&b.title).then_with(|| a.id.cmp(&b.id)));
        out
    }
}
