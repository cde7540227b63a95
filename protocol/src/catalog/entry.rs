//! Catalog record types.
//!
//! Three shapes of the same content travel through the system:
//!
//! - [`CatalogEntry`]: this node's reconciled view of a remote item, keyed
//!   by `(media_id, uploader_wallet)` and persisted in the catalog db.
//! - [`ContentSummary`]: the public listing a node serves at `/catalog`.
//! - [`Manifest`]: the sovereign metadata document a host serves for each
//!   item it stores, and writes next to the encrypted blob on disk.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Media type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Movie,
    Episode,
    Ad,
    #[default]
    Other,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Movie => "movie",
            Self::Episode => "episode",
            Self::Ad => "ad",
            Self::Other => "other",
        }
    }
}

impl std::str::FromStr for MediaType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "movie" => Ok(Self::Movie),
            "episode" | "tv" | "series" => Ok(Self::Episode),
            "ad" => Ok(Self::Ad),
            "other" => Ok(Self::Other),
            other => Err(format!("unknown media type {:?}", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Catalog entry
// ---------------------------------------------------------------------------

/// One piece of content as known to the network.
///
/// `authority` is the identifier of the current host (a registry name, a
/// raw address or an IP literal). It is resolved to an endpoint only when
/// someone needs to reach the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: String,
    pub content_hash: String,
    pub media_id: String,
    pub authority: String,
    pub uploader_wallet: String,
    pub title: String,
    pub trust_score: i64,
    pub upvotes: u64,
    pub downvotes: u64,
    pub media_type: MediaType,
    pub season: Option<u32>,
    pub episode: Option<u32>,
    /// Unix seconds of the last write.
    pub updated_at: i64,
}

impl CatalogEntry {
    /// A fresh entry for a remote item hosted by `authority`.
    pub fn from_summary(summary: &ContentSummary, authority: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            content_hash: summary.content_hash.clone(),
            media_id: summary.media_id.clone(),
            authority: authority.to_string(),
            uploader_wallet: summary.uploader_wallet.clone(),
            title: summary.title.clone(),
            trust_score: 0,
            upvotes: 0,
            downvotes: 0,
            media_type: summary.media_type,
            season: summary.season,
            episode: summary.episode,
            updated_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Storage key, see [`entry_key`].
    pub fn key(&self) -> Vec<u8> {
        entry_key(&self.media_id, &self.uploader_wallet)
    }
}

fn push_field(key: &mut Vec<u8>, field: &[u8]) {
    key.extend_from_slice(&(field.len() as u32).to_be_bytes());
    key.extend_from_slice(field);
}

/// Key prefix shared by every uploader's entry for `media_id`.
pub fn media_key_prefix(media_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + media_id.len());
    push_field(&mut key, media_id.as_bytes());
    key
}

/// Storage key for a `(media_id, uploader)` pair: each field is written
/// as `u32_be(len) || bytes`, so no choice of ids can make two pairs
/// collide. Uploader addresses are case-folded so the same wallet never
/// yields two keys.
pub fn entry_key(media_id: &str, uploader: &str) -> Vec<u8> {
    let uploader = uploader.to_ascii_lowercase();
    let mut key = media_key_prefix(media_id);
    push_field(&mut key, uploader.as_bytes());
    key
}

// ---------------------------------------------------------------------------
// Public listing
// ---------------------------------------------------------------------------

/// What a node advertises about each item it hosts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentSummary {
    /// The host's local link id.
    pub id: String,
    pub media_id: String,
    pub content_hash: String,
    pub title: String,
    pub media_type: MediaType,
    pub uploader_wallet: String,
    #[serde(default)]
    pub season: Option<u32>,
    #[serde(default)]
    pub episode: Option<u32>,
    /// Plaintext size in bytes.
    pub size: u64,
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

/// The sovereign metadata document for a hosted item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub id: String,
    pub media_id: String,
    pub content_hash: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub media_type: MediaType,
    pub uploader_wallet: String,
    #[serde(default)]
    pub season: Option<u32>,
    #[serde(default)]
    pub episode: Option<u32>,
    #[serde(default)]
    pub year: Option<u32>,
    /// Asset file names served under `/assets/`.
    #[serde(default)]
    pub poster: Option<String>,
    #[serde(default)]
    pub backdrop: Option<String>,
    pub size: u64,
    pub created_at: i64,
    #[serde(default = "default_region")]
    pub region: String,
    /// Set when the item is an ad campaign's creative.
    #[serde(default)]
    pub campaign_id: Option<String>,
}

fn default_region() -> String {
    crate::config::GLOBAL_REGION.to_string()
}

impl Manifest {
    pub fn summary(&self) -> ContentSummary {
        ContentSummary {
            id: self.id.clone(),
            media_id: self.media_id.clone(),
            content_hash: self.content_hash.clone(),
            title: self.title.clone(),
            media_type: self.media_type,
            uploader_wallet: self.uploader_wallet.clone(),
            season: self.season,
            episode: self.episode,
            size: self.size,
        }
    }

    /// Asset names referenced by this manifest.
    pub fn assets(&self) -> impl Iterator<Item = &str> {
        self.poster
            .iter()
            .chain(self.backdrop.iter())
            .map(String::as_str)
    }
}

/// What this node knows about a piece of media independently of who hosts
/// it. Reconciliation only creates catalog entries for known media.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRecord {
    pub media_id: String,
    pub title: String,
    pub media_type: MediaType,
    pub description: Option<String>,
    pub year: Option<u32>,
    pub poster: Option<String>,
    pub backdrop: Option<String>,
}

impl From<&Manifest> for MediaRecord {
    fn from(m: &Manifest) -> Self {
        Self {
            media_id: m.media_id.clone(),
            title: m.title.clone(),
            media_type: m.media_type,
            description: m.description.clone(),
            year: m.year,
            poster: m.poster.clone(),
            backdrop: m.backdrop.clone(),
        }
    }
}
