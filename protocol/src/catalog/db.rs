//! # CatalogDb
//!
//! Durable catalog state on sled. The reconciler and vote ingestion are the
//! only writers; everything else reads.
//!
//! | Tree       | Key                          | Value                   |
//! |------------|------------------------------|-------------------------|
//! | `entries`  | `len‖media_id‖len‖uploader`  | `bincode(CatalogEntry)` |
//! | `media`    | `media_id`                   | `bincode(MediaRecord)`  |
//! | `votes`    | entry key `‖` voter          | `1` (up) / `0` (down)   |
//! | `mirrors`  | `media_id`                   | `bincode(MirrorRecord)` |
//! | `metadata` | key (UTF-8)                  | value (bytes)           |
//!
//! Read-modify-write paths (`upsert_remote`, `apply_vote`) are serialised
//! by a process-local mutex; sled gives per-key atomicity, not
//! multi-step.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use sled::{Db, Tree};

use super::entry::{entry_key, media_key_prefix, CatalogEntry, ContentSummary, MediaRecord};

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type DbResult<T> = Result<T, DbError>;

fn encode<T: serde::Serialize>(value: &T) -> DbResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| DbError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> DbResult<T> {
    bincode::deserialize(bytes).map_err(|e| DbError::Serialization(e.to_string()))
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// What `upsert_remote` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteUpsert {
    Created(CatalogEntry),
    AuthorityChanged { from: String, entry: CatalogEntry },
    Unchanged,
}

/// A media record copied from a peer by the replication scheduler.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MirrorRecord {
    pub media_id: String,
    pub campaign_id: Option<String>,
    /// Unix seconds.
    pub acquired_at: i64,
}

/// What `apply_vote` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteOutcome {
    Applied(CatalogEntry),
    Duplicate,
    UnknownEntry,
}

// ---------------------------------------------------------------------------
// CatalogDb
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CatalogDb {
    db: Db,
    entries: Tree,
    media: Tree,
    votes: Tree,
    mirrors: Tree,
    metadata: Tree,
    write_lock: Arc<Mutex<()>>,
}

impl CatalogDb {
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        Self::from_db(sled::open(path)?)
    }

    /// In-memory database, removed on drop.
    pub fn open_temporary() -> DbResult<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> DbResult<Self> {
        Ok(Self {
            entries: db.open_tree("entries")?,
            media: db.open_tree("media")?,
            votes: db.open_tree("votes")?,
            mirrors: db.open_tree("mirrors")?,
            metadata: db.open_tree("metadata")?,
            db,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn flush(&self) -> DbResult<()> {
        self.db.flush()?;
        Ok(())
    }

    // -- Entries -------------------------------------------------------------

    /// Unconditional write of an entry under its `(media_id, uploader)` key.
    pub fn put_entry(&self, entry: &CatalogEntry) -> DbResult<()> {
        self.entries.insert(entry.key(), encode(entry)?)?;
        Ok(())
    }

    pub fn get_entry(&self, media_id: &str, uploader: &str) -> DbResult<Option<CatalogEntry>> {
        match self.entries.get(entry_key(media_id, uploader))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Applies a remote listing: creates the entry if absent, otherwise
    /// moves `authority` and leaves every other field alone.
    pub fn upsert_remote(&self, summary: &ContentSummary, authority: &str) -> DbResult<RemoteUpsert> {
        let _guard = self.write_lock.lock();

        match self.get_entry(&summary.media_id, &summary.uploader_wallet)? {
            None => {
                let entry = CatalogEntry::from_summary(summary, authority);
                self.put_entry(&entry)?;
                Ok(RemoteUpsert::Created(entry))
            }
            Some(existing) if existing.authority == authority => Ok(RemoteUpsert::Unchanged),
            Some(mut existing) => {
                let from = std::mem::replace(&mut existing.authority, authority.to_string());
                existing.updated_at = chrono::Utc::now().timestamp();
                self.put_entry(&existing)?;
                Ok(RemoteUpsert::AuthorityChanged {
                    from,
                    entry: existing,
                })
            }
        }
    }

    /// The entry for `media_id` currently pointing at `authority`, if any.
    pub fn find_by_authority_and_content(
        &self,
        authority: &str,
        media_id: &str,
    ) -> DbResult<Option<CatalogEntry>> {
        for entry in self.entries_for_media(media_id)? {
            if entry.authority == authority {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// Every uploader's entry for one piece of media.
    pub fn entries_for_media(&self, media_id: &str) -> DbResult<Vec<CatalogEntry>> {
        let mut found = Vec::new();
        for item in self.entries.scan_prefix(media_key_prefix(media_id)) {
            let (_, bytes) = item?;
            let entry: CatalogEntry = decode(&bytes)?;
            if entry.media_id == media_id {
                found.push(entry);
            }
        }
        Ok(found)
    }

    pub fn list_entries(&self) -> DbResult<Vec<CatalogEntry>> {
        self.entries
            .iter()
            .map(|item| {
                let (_, bytes) = item?;
                decode(&bytes)
            })
            .collect()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    // -- Votes ---------------------------------------------------------------

    /// Counts one vote per voter per entry and recomputes the trust score.
    pub fn apply_vote(
        &self,
        media_id: &str,
        uploader: &str,
        voter: &str,
        upvote: bool,
    ) -> DbResult<VoteOutcome> {
        let _guard = self.write_lock.lock();

        let Some(mut entry) = self.get_entry(media_id, uploader)? else {
            return Ok(VoteOutcome::UnknownEntry);
        };

        let mut vote_key = entry.key();
        vote_key.extend_from_slice(voter.to_ascii_lowercase().as_bytes());
        let previous = self
            .votes
            .compare_and_swap(vote_key, None as Option<&[u8]>, Some(&[upvote as u8][..]))?;
        if previous.is_err() {
            return Ok(VoteOutcome::Duplicate);
        }

        if upvote {
            entry.upvotes += 1;
        } else {
            entry.downvotes += 1;
        }
        entry.trust_score = entry.upvotes as i64 - entry.downvotes as i64;
        entry.updated_at = chrono::Utc::now().timestamp();
        self.put_entry(&entry)?;
        Ok(VoteOutcome::Applied(entry))
    }

    // -- Media ---------------------------------------------------------------

    pub fn put_media(&self, record: &MediaRecord) -> DbResult<()> {
        self.media.insert(record.media_id.as_bytes(), encode(record)?)?;
        Ok(())
    }

    pub fn get_media(&self, media_id: &str) -> DbResult<Option<MediaRecord>> {
        match self.media.get(media_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn has_media(&self, media_id: &str) -> DbResult<bool> {
        Ok(self.media.contains_key(media_id.as_bytes())?)
    }

    // -- Mirrors -------------------------------------------------------------

    /// Stores mirrored media and marks it as a replica.
    pub fn put_mirror(&self, record: &MediaRecord, mirror: &MirrorRecord) -> DbResult<()> {
        self.put_media(record)?;
        self.mirrors.insert(mirror.media_id.as_bytes(), encode(mirror)?)?;
        Ok(())
    }

    pub fn mirrors(&self) -> DbResult<Vec<MirrorRecord>> {
        self.mirrors
            .iter()
            .map(|item| {
                let (_, bytes) = item?;
                decode(&bytes)
            })
            .collect()
    }

    /// Forgets a mirrored media record. Catalog entries stay; the next
    /// sync re-hydrates the media if it is still listed.
    pub fn remove_mirror(&self, media_id: &str) -> DbResult<bool> {
        let existed = self.mirrors.remove(media_id.as_bytes())?.is_some();
        if existed {
            self.media.remove(media_id.as_bytes())?;
        }
        Ok(existed)
    }

    // -- Metadata ------------------------------------------------------------

    pub fn put_meta_i64(&self, key: &str, value: i64) -> DbResult<()> {
        self.metadata.insert(key.as_bytes(), &value.to_be_bytes())?;
        Ok(())
    }

    pub fn get_meta_i64(&self, key: &str) -> DbResult<Option<i64>> {
        Ok(self.metadata.get(key.as_bytes())?.and_then(|v| {
            let bytes: [u8; 8] = v.as_ref().try_into().ok()?;
            Some(i64::from_be_bytes(bytes))
        }))
    }
}
