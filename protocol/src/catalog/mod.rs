//! # Catalog
//!
//! Local knowledge of content: what this node hosts ([`LinkRegistry`]) and
//! what the network hosts ([`CatalogDb`], fed by [`CatalogStore`]
//! reconciliation).
//!
//! ```text
//! entry.rs  CatalogEntry, ContentSummary, Manifest, MediaRecord
//! db.rs     sled-backed catalog (entries, media, votes, mirrors)
//! links.rs  hosted items: encrypted blob + sidecar, stream slots
//! sync.rs   periodic reconciliation, hydration, authority resolution
//! ```

pub mod db;
pub mod entry;
pub mod links;
pub mod sync;

pub use db::{CatalogDb, DbError, MirrorRecord, RemoteUpsert, VoteOutcome};
pub use entry::{CatalogEntry, ContentSummary, Manifest, MediaRecord, MediaType};
pub use links::{is_safe_name, IngestRequest, LinkError, LinkRegistry, RegisteredLink, ReplicaInfo, SlotError};
pub use sync::{CatalogError, CatalogStore, SyncReport};
