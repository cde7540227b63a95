//! # Network
//!
//! Everything about other nodes: who they are, whether to trust them, and
//! how to talk to them.
//!
//! ```text
//! peer.rs       Peer records and wire documents (gossip, announce)
//! client.rs     Outbound HTTP calls with timeouts (PeerClient trait)
//! memory.rs     In-process PeerClient for tests and simulations
//! directory.rs  Known-peers table, claim verification, resolution
//! gossip.rs     Periodic randomized push of signed peer claims
//! tracker.rs    Tracker pull discovery and heartbeat announce
//! ```
//!
//! The peer table sits behind a `parking_lot::RwLock`; reads vastly
//! outnumber writes and no lock is held across an await point.

pub mod client;
pub mod directory;
pub mod gossip;
pub mod memory;
pub mod peer;
pub mod tracker;

pub use client::{HttpPeerClient, PeerClient, PeerError};
pub use directory::{PeerDirectory, Upsert};
pub use gossip::{GossipEngine, GossipRound};
pub use memory::{MemoryPeerClient, SimulatedPeer};
pub use peer::{Announcement, GossipPayload, NodeStats, PeerEntry, PeerRecord};
pub use tracker::{AnnouncementSource, TrackerClient};
