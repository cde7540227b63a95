//! # Protocol Configuration & Constants
//!
//! Every tunable number in Driftcast lives here. Loops, caps, rates and
//! timeouts are defined once and threaded into the runtime configs below,
//! so a node operator can see the whole behavioural envelope in one file.
//!
//! The runtime structs (`NodeConfig` and its sub-configs) carry these
//! defaults and are what the node binary actually builds from CLI flags
//! and environment variables.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Protocol Version
// ---------------------------------------------------------------------------

/// The protocol version advertised in `/status` and tracker announcements.
pub const PROTOCOL_VERSION: &str = "0.1.0";

/// Prefix of the signed node claim. A node proves ownership of its
/// `(name, endpoint)` pair by signing `NODE:<name>:<endpoint>`.
pub const NODE_CLAIM_PREFIX: &str = "NODE";

/// Region value meaning "no region affinity".
pub const GLOBAL_REGION: &str = "global";

// ---------------------------------------------------------------------------
// Network Parameters
// ---------------------------------------------------------------------------

/// Default HTTP port for the peer surface and playback API.
pub const DEFAULT_HTTP_PORT: u16 = 7440;

/// Default Prometheus metrics port.
pub const DEFAULT_METRICS_PORT: u16 = 7441;

/// Number of recently active nodes requested from the registry at bootstrap.
pub const BOOTSTRAP_LIMIT: usize = 20;

/// How often a node pushes its view of the network to random peers.
pub const GOSSIP_INTERVAL: Duration = Duration::from_secs(60);

/// Number of gossip targets per round.
pub const GOSSIP_FANOUT: usize = 3;

/// Number of known peers (besides self) included in one gossip payload.
pub const GOSSIP_SAMPLE_SIZE: usize = 10;

/// How often a node announces itself to the configured trackers.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(120);

/// Upper bound on concurrent outbound calls in a single fan-out.
pub const MAX_CONCURRENT_REQUESTS: usize = 8;

/// Timeout applied to every outbound peer/tracker/registry call.
pub const PEER_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Content downloads are bigger than JSON calls and get a longer budget.
pub const CONTENT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

// ---------------------------------------------------------------------------
// Catalog Sync
// ---------------------------------------------------------------------------

/// Interval between catalog reconciliation cycles.
pub const CATALOG_SYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Number of random peers pulled per reconciliation cycle.
pub const CATALOG_SYNC_PEERS: usize = 5;

// ---------------------------------------------------------------------------
// Replication
// ---------------------------------------------------------------------------

/// Fraction of discoverable items whose metadata this node mirrors.
pub const METADATA_REPLICATION_RATE: f64 = 0.35;

/// Fraction of discoverable items whose bytes this node mirrors.
pub const DATA_REPLICATION_RATE: f64 = 0.10;

/// Data replication stops when the content volume is at least this full.
pub const DISK_USAGE_THRESHOLD_PERCENT: u64 = 70;

/// How often the scheduler polls the registry for new campaigns.
pub const REPLICATION_POLL_INTERVAL: Duration = Duration::from_secs(600);

/// How often replica garbage collection runs.
pub const GC_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Replicas older than this are evicted.
pub const REPLICA_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

/// Lifetime of a playback session once its proof has been accepted.
pub const SESSION_DURATION: Duration = Duration::from_secs(4 * 60 * 60);

/// Default per-link concurrent stream cap.
pub const DEFAULT_MAX_STREAMS: u32 = 10;

/// The node refuses new sessions when free memory drops below this.
pub const MIN_FREE_MEMORY_BYTES: u64 = 256 * 1024 * 1024;

/// The node refuses new sessions when the 1-minute load average exceeds
/// `LOAD_FACTOR_LIMIT * cpu_count`.
pub const LOAD_FACTOR_LIMIT: f64 = 0.8;

/// Number of random campaigns tried when picking an ad to show.
pub const AD_SELECTION_ATTEMPTS: usize = 5;

/// How often expired sessions are swept, on top of lazy expiry.
pub const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Proof campaign id used by premium subscribers.
pub const PREMIUM_PROOF: &str = "premium";

/// Proof campaign id used by a link's owner or the node admin.
pub const OWNER_PROOF: &str = "owner";

// ---------------------------------------------------------------------------
// Content Cipher
// ---------------------------------------------------------------------------

/// Plaintext chunk size of the streaming cipher.
pub const CIPHER_CHUNK_SIZE: usize = 64 * 1024;

/// AES-256 key length in bytes.
pub const AES_KEY_LENGTH: usize = 32;

/// Per-item IV length. Seven bytes are used as the nonce prefix, the
/// remainder of each 96-bit chunk nonce is the chunk counter and the
/// last-chunk flag.
pub const CIPHER_IV_LENGTH: usize = 7;

/// AES-GCM authentication tag length.
pub const AES_TAG_LENGTH: usize = 16;

// ---------------------------------------------------------------------------
// Filesystem layout
// ---------------------------------------------------------------------------

/// Subdirectory holding encrypted blobs and their sidecar manifests.
pub const CONTENT_DIR: &str = "content";

/// Subdirectory holding hydrated poster/backdrop images.
pub const ASSET_DIR: &str = "assets";

/// Subdirectory for in-flight downloads.
pub const STAGING_DIR: &str = "staging";

/// Subdirectory holding the sled catalog database.
pub const DB_DIR: &str = "db";

/// Peer table snapshot for warm restarts.
pub const PEER_SNAPSHOT_FILE: &str = "peers.json";

/// Last processed registry block for the replication poller.
pub const SYNC_CURSOR_FILE: &str = "cursor.json";

/// The node's hex-encoded signing key.
pub const NODE_KEY_FILE: &str = "node.key";

// ---------------------------------------------------------------------------
// Runtime configuration
// ---------------------------------------------------------------------------

/// Gossip and discovery tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipConfig {
    pub interval: Duration,
    pub fanout: usize,
    pub sample_size: usize,
    pub bootstrap_limit: usize,
    pub heartbeat_interval: Duration,
    pub request_timeout: Duration,
    pub max_concurrency: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            interval: GOSSIP_INTERVAL,
            fanout: GOSSIP_FANOUT,
            sample_size: GOSSIP_SAMPLE_SIZE,
            bootstrap_limit: BOOTSTRAP_LIMIT,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            request_timeout: PEER_REQUEST_TIMEOUT,
            max_concurrency: MAX_CONCURRENT_REQUESTS,
        }
    }
}

/// Catalog reconciliation tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub interval: Duration,
    pub peers_per_cycle: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: CATALOG_SYNC_INTERVAL,
            peers_per_cycle: CATALOG_SYNC_PEERS,
        }
    }
}

/// Replication scheduler tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    pub metadata_rate: f64,
    pub data_rate: f64,
    pub disk_threshold_percent: u64,
    pub poll_interval: Duration,
    pub gc_interval: Duration,
    pub retention: Duration,
    /// When set, garbage collection keeps replicas whose source is still
    /// active regardless of age.
    pub spare_active: bool,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            metadata_rate: METADATA_REPLICATION_RATE,
            data_rate: DATA_REPLICATION_RATE,
            disk_threshold_percent: DISK_USAGE_THRESHOLD_PERCENT,
            poll_interval: REPLICATION_POLL_INTERVAL,
            gc_interval: GC_INTERVAL,
            retention: REPLICA_RETENTION,
            spare_active: false,
        }
    }
}

/// Stream admission tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    pub session_duration: Duration,
    pub min_free_memory_bytes: u64,
    pub load_factor_limit: f64,
    pub ad_selection_attempts: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            session_duration: SESSION_DURATION,
            min_free_memory_bytes: MIN_FREE_MEMORY_BYTES,
            load_factor_limit: LOAD_FACTOR_LIMIT,
            ad_selection_attempts: AD_SELECTION_ATTEMPTS,
        }
    }
}

/// Everything a running node needs to know about itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Declared node name. May be a registry name or a raw address.
    pub name: String,
    /// Public endpoint other nodes use to reach this one.
    pub endpoint: String,
    /// Region tag, `global` when the node has no affinity.
    pub region: String,
    /// Public IP this node is known by, if any. Used for self-detection.
    pub public_ip: Option<String>,
    /// Wallet address allowed to administer this node's content.
    pub admin_wallet: Option<String>,
    /// Root data directory.
    pub data_dir: PathBuf,
    /// Tracker base URLs.
    pub trackers: Vec<String>,
    pub gossip: GossipConfig,
    pub sync: SyncConfig,
    pub replication: ReplicationConfig,
    pub admission: AdmissionConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            endpoint: format!("http://127.0.0.1:{}", DEFAULT_HTTP_PORT),
            region: GLOBAL_REGION.to_string(),
            public_ip: None,
            admin_wallet: None,
            data_dir: PathBuf::from(".driftcast"),
            trackers: Vec::new(),
            gossip: GossipConfig::default(),
            sync: SyncConfig::default(),
            replication: ReplicationConfig::default(),
            admission: AdmissionConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn content_dir(&self) -> PathBuf {
        self.data_dir.join(CONTENT_DIR)
    }

    pub fn asset_dir(&self) -> PathBuf {
        self.data_dir.join(ASSET_DIR)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.data_dir.join(STAGING_DIR)
    }

    pub fn db_dir(&self) -> PathBuf {
        self.data_dir.join(DB_DIR)
    }

    pub fn peer_snapshot_path(&self) -> PathBuf {
        self.data_dir.join(PEER_SNAPSHOT_FILE)
    }

    pub fn cursor_path(&self) -> PathBuf {
        self.data_dir.join(SYNC_CURSOR_FILE)
    }

    pub fn key_path(&self) -> PathBuf {
        self.data_dir.join(NODE_KEY_FILE)
    }
}

/// Returns `true` when the region carries no affinity.
pub fn is_global_region(region: &str) -> bool {
    region.is_empty() || region.eq_ignore_ascii_case(GLOBAL_REGION)
}
