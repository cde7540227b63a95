//! # Replication
//!
//! Each node independently mirrors a slice of what the registry promotes.
//! Nothing is negotiated between nodes: the slice is a pure function of the
//! node address and content id.
//!
//! ```text
//! bucket.rs     hash bucketing, the replicate/skip decision
//! disk.rs       filesystem usage sampling
//! scheduler.rs  campaign feed poller, acquisition into staging
//! gc.rs         age-based eviction of replicas
//! ```

pub mod bucket;
pub mod disk;
pub mod gc;
pub mod scheduler;

pub use bucket::{bucket, should_replicate, ReplicaDecision, ReplicaKind};
pub use disk::{has_disk_budget, DiskUsage, FixedUsage, StatvfsUsage};
pub use gc::{GarbageCollector, GcPolicy, GcReport};
pub use scheduler::{PollReport, ReplicationError, ReplicationScheduler, SyncCursor};
