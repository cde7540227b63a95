//! Coordination-free replica selection.
//!
//! ```text
//! bucket = u16_be(SHA-256(address | namespace | content_id)[0..2])
//! replicate  iff  bucket < 65535 * rate
//! ```
//!
//! Every node computes this for itself with no messages exchanged. Over
//! many content ids about `rate` of them land under the cut, and because
//! the node address is part of the input, different nodes pick different
//! subsets. Metadata and bytes use separate namespaces so the two decisions
//! are independent per item.

use crate::crypto::hash::sha256_array;

/// Which copy is being decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplicaKind {
    Metadata,
    Data,
}

impl ReplicaKind {
    pub fn namespace(&self) -> &'static str {
        match self {
            Self::Metadata => "meta",
            Self::Data => "data",
        }
    }
}

/// Bucket in `0..=65535` for `(address, kind, content_id)`.
pub fn bucket(node_address: &str, kind: ReplicaKind, content_id: &str) -> u16 {
    let input = format!(
        "{}|{}|{}",
        node_address.to_ascii_lowercase(),
        kind.namespace(),
        content_id
    );
    let digest = sha256_array(input.as_bytes());
    u16::from_be_bytes([digest[0], digest[1]])
}

/// The replication decision for one kind at `rate` (clamped to `[0, 1]`).
pub fn should_replicate(node_address: &str, kind: ReplicaKind, content_id: &str, rate: f64) -> bool {
    if rate.is_nan() || rate <= 0.0 {
        return false;
    }
    let rate = rate.min(1.0);
    f64::from(bucket(node_address, kind, content_id)) < 65535.0 * rate
}

/// Both decisions for one content id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaDecision {
    pub metadata: bool,
    pub data: bool,
}

impl ReplicaDecision {
    pub fn evaluate(node_address: &str, content_id: &str, metadata_rate: f64, data_rate: f64) -> Self {
        Self {
            metadata: should_replicate(node_address, ReplicaKind::Metadata, content_id, metadata_rate),
            data: should_replicate(node_address, ReplicaKind::Data, content_id, data_rate),
        }
    }
}
