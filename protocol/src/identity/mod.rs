//! # Node Identity
//!
//! Who this node is: its signing key, declared name, public endpoint and
//! region. Everything above this layer signs and self-detects through a
//! shared [`NodeIdentity`].
//!
//! Self-detection matters because gossip and the registry will happily
//! hand a node its own record. A record is "self" when its name matches
//! ours (or our address), or when its endpoint points at one of our
//! network interfaces or our known public IP on our port.

pub mod endpoint;

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tracing::debug;

use crate::config::is_global_region;
use crate::crypto::keys::{NodeKeypair, RecoverableSignature};
use crate::crypto::signatures::{addresses_match, sign_node_claim};

/// This node's identity.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    keypair: NodeKeypair,
    name: String,
    endpoint: String,
    region: String,
    public_ip: Option<IpAddr>,
    local_addrs: HashSet<IpAddr>,
}

impl NodeIdentity {
    /// Builds an identity. An empty `name` falls back to the key's address
    /// (anonymous node). Local interface addresses are collected once here.
    pub fn new(keypair: NodeKeypair, name: &str, endpoint: &str, region: &str) -> Self {
        let name = if name.trim().is_empty() {
            keypair.address()
        } else {
            name.trim().to_string()
        };
        let endpoint = endpoint::normalize_endpoint(endpoint).unwrap_or_else(|| endpoint.to_string());

        Self {
            keypair,
            name,
            endpoint,
            region: region.to_string(),
            public_ip: None,
            local_addrs: discover_local_addrs(),
        }
    }

    pub fn with_public_ip(mut self, ip: Option<&str>) -> Self {
        self.public_ip = ip.and_then(|s| s.trim().parse().ok());
        self
    }

    /// Replaces the discovered interface set.
    pub fn with_local_addrs(mut self, addrs: impl IntoIterator<Item = IpAddr>) -> Self {
        self.local_addrs = addrs.into_iter().collect();
        self.local_addrs.insert(IpAddr::V4(Ipv4Addr::LOCALHOST));
        self.local_addrs.insert(IpAddr::V6(Ipv6Addr::LOCALHOST));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn is_region_scoped(&self) -> bool {
        !is_global_region(&self.region)
    }

    pub fn address(&self) -> String {
        self.keypair.address()
    }

    pub fn keypair(&self) -> &NodeKeypair {
        &self.keypair
    }

    /// Signature over `NODE:<name>:<endpoint>`.
    pub fn signed_claim(&self) -> RecoverableSignature {
        sign_node_claim(&self.keypair, &self.name, &self.endpoint)
    }

    pub fn is_self_name(&self, name: &str) -> bool {
        name == self.name || addresses_match(name, &self.address())
    }

    /// Does `candidate` point back at this node?
    ///
    /// An explicit port that differs from ours means another process on
    /// the same host, not us.
    pub fn is_self_endpoint(&self, candidate: &str) -> bool {
        if let (Some(a), Some(b)) = (
            endpoint::normalize_endpoint(candidate),
            endpoint::normalize_endpoint(&self.endpoint),
        ) {
            if a == b {
                return true;
            }
        }

        let Some(host) = endpoint::endpoint_host(candidate) else {
            return false;
        };
        let Ok(ip) = host.parse::<IpAddr>() else {
            return false;
        };

        if let Some(port) = endpoint::explicit_port(candidate) {
            let ours = endpoint::parse_endpoint(&self.endpoint).and_then(|u| u.port_or_known_default());
            if ours != Some(port) {
                return false;
            }
        }

        self.public_ip == Some(ip) || self.local_addrs.contains(&ip)
    }

    pub fn is_self(&self, name: &str, endpoint: &str) -> bool {
        self.is_self_name(name) || self.is_self_endpoint(endpoint)
    }
}

/// Addresses of every local interface, loopback included.
fn discover_local_addrs() -> HashSet<IpAddr> {
    let mut addrs: HashSet<IpAddr> = HashSet::new();
    addrs.insert(IpAddr::V4(Ipv4Addr::LOCALHOST));
    addrs.insert(IpAddr::V6(Ipv6Addr::LOCALHOST));

    match local_ip_address::list_afinet_netifas() {
        Ok(ifaces) => addrs.extend(ifaces.into_iter().map(|(_, ip)| ip)),
        Err(e) => debug!(error = %e, "could not enumerate network interfaces"),
    }

    addrs
}
