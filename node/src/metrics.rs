//! # Prometheus Metrics
//!
//! Exposes operational metrics for the node. Scraped by Prometheus at the
//! `/metrics` HTTP endpoint on the configured metrics port.
//!
//! All metrics are registered in a dedicated [`prometheus::Registry`] so they
//! do not collide with any default global registry consumers. The protocol
//! components keep their own atomic counters; [`NodeMetrics::sample`] copies
//! them into the gauges on a fixed cadence.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{Encoder, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

/// A point-in-time reading of the component counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sample {
    pub known_peers: u64,
    pub trusted_peers: u64,
    pub gossip_rounds: u64,
    pub sync_cycles: u64,
    pub catalog_entries: u64,
    pub hosted_links: u64,
    pub replicas_acquired: u64,
    pub replicas_evicted: u64,
    pub active_streams: u64,
    pub admissions_granted: u64,
    pub admissions_denied: u64,
}

/// Holds all Prometheus metric handles for the node.
#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    /// Peers in the directory.
    pub known_peers: IntGauge,
    /// Peers admitted with a registry-backed identity.
    pub trusted_peers: IntGauge,
    pub gossip_rounds: IntGauge,
    pub sync_cycles: IntGauge,
    /// Rows in the catalog database.
    pub catalog_entries: IntGauge,
    pub hosted_links: IntGauge,
    pub replicas_acquired: IntGauge,
    pub replicas_evicted: IntGauge,
    /// Stream slots currently taken across all links.
    pub active_streams: IntGauge,
    pub admissions_granted: IntGauge,
    pub admissions_denied: IntGauge,
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge, prometheus::Error> {
    let gauge = IntGauge::new(name, help)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

impl NodeMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("driftcast".into()), None)?;

        Ok(Self {
            known_peers: gauge(&registry, "known_peers", "Peers in the directory")?,
            trusted_peers: gauge(&registry, "trusted_peers", "Peers with a registry-backed identity")?,
            gossip_rounds: gauge(&registry, "gossip_rounds_total", "Gossip rounds run")?,
            sync_cycles: gauge(&registry, "sync_cycles_total", "Catalog reconciliation cycles run")?,
            catalog_entries: gauge(&registry, "catalog_entries", "Entries in the catalog database")?,
            hosted_links: gauge(&registry, "hosted_links", "Links served by this node")?,
            replicas_acquired: gauge(&registry, "replicas_acquired_total", "Replicas downloaded and registered")?,
            replicas_evicted: gauge(&registry, "replicas_evicted_total", "Replicas and mirrors garbage collected")?,
            active_streams: gauge(&registry, "active_streams", "Stream slots currently taken")?,
            admissions_granted: gauge(&registry, "admissions_granted_total", "Stream sessions granted")?,
            admissions_denied: gauge(&registry, "admissions_denied_total", "Stream admissions denied")?,
            registry,
        })
    }

    /// Copies a reading into the gauges.
    pub fn sample(&self, s: Sample) {
        let set = |g: &IntGauge, v: u64| g.set(i64::try_from(v).unwrap_or(i64::MAX));
        set(&self.known_peers, s.known_peers);
        set(&self.trusted_peers, s.trusted_peers);
        set(&self.gossip_rounds, s.gossip_rounds);
        set(&self.sync_cycles, s.sync_cycles);
        set(&self.catalog_entries, s.catalog_entries);
        set(&self.hosted_links, s.hosted_links);
        set(&self.replicas_acquired, s.replicas_acquired);
        set(&self.replicas_evicted, s.replicas_evicted);
        set(&self.active_streams, s.active_streams);
        set(&self.admissions_granted, s.admissions_granted);
        set(&self.admissions_denied, s.admissions_denied);
    }

    /// Encodes all registered metrics into the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Shared metrics state passed to axum handlers.
pub type SharedMetrics = Arc<NodeMetrics>;

/// Axum handler that renders `/metrics` in Prometheus text format.
pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<SharedMetrics>,
) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_sets_gauges() {
        let metrics = NodeMetrics::new().unwrap();
        metrics.sample(Sample {
            known_peers: 7,
            trusted_peers: 3,
            active_streams: 2,
            admissions_denied: 5,
            ..Sample::default()
        });
        assert_eq!(metrics.known_peers.get(), 7);
        assert_eq!(metrics.trusted_peers.get(), 3);
        assert_eq!(metrics.active_streams.get(), 2);
        assert_eq!(metrics.admissions_denied.get(), 5);
        assert_eq!(metrics.gossip_rounds.get(), 0);
    }

    #[test]
    fn encoding_uses_namespace() {
        let metrics = NodeMetrics::new().unwrap();
        metrics.sample(Sample {
            catalog_entries: 12,
            ..Sample::default()
        });
        let text = metrics.encode().unwrap();
        assert!(text.contains("driftcast_catalog_entries 12"));
        assert!(text.contains("driftcast_replicas_evicted_total 0"));
    }

    #[test]
    fn saturates_instead_of_wrapping() {
        let metrics = NodeMetrics::new().unwrap();
        metrics.sample(Sample {
            sync_cycles: u64::MAX,
            ..Sample::default()
        });
        assert_eq!(metrics.sync_cycles.get(), i64::MAX);
    }
}
