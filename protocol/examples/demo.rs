//! Terminal walk-through of a Driftcast node's life.
//!
//! Two nodes meet through signed gossip, one ingests a film, the other
//! reconciles its catalog, both pick their replica slices without talking
//! to each other, and a viewer earns a stream by signing an ad view. Every
//! collaborator is in memory.
//!
//! Run with:
//!   cargo run --example demo

use std::sync::Arc;
use std::time::Duration;

use driftcast_protocol::catalog::{CatalogDb, CatalogStore, IngestRequest, LinkRegistry, MediaType};
use driftcast_protocol::config::{AdmissionConfig, DATA_REPLICATION_RATE, METADATA_REPLICATION_RATE, SyncConfig};
use driftcast_protocol::crypto::keys::NodeKeypair;
use driftcast_protocol::crypto::signatures::view_proof_message;
use driftcast_protocol::identity::NodeIdentity;
use driftcast_protocol::network::{MemoryPeerClient, PeerDirectory, PeerEntry, SimulatedPeer};
use driftcast_protocol::registry::{Campaign, InMemoryRegistry};
use driftcast_protocol::replication::ReplicaDecision;
use driftcast_protocol::streaming::{
    client_key, AdmissionDecision, AuthorizeRequest, FixedLoad, ProofSubmission, StreamAdmission,
};

// ---------------------------------------------------------------------------
// ANSI color constants
// ---------------------------------------------------------------------------

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const GREEN: &str = "\x1b[32m";
const CYAN: &str = "\x1b[36m";
const YELLOW: &str = "\x1b[33m";

fn step(n: u32, title: &str) {
    println!();
    println!("{BOLD}{CYAN}[{n}] {title}{RESET}");
}

fn detail(label: &str, value: impl std::fmt::Display) {
    println!("    {DIM}{label:<18}{RESET} {value}");
}

fn ok(msg: &str) {
    println!("    {GREEN}ok{RESET} {msg}");
}

struct Node {
    identity: Arc<NodeIdentity>,
    directory: Arc<PeerDirectory>,
    catalog: Arc<CatalogStore>,
}

fn node(
    seed: u8,
    name: &str,
    endpoint: &str,
    registry: Arc<InMemoryRegistry>,
    network: Arc<MemoryPeerClient>,
    root: &std::path::Path,
) -> Result<Node, Box<dyn std::error::Error>> {
    let identity = Arc::new(
        NodeIdentity::new(NodeKeypair::from_seed(&[seed; 32]), name, endpoint, "global")
            .with_local_addrs(Vec::new()),
    );
    let directory = Arc::new(PeerDirectory::new(identity.clone(), registry, 4));
    let dir = root.join(name);
    let catalog = Arc::new(CatalogStore::new(
        CatalogDb::open_temporary()?,
        Arc::new(LinkRegistry::new(dir.join("content"))),
        directory.clone(),
        network,
        dir.join("assets"),
        SyncConfig::default(),
        Duration::from_secs(1),
    ));
    Ok(Node {
        identity,
        directory,
        catalog,
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("{BOLD}Driftcast: a node's life in six steps{RESET}");

    let tmp = tempfile::tempdir()?;
    let registry = Arc::new(InMemoryRegistry::new());
    let network = Arc::new(MemoryPeerClient::new());

    let alpha = node(1, "alpha", "http://10.0.0.1:7440", registry.clone(), network.clone(), tmp.path())?;
    let beta = node(2, "beta", "http://10.0.0.2:7440", registry.clone(), network.clone(), tmp.path())?;

    // --- 1. Ingest ---------------------------------------------------------
    step(1, "alpha ingests a film");
    let uploader = NodeKeypair::generate();
    let film = tmp.path().join("film.bin");
    std::fs::write(&film, vec![7u8; 200_000])?;
    let link = alpha
        .catalog
        .ingest(
            &film,
            IngestRequest {
                media_type: MediaType::Movie,
                ..IngestRequest::new("Night Train", &uploader.address())
            },
        )
        .await?;
    detail("link", &link.id);
    detail("content hash", &link.manifest.content_hash);
    detail("plaintext bytes", link.manifest.size);

    network.serve(
        alpha.identity.endpoint(),
        SimulatedPeer {
            peers: vec![PeerEntry::for_identity(&alpha.identity)],
            catalog: alpha.catalog.links().summaries(),
            manifests: [(link.id.clone(), link.manifest.clone())].into_iter().collect(),
            ..SimulatedPeer::default()
        },
    );

    // --- 2. Gossip ---------------------------------------------------------
    step(2, "beta hears about alpha through signed gossip");
    let admitted = beta
        .directory
        .ingest(vec![PeerEntry::for_identity(&alpha.identity)])
        .await;
    detail("admitted", admitted);
    detail("alpha's wallet", alpha.identity.address());
    ok("claim signature recovered to alpha's key");

    // --- 3. Catalog --------------------------------------------------------
    step(3, "beta reconciles its catalog");
    if let Some(report) = beta.catalog.sync_once().await {
        detail("peers contacted", report.peers_contacted);
        detail("entries created", report.created);
    }
    detail("catalog size", beta.catalog.db().entry_count());

    // --- 4. Replica slices -------------------------------------------------
    step(4, "each node picks its replica slice alone");
    for n in [&alpha, &beta] {
        let picks = (0..1_000)
            .map(|i| {
                ReplicaDecision::evaluate(
                    &n.identity.address(),
                    &format!("campaign-{}", i),
                    METADATA_REPLICATION_RATE,
                    DATA_REPLICATION_RATE,
                )
            })
            .filter(|d| d.data)
            .count();
        detail(n.identity.name(), format!("{} of 1000 campaigns mirrored in full", picks));
    }

    // --- 5. Admission ------------------------------------------------------
    step(5, "a viewer asks to watch");
    registry.put_campaign(Campaign {
        id: "spring-sale".into(),
        content_id: "ad-spring".into(),
        source: "alpha".into(),
        title: "Spring Sale".into(),
        active: true,
        views_remaining: 10,
        region: "global".into(),
        block: 1,
    });
    let admission = StreamAdmission::new(
        alpha.catalog.links().clone(),
        registry.clone(),
        Arc::new(FixedLoad::idle()),
        AdmissionConfig::default(),
        None,
    );
    let ip = "198.51.100.23";
    let request = AuthorizeRequest {
        client_ip: ip.into(),
        ..AuthorizeRequest::default()
    };
    let decision = admission.authorize(&link.id, &request).await?;
    let AdmissionDecision::RequireProof { campaign_id, message, .. } = decision else {
        println!("    {YELLOW}unexpected decision {:?}{RESET}", decision);
        return Ok(());
    };
    detail("campaign", &campaign_id);
    detail("must sign", &message);

    // --- 6. Proof ----------------------------------------------------------
    step(6, "the viewer signs the ad view");
    let viewer = NodeKeypair::generate();
    let proof = ProofSubmission {
        client_ip: ip.into(),
        campaign_id: campaign_id.clone(),
        wallet: Some(viewer.address()),
        signature: viewer.sign(view_proof_message(&link.id, &campaign_id, &client_key(ip, &link.id)).as_bytes()),
    };
    if let AdmissionDecision::Granted { token, expires_at } = admission.accept_proof(&link.id, &proof).await? {
        detail("session token", token);
        detail("expires at", expires_at);
        detail("slots taken", admission.sessions().len());
        ok("ad view recorded with the registry");
    }

    println!();
    Ok(())
}
