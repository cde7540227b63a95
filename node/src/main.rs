// Copyright (c) 2026 Driftcast Contributors. MIT License.
// See LICENSE for details.

//! # Driftcast Node
//!
//! Entry point for the `driftcast-node` binary. Parses CLI arguments,
//! initializes logging and metrics, wires the protocol components together,
//! starts the background loops and serves the HTTP surface.
//!
//! The binary supports five subcommands:
//!
//! - `run`: start the node
//! - `init`: create the data directory and a node key
//! - `ingest`: encrypt a local file and register it as hosted content
//! - `status`: query a running node's status endpoint
//! - `version`: print build version information

mod api;
mod cli;
mod logging;
mod metrics;

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use driftcast_protocol::catalog::{CatalogDb, CatalogStore, ContentSummary, IngestRequest, LinkRegistry};
use driftcast_protocol::config::{NodeConfig, CONTENT_DOWNLOAD_TIMEOUT, PROTOCOL_VERSION};
use driftcast_protocol::crypto::keys::NodeKeypair;
use driftcast_protocol::identity::NodeIdentity;
use driftcast_protocol::network::{
    AnnouncementSource, GossipEngine, HttpPeerClient, NodeStats, PeerClient, PeerDirectory,
    TrackerClient,
};
use driftcast_protocol::registry::{HttpRegistry, InMemoryRegistry, Registry};
use driftcast_protocol::replication::{GarbageCollector, GcPolicy, ReplicationScheduler, StatvfsUsage};
use driftcast_protocol::streaming::{StreamAdmission, SystemLoad};

use cli::{Commands, DriftcastCli};
use metrics::{NodeMetrics, Sample};

/// How often component counters are copied into the Prometheus gauges.
const METRICS_SAMPLE_INTERVAL: Duration = Duration::from_secs(15);

/// How long background loops get to observe shutdown before they are
/// abandoned.
const LOOP_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = DriftcastCli::parse();
    logging::init_logging(&cli.log_level, cli.log_format);

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Init(args) => init_node(args),
        Commands::Ingest(args) => ingest(args).await,
        Commands::Status(args) => query_status(args).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

fn node_config(args: &cli::RunArgs) -> NodeConfig {
    let defaults = NodeConfig::default();
    let endpoint = args.endpoint.clone().unwrap_or_else(|| {
        format!(
            "http://{}:{}",
            args.public_ip.as_deref().unwrap_or("127.0.0.1"),
            args.http_port
        )
    });
    let mut replication = defaults.replication.clone();
    replication.metadata_rate = args.metadata_rate.clamp(0.0, 1.0);
    replication.data_rate = args.data_rate.clamp(0.0, 1.0);
    replication.spare_active = args.gc_spare_active;

    NodeConfig {
        name: args.name.clone(),
        endpoint,
        region: args.region.clone(),
        public_ip: args.public_ip.clone(),
        admin_wallet: args.admin_wallet.clone(),
        data_dir: args.data.data_dir.clone(),
        trackers: args.trackers.iter().filter(|t| !t.trim().is_empty()).cloned().collect(),
        replication,
        ..defaults
    }
}

/// Reads the hex node key, generating and persisting one on first run.
fn load_or_create_key(path: &Path) -> Result<NodeKeypair> {
    match std::fs::read_to_string(path) {
        Ok(raw) => NodeKeypair::from_hex(raw.trim())
            .with_context(|| format!("invalid node key in {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let keypair = NodeKeypair::generate();
            write_key(path, &keypair)?;
            tracing::info!(path = %path.display(), address = %keypair.address(), "generated node key");
            Ok(keypair)
        }
        Err(e) => Err(e).with_context(|| format!("failed to read node key {}", path.display())),
    }
}

fn write_key(path: &Path, keypair: &NodeKeypair) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    std::fs::write(path, keypair.secret_key_hex())
        .with_context(|| format!("failed to write node key to {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

fn open_registry(args: &cli::RunArgs, config: &NodeConfig) -> Result<Arc<dyn Registry>> {
    if let Some(path) = &args.registry_file {
        let registry = InMemoryRegistry::from_json_file(path)
            .with_context(|| format!("failed to load registry file {}", path.display()))?;
        tracing::info!(path = %path.display(), "using static registry");
        return Ok(Arc::new(registry));
    }
    if let Some(url) = &args.registry_url {
        let registry = HttpRegistry::new(url, config.gossip.request_timeout)
            .with_context(|| format!("failed to create registry client for {}", url))?;
        tracing::info!(%url, "using registry gateway");
        return Ok(Arc::new(registry));
    }
    tracing::warn!("no registry configured, every peer is treated as anonymous");
    Ok(Arc::new(InMemoryRegistry::new()))
}

/// What this node tells trackers about itself.
struct LiveStats {
    identity: Arc<NodeIdentity>,
    directory: Arc<PeerDirectory>,
    links: Arc<LinkRegistry>,
}

impl AnnouncementSource for LiveStats {
    fn stats(&self) -> NodeStats {
        NodeStats {
            active_streams: self.links.total_active_streams(),
            hosted_items: self.links.len(),
            known_peers: self.directory.len(),
            region: self.identity.region().to_string(),
            version: PROTOCOL_VERSION.to_string(),
        }
    }

    fn content(&self) -> Vec<ContentSummary> {
        self.links.summaries()
    }
}

/// Seeds the directory from the registry and trackers, then hands over to
/// the catalog loop. The loop's first tick is the startup pull, so it
/// always samples a bootstrapped directory.
async fn bootstrap_then_sync(
    directory: Arc<PeerDirectory>,
    tracker: Arc<TrackerClient>,
    catalog: Arc<CatalogStore>,
    limit: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let bootstrap = async { (directory.bootstrap(limit).await, tracker.discover().await) };
    tokio::select! {
        (from_registry, from_trackers) = bootstrap => {
            tracing::info!(from_registry, from_trackers, peers = directory.len(), "bootstrap complete");
        }
        _ = shutdown.changed() => return,
    }
    catalog.run(shutdown).await;
}

/// Starts the node: all protocol loops, the HTTP surface and the metrics
/// endpoint.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    let config = node_config(&args);

    for dir in [
        config.data_dir.clone(),
        config.content_dir(),
        config.asset_dir(),
        config.staging_dir(),
        config.db_dir(),
    ] {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create directory {}", dir.display()))?;
    }

    // --- Identity ---
    let keypair = load_or_create_key(&config.key_path())?;
    let identity = Arc::new(
        NodeIdentity::new(keypair, &config.name, &config.endpoint, &config.region)
            .with_public_ip(config.public_ip.as_deref()),
    );
    tracing::info!(
        name = %identity.name(),
        endpoint = %identity.endpoint(),
        region = %identity.region(),
        address = %identity.address(),
        data_dir = %config.data_dir.display(),
        "starting driftcast-node"
    );

    // --- Collaborators ---
    let registry = open_registry(&args, &config)?;
    let client: Arc<dyn PeerClient> = Arc::new(
        HttpPeerClient::new(config.gossip.request_timeout).context("failed to build peer client")?,
    );

    // --- Peer directory ---
    let directory = Arc::new(PeerDirectory::new(
        identity.clone(),
        registry.clone(),
        config.gossip.max_concurrency,
    ));
    match directory.load_snapshot(&config.peer_snapshot_path()) {
        Ok(n) => tracing::info!(peers = n, "peer snapshot restored"),
        Err(e) => tracing::warn!(error = %e, "peer snapshot unreadable, starting empty"),
    }

    // --- Catalog ---
    let links = Arc::new(LinkRegistry::new(config.content_dir()));
    let restored = links
        .load_from_dir()
        .context("failed to load hosted links")?;
    let db_path = config.db_dir();
    let db = CatalogDb::open(&db_path)
        .with_context(|| format!("failed to open catalog database at {}", db_path.display()))?;
    tracing::info!(links = restored, entries = db.entry_count(), "catalog opened");
    let catalog = Arc::new(CatalogStore::new(
        db,
        links.clone(),
        directory.clone(),
        client.clone(),
        config.asset_dir(),
        config.sync.clone(),
        config.gossip.request_timeout,
    ));

    // --- Engines ---
    let gossip = Arc::new(GossipEngine::new(
        directory.clone(),
        client.clone(),
        config.gossip.clone(),
    ));
    let tracker = Arc::new(TrackerClient::new(
        directory.clone(),
        client.clone(),
        config.trackers.clone(),
        config.gossip.clone(),
    ));
    let scheduler = Arc::new(ReplicationScheduler::new(
        catalog.clone(),
        directory.clone(),
        client.clone(),
        Arc::new(StatvfsUsage),
        config.replication.clone(),
        config.staging_dir(),
        config.cursor_path(),
        CONTENT_DOWNLOAD_TIMEOUT,
    ));
    let gc = Arc::new(GarbageCollector::new(
        catalog.clone(),
        registry.clone(),
        GcPolicy::from(&config.replication),
        config.replication.gc_interval,
    ));
    let admission = Arc::new(StreamAdmission::new(
        links.clone(),
        registry.clone(),
        Arc::new(SystemLoad),
        config.admission.clone(),
        config.admin_wallet.clone(),
    ));
    let node_metrics = Arc::new(NodeMetrics::new().context("failed to create metrics registry")?);

    // --- Background loops ---
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut loops: Vec<JoinHandle<()>> = Vec::new();

    {
        let (directory, tracker, catalog) = (directory.clone(), tracker.clone(), catalog.clone());
        let limit = config.gossip.bootstrap_limit;
        let rx = shutdown_rx.clone();
        loops.push(tokio::spawn(bootstrap_then_sync(directory, tracker, catalog, limit, rx)));
    }
    {
        let gossip = gossip.clone();
        let rx = shutdown_rx.clone();
        loops.push(tokio::spawn(async move { gossip.run(rx).await }));
    }
    {
        let source: Arc<dyn AnnouncementSource> = Arc::new(LiveStats {
            identity: identity.clone(),
            directory: directory.clone(),
            links: links.clone(),
        });
        let tracker = tracker.clone();
        let rx = shutdown_rx.clone();
        loops.push(tokio::spawn(async move { tracker.run_heartbeat(source, rx).await }));
    }
    {
        let scheduler = scheduler.clone();
        let rx = shutdown_rx.clone();
        loops.push(tokio::spawn(async move { scheduler.run(rx).await }));
    }
    {
        let gc = gc.clone();
        let rx = shutdown_rx.clone();
        loops.push(tokio::spawn(async move { gc.run(rx).await }));
    }
    {
        let admission = admission.clone();
        let rx = shutdown_rx.clone();
        loops.push(tokio::spawn(async move { admission.run_sweeper(rx).await }));
    }
    {
        let metrics = node_metrics.clone();
        let (directory, gossip, catalog) = (directory.clone(), gossip.clone(), catalog.clone());
        let (scheduler, gc, admission) = (scheduler.clone(), gc.clone(), admission.clone());
        let mut rx = shutdown_rx.clone();
        loops.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(METRICS_SAMPLE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let links = catalog.links();
                        metrics.sample(Sample {
                            known_peers: directory.len() as u64,
                            trusted_peers: directory.trusted_count() as u64,
                            gossip_rounds: gossip.rounds(),
                            sync_cycles: catalog.cycles(),
                            catalog_entries: catalog.db().entry_count() as u64,
                            hosted_links: links.len() as u64,
                            replicas_acquired: scheduler.acquired(),
                            replicas_evicted: gc.evicted(),
                            active_streams: u64::from(links.total_active_streams()),
                            admissions_granted: admission.granted(),
                            admissions_denied: admission.denied(),
                        });
                    }
                    _ = rx.changed() => return,
                }
            }
        }));
    }

    // --- HTTP surface ---
    let app_state = api::AppState {
        version: format!("{} (protocol {})", env!("CARGO_PKG_VERSION"), PROTOCOL_VERSION),
        identity: identity.clone(),
        directory: directory.clone(),
        catalog: catalog.clone(),
        admission: admission.clone(),
    };
    let api_router = api::create_router(app_state);
    let api_addr = format!("{}:{}", args.bind, args.http_port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {}", api_addr))?;
    tracing::info!(addr = %api_addr, "HTTP surface listening");

    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(node_metrics.clone());
    let metrics_addr = format!("{}:{}", args.bind, args.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", metrics_addr))?;
    tracing::info!(addr = %metrics_addr, "metrics server listening");

    // --- Serve ---
    tokio::select! {
        res = axum::serve(
            api_listener,
            api_router.into_make_service_with_connect_info::<SocketAddr>(),
        ) => {
            if let Err(e) = res {
                tracing::error!(error = %e, "HTTP server error");
            }
        }
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!(error = %e, "metrics server error");
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received, stopping loops");
        }
    }

    // --- Shutdown ---
    let _ = shutdown_tx.send(true);
    let drained = tokio::time::timeout(LOOP_DRAIN_TIMEOUT, futures::future::join_all(loops)).await;
    if drained.is_err() {
        tracing::warn!("background loops did not stop in time");
    }

    if let Err(e) = directory.save_snapshot(&config.peer_snapshot_path()) {
        tracing::warn!(error = %e, "failed to save peer snapshot");
    }
    if let Err(e) = catalog.db().flush() {
        tracing::warn!(error = %e, "failed to flush catalog database");
    }
    tracing::info!("driftcast-node stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// init / ingest / status / version
// ---------------------------------------------------------------------------

/// Creates the data directory and writes a fresh node key.
fn init_node(args: cli::InitArgs) -> Result<()> {
    let config = NodeConfig {
        data_dir: args.data.data_dir,
        ..NodeConfig::default()
    };
    let key_path = config.key_path();
    if key_path.exists() && !args.force {
        bail!(
            "node key already exists at {} (pass --force to replace it)",
            key_path.display()
        );
    }
    for dir in [config.content_dir(), config.asset_dir(), config.staging_dir(), config.db_dir()] {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create directory {}", dir.display()))?;
    }

    let keypair = NodeKeypair::generate();
    write_key(&key_path, &keypair)?;
    tracing::info!(key_path = %key_path.display(), address = %keypair.address(), "node key generated");

    println!("Node initialized successfully.");
    println!("  Data directory : {}", config.data_dir.display());
    println!("  Node key       : {}", key_path.display());
    println!("  Address        : {}", keypair.address());
    Ok(())
}

/// Encrypts a file into the content directory and records it in the
/// catalog. Run it while the node is stopped: the catalog database is
/// single-writer.
async fn ingest(args: cli::IngestArgs) -> Result<()> {
    let config = NodeConfig {
        data_dir: args.data.data_dir.clone(),
        ..NodeConfig::default()
    };
    if !args.file.is_file() {
        bail!("{} is not a file", args.file.display());
    }

    let authority = if args.name.trim().is_empty() {
        load_or_create_key(&config.key_path())?.address()
    } else {
        args.name.trim().to_string()
    };

    let links = LinkRegistry::new(config.content_dir());
    let request = IngestRequest {
        media_id: args.media_id,
        media_type: args.media_type,
        description: args.description,
        season: args.season,
        episode: args.episode,
        year: args.year,
        region: args.region,
        campaign_id: args.campaign,
        max_streams: args.max_streams.max(1),
        ..IngestRequest::new(&args.title, &args.uploader)
    };
    let link = links
        .ingest_file(&args.file, request)
        .await
        .with_context(|| format!("failed to ingest {}", args.file.display()))?;

    let db_path = config.db_dir();
    let db = CatalogDb::open(&db_path)
        .with_context(|| format!("failed to open catalog database at {}", db_path.display()))?;
    db.upsert_remote(&link.manifest.summary(), &authority)
        .context("failed to record catalog entry")?;
    db.flush().context("failed to flush catalog database")?;

    println!("Ingested {}", args.file.display());
    println!("  Link id      : {}", link.id);
    println!("  Media id     : {}", link.manifest.media_id);
    println!("  Content hash : {}", link.manifest.content_hash);
    println!("  Size         : {} bytes", link.manifest.size);
    Ok(())
}

/// Queries a running node's status endpoint and prints the result.
async fn query_status(args: cli::StatusArgs) -> Result<()> {
    let url = format!("{}/status", args.url.trim_end_matches('/'));
    let response = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()?
        .get(&url)
        .send()
        .await
        .with_context(|| format!("failed to reach {}", url))?
        .error_for_status()
        .with_context(|| format!("{} returned an error", url))?;
    let status: api::StatusResponse = response
        .json()
        .await
        .context("status response is not valid JSON")?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

/// Prints version information to stdout.
fn print_version() {
    println!("driftcast-node {}", env!("CARGO_PKG_VERSION"));
    println!("protocol       {}", PROTOCOL_VERSION);
    println!("rustc          {}", rustc_version());
}

/// Returns the Rust compiler version used to build this binary.
fn rustc_version() -> &'static str {
    option_env!("RUSTC_VERSION").unwrap_or("unknown")
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported. A handler that cannot
/// be installed is logged and never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_args(extra: &[&str]) -> cli::RunArgs {
        let mut argv = vec!["driftcast-node", "run"];
        argv.extend_from_slice(extra);
        match DriftcastCli::try_parse_from(argv).unwrap().command {
            Commands::Run(args) => args,
            other => panic!("expected run, got {:?}", other),
        }
    }

    #[test]
    fn endpoint_defaults_to_public_ip_and_port() {
        let config = node_config(&run_args(&["--public-ip", "198.51.100.7", "--http-port", "8000"]));
        assert_eq!(config.endpoint, "http://198.51.100.7:8000");
        assert_eq!(config.public_ip.as_deref(), Some("198.51.100.7"));
    }

    #[test]
    fn rates_are_clamped_and_policy_carried() {
        let config = node_config(&run_args(&["--data-rate", "1.5", "--gc-spare-active"]));
        assert_eq!(config.replication.data_rate, 1.0);
        assert!(config.replication.spare_active);
    }

    #[test]
    fn key_is_created_once_and_reloaded() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("node.key");
        let first = load_or_create_key(&path).unwrap();
        let second = load_or_create_key(&path).unwrap();
        assert_eq!(first.address(), second.address());
    }

    #[test]
    fn corrupt_key_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("node.key");
        std::fs::write(&path, "not hex").unwrap();
        assert!(load_or_create_key(&path).is_err());
    }

    #[test]
    fn live_stats_reflect_components() {
        let tmp = tempfile::tempdir().unwrap();
        let identity = Arc::new(NodeIdentity::new(
            NodeKeypair::from_seed(&[9u8; 32]),
            "alpha",
            "http://127.0.0.1:7440",
            "eu",
        ));
        let directory = Arc::new(PeerDirectory::new(
            identity.clone(),
            Arc::new(InMemoryRegistry::new()),
            4,
        ));
        let source = LiveStats {
            identity,
            directory,
            links: Arc::new(LinkRegistry::new(tmp.path())),
        };
        let stats = source.stats();
        assert_eq!(stats.region, "eu");
        assert_eq!(stats.hosted_items, 0);
        assert!(source.content().is_empty());
    }

    #[tokio::test]
    async fn startup_pull_follows_bootstrap() {
        use driftcast_protocol::catalog::{Manifest, MediaType};
        use driftcast_protocol::config::{GossipConfig, SyncConfig};
        use driftcast_protocol::network::{MemoryPeerClient, SimulatedPeer};
        use driftcast_protocol::registry::RegistryNode;

        let tmp = tempfile::tempdir().unwrap();
        let registry = Arc::new(InMemoryRegistry::new());
        registry.register_node(RegistryNode {
            name: "north".into(),
            operator: "0x01".into(),
            node_address: NodeKeypair::from_seed(&[4u8; 32]).address(),
            expires_at: i64::MAX,
            active: true,
            current_ip: Some("10.6.0.1".into()),
        });

        let manifest = Manifest {
            id: "n-1".into(),
            media_id: "m1".into(),
            content_hash: "h".into(),
            title: "Night Train".into(),
            description: None,
            media_type: MediaType::Movie,
            uploader_wallet: "0xa1".into(),
            season: None,
            episode: None,
            year: None,
            poster: None,
            backdrop: None,
            size: 10,
            created_at: 0,
            region: "global".into(),
            campaign_id: None,
        };
        let client = Arc::new(MemoryPeerClient::new());
        client.serve(
            "http://10.6.0.1:7440",
            SimulatedPeer {
                catalog: vec![manifest.summary()],
                manifests: [("n-1".to_string(), manifest)].into(),
                ..SimulatedPeer::default()
            },
        );

        let identity = Arc::new(
            NodeIdentity::new(NodeKeypair::from_seed(&[9u8; 32]), "alpha", "http://203.0.113.9:7440", "global")
                .with_local_addrs(Vec::new()),
        );
        let directory = Arc::new(PeerDirectory::new(identity, registry, 4));
        assert!(directory.is_empty());
        let tracker = Arc::new(TrackerClient::new(
            directory.clone(),
            client.clone(),
            Vec::new(),
            GossipConfig::default(),
        ));
        let catalog = Arc::new(CatalogStore::new(
            CatalogDb::open_temporary().unwrap(),
            Arc::new(LinkRegistry::new(tmp.path().join("content"))),
            directory.clone(),
            client,
            tmp.path().join("assets"),
            SyncConfig::default(),
            Duration::from_secs(1),
        ));

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(bootstrap_then_sync(directory.clone(), tracker, catalog.clone(), 20, rx));
        tokio::time::timeout(Duration::from_secs(5), async {
            while catalog.cycles() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // The very first cycle already saw the bootstrapped peer.
        assert_eq!(catalog.cycles(), 1);
        assert_eq!(directory.len(), 1);
        assert_eq!(catalog.db().entry_count(), 1);

        tx.send(true).unwrap();
        task.await.unwrap();
    }
}
