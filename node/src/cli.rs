//! # CLI Interface
//!
//! Defines the command-line argument structure for `driftcast-node` using
//! `clap` derive. Supports five subcommands: `run`, `init`, `ingest`,
//! `status` and `version`. Every `run` flag has a `DRIFTCAST_*` environment
//! fallback so the node can be configured entirely from its unit file.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use driftcast_protocol::catalog::MediaType;
use driftcast_protocol::config::{
    DATA_REPLICATION_RATE, DEFAULT_HTTP_PORT, DEFAULT_MAX_STREAMS, DEFAULT_METRICS_PORT,
    GLOBAL_REGION, METADATA_REPLICATION_RATE,
};

use crate::logging::LogFormat;

/// Driftcast content-distribution node.
///
/// Hosts encrypted media, gossips with peers, mirrors a deterministic slice
/// of promoted content and admits viewers against proof-of-view.
#[derive(Parser, Debug)]
#[command(
    name = "driftcast-node",
    about = "Driftcast content-distribution node",
    version,
    propagate_version = true
)]
pub struct DriftcastCli {
    /// Log output format.
    #[arg(long, global = true, env = "DRIFTCAST_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    /// Default log filter when `RUST_LOG` is unset.
    #[arg(long, global = true, env = "DRIFTCAST_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the node.
    Run(RunArgs),
    /// Create the data directory and a fresh node key.
    Init(InitArgs),
    /// Encrypt a local file and register it as hosted content.
    Ingest(IngestArgs),
    /// Query the status of a running node over HTTP.
    Status(StatusArgs),
    /// Print version information and exit.
    Version,
}

/// Where the node keeps its key, database, content and snapshots.
#[derive(Args, Debug, Clone)]
pub struct DataDirArg {
    #[arg(long, short = 'd', env = "DRIFTCAST_DATA_DIR", default_value = ".driftcast")]
    pub data_dir: PathBuf,
}

/// Arguments for the `run` subcommand.
#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub data: DataDirArg,

    /// Registry name of this node. Empty runs anonymously.
    #[arg(long, env = "DRIFTCAST_NAME", default_value = "")]
    pub name: String,

    /// Public HTTP endpoint peers should use to reach this node.
    ///
    /// Defaults to `http://<public-ip or 127.0.0.1>:<http-port>`.
    #[arg(long, env = "DRIFTCAST_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Region tag, or `global`.
    #[arg(long, env = "DRIFTCAST_REGION", default_value = GLOBAL_REGION)]
    pub region: String,

    /// Externally visible IP address, used for self-detection.
    #[arg(long, env = "DRIFTCAST_PUBLIC_IP")]
    pub public_ip: Option<String>,

    /// Wallet allowed to stream any hosted link without an ad.
    #[arg(long, env = "DRIFTCAST_ADMIN_WALLET")]
    pub admin_wallet: Option<String>,

    /// Bind address for the HTTP surface.
    #[arg(long, env = "DRIFTCAST_BIND", default_value = "0.0.0.0")]
    pub bind: String,

    /// Port for the peer and viewer HTTP surface.
    #[arg(long, env = "DRIFTCAST_HTTP_PORT", default_value_t = DEFAULT_HTTP_PORT)]
    pub http_port: u16,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "DRIFTCAST_METRICS_PORT", default_value_t = DEFAULT_METRICS_PORT)]
    pub metrics_port: u16,

    /// Tracker endpoints to announce to and discover from.
    #[arg(long = "tracker", env = "DRIFTCAST_TRACKERS", value_delimiter = ',')]
    pub trackers: Vec<String>,

    /// Base URL of the registry gateway.
    #[arg(long, env = "DRIFTCAST_REGISTRY_URL", conflicts_with = "registry_file")]
    pub registry_url: Option<String>,

    /// Static registry snapshot (JSON) for single-operator deployments.
    #[arg(long, env = "DRIFTCAST_REGISTRY_FILE")]
    pub registry_file: Option<PathBuf>,

    /// Fraction of campaigns whose metadata this node mirrors.
    #[arg(long, env = "DRIFTCAST_METADATA_RATE", default_value_t = METADATA_REPLICATION_RATE)]
    pub metadata_rate: f64,

    /// Fraction of campaigns whose encrypted content this node mirrors.
    #[arg(long, env = "DRIFTCAST_DATA_RATE", default_value_t = DATA_REPLICATION_RATE)]
    pub data_rate: f64,

    /// Keep expired replicas while their campaign still has views left.
    #[arg(long, env = "DRIFTCAST_GC_SPARE_ACTIVE")]
    pub gc_spare_active: bool,
}

/// Arguments for the `init` subcommand.
#[derive(Args, Debug)]
pub struct InitArgs {
    #[command(flatten)]
    pub data: DataDirArg,

    /// Overwrite an existing node key.
    #[arg(long)]
    pub force: bool,
}

/// Arguments for the `ingest` subcommand.
#[derive(Args, Debug)]
pub struct IngestArgs {
    #[command(flatten)]
    pub data: DataDirArg,

    /// File to encrypt and host.
    pub file: PathBuf,

    #[arg(long)]
    pub title: String,

    /// Wallet credited as uploader.
    #[arg(long)]
    pub uploader: String,

    /// movie, episode, ad or other.
    #[arg(long, default_value = "movie")]
    pub media_type: MediaType,

    /// Stable media id; defaults to the content hash.
    #[arg(long)]
    pub media_id: Option<String>,

    #[arg(long)]
    pub description: Option<String>,

    #[arg(long)]
    pub season: Option<u32>,

    #[arg(long)]
    pub episode: Option<u32>,

    #[arg(long)]
    pub year: Option<u32>,

    #[arg(long, default_value = GLOBAL_REGION)]
    pub region: String,

    /// Campaign promoting this content, if any.
    #[arg(long)]
    pub campaign: Option<String>,

    #[arg(long, default_value_t = DEFAULT_MAX_STREAMS)]
    pub max_streams: u32,

    /// Name recorded as the catalog authority for this content.
    #[arg(long, env = "DRIFTCAST_NAME", default_value = "")]
    pub name: String,
}

/// Arguments for the `status` subcommand.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// HTTP endpoint of the running node.
    #[arg(long, default_value = "http://127.0.0.1:7440")]
    pub url: String,
}
