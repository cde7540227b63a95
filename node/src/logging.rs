//! # Structured Logging
//!
//! Initializes the `tracing` subscriber with configurable format (JSON or
//! pretty-printed) and environment-based filtering via `RUST_LOG`.
//!
//! All log output is written to stderr so that stdout remains available for
//! command output such as `status` JSON.

use clap::ValueEnum;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable, colored output. Suitable for local development.
    Pretty,
    /// Machine-parseable JSON lines. Suitable for production log aggregation.
    Json,
}

/// Builds the filter: `RUST_LOG` when set and valid, else `default_level`.
///
/// `RUST_LOG` syntax follows the `tracing_subscriber::EnvFilter`
/// directives, e.g.:
///
/// ```text
/// RUST_LOG=driftcast_node=debug,driftcast_protocol=info,tower_http=debug
/// ```
pub fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Initialize the global tracing subscriber.
///
/// Call this once, early in `main()`. A second call leaves the first
/// subscriber in place and logs a warning.
pub fn init_logging(default_level: &str, format: LogFormat) {
    let filter = env_filter(default_level);

    let installed = match format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr).with_target(true))
            .try_init(),
    };

    match installed {
        Ok(()) => tracing::info!(format = ?format, "logging initialized"),
        Err(e) => tracing::warn!(error = %e, "logging already initialized"),
    }
}
