// Xenstats Exporter - XenServer metrics for Prometheus
//
// Polls one or more XenServer / XCP-ng hosts through XenAPI on every
// scrape and publishes host CPU accounting (and optionally memory, pool
// and storage repository state) in the Prometheus text format.
//
// # Features
// - One cached XenAPI session per configured host
// - Host CPU totals, used and free vCPUs (control domains excluded)
// - Collectors run concurrently; each reports duration and success
// - Collectors enabled by name on the command line
//
// # Usage
// xenstats-exporter --config.file config.yml --web.listen :9290
//
// Example:
// xenstats-exporter --config.file /etc/xenstats/config.yml --collectors.enabled "[defaults],memory"

use anyhow::{Context, Result};
use clap::Parser;
use std::env;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// Module declarations
mod config;
mod exposition;
mod metrics;
mod registry;
mod scrape;
mod server;
mod session;
mod xenapi;

use config::ExporterConfig;
use metrics::CollectorContext;
use registry::{expand_enabled_collectors, CollectorRegistry};
use scrape::Scraper;
use session::SessionCache;
use xenapi::jsonrpc::JsonRpcConnector;

/// Prometheus exporter for XenServer host statistics
#[derive(Parser, Debug)]
#[command(name = "xenstats-exporter", version, about)]
struct Cli {
    /// Address on which to expose metrics and web interface.
    #[arg(long = "web.listen", default_value = ":9290")]
    listen_address: String,

    /// Path under which to expose metrics.
    #[arg(long = "web.path", default_value = "/metrics")]
    metrics_path: String,

    /// Config file path.
    #[arg(long = "config.file", default_value = "config.yml")]
    config_file: String,

    /// Namespace for the exporter's metrics.
    #[arg(long, default_value = "xenstats")]
    namespace: String,

    /// Comma-separated list of collectors to use. `[defaults]` stands for
    /// the default set.
    #[arg(long = "collectors.enabled", default_value = registry::DEFAULTS_PLACEHOLDER)]
    collectors_enabled: String,
}

/// Application entry point
///
/// This function:
/// 1. Initializes logging and parses command-line arguments
/// 2. Loads the host list
/// 3. Instantiates the enabled collectors (unknown names are fatal)
/// 4. Serves the metrics endpoint until Ctrl+C
#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    info!("=== Xenstats Exporter Starting ===");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    anyhow::ensure!(
        metrics_path_is_valid(&cli.metrics_path),
        "--web.path must be an absolute path other than '/' and '{}' without route parameters, got '{}'",
        server::HEALTH_PATH,
        cli.metrics_path
    );

    let config = ExporterConfig::load(&cli.config_file).context("Failed to load configuration")?;

    let connector = JsonRpcConnector::new(config.rpc_timeout(), config.accept_invalid_certs)
        .context("Failed to set up XenAPI transport")?;
    let sessions = Arc::new(SessionCache::new(
        Arc::new(connector),
        config.session.revalidate,
    ));

    let ctx = CollectorContext {
        namespace: cli.namespace.clone(),
        hosts: Arc::new(config.xenhosts),
        sessions,
    };

    let registry = CollectorRegistry::with_defaults();
    let names = expand_enabled_collectors(&cli.collectors_enabled);
    let collectors = registry.enable(&names, &ctx).with_context(|| {
        format!(
            "Couldn't load collectors (available: {})",
            registry.names().join(", ")
        )
    })?;

    let scraper = Arc::new(Scraper::new(&cli.namespace, collectors));
    info!("Enabled collectors: {}", scraper.collector_names().join(", "));

    let app = server::router(scraper, &cli.metrics_path);
    let addr = listen_addr(&cli.listen_address);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("cannot listen on {}", addr))?;

    info!("=== Xenstats Exporter Started Successfully ===");
    info!("Listening on {}{}", addr, cli.metrics_path);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("Shutting down");
    Ok(())
}

/// Accepts Go-style `:9290` as shorthand for all interfaces
fn listen_addr(listen: &str) -> String {
    if listen.starts_with(':') {
        format!("0.0.0.0{}", listen)
    } else {
        listen.to_string()
    }
}

/// The metrics route must not collide with the built-in routes or be read
/// by the router as a `:param` / `*wildcard` pattern
fn metrics_path_is_valid(path: &str) -> bool {
    path.starts_with('/')
        && path != "/"
        && path != server::HEALTH_PATH
        && !path
            .split('/')
            .any(|segment| segment.starts_with(':') || segment.starts_with('*'))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}

/// Initializes the logging subsystem
///
/// Default level is INFO, overridable with RUST_LOG. Under systemd
/// (INVOCATION_ID set) logs are JSON, otherwise human-readable.
///
/// # Examples
/// ```bash
/// RUST_LOG=debug xenstats-exporter ...  # Per-collector timings and RPC calls
/// RUST_LOG=warn xenstats-exporter ...   # Only warnings and errors
/// ```
fn init_logging() {
    let is_systemd = env::var("INVOCATION_ID").is_ok();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if is_systemd {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_ansi(true),
            )
            .init();
    }
}
