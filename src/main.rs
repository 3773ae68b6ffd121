//! Gridrelay node - keeps coordinator connections alive for every identity
//!
//! Resolves the host's usable IPv4 addresses, spreads them across the
//! configured identities and holds one persistent connection per pair.

use anyhow::{Context, Result};
use clap::Parser;
use gridrelay_client::{
    allocate, resolve_local_addresses, Allocation, ClientConfig, Dispatcher, StatusAggregator,
    Supervisor,
};
use gridrelay_transport_websocket::{WebSocketConfig, WebSocketConnector};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Gridrelay - relay coordinator RPCs from every local address
#[derive(Parser, Debug)]
#[command(name = "gridrelay")]
#[command(version)]
#[command(long_version = concat!(env!("CARGO_PKG_VERSION"), "\nCommit: ", env!("GRIDRELAY_COMMIT")))]
struct Cli {
    /// YAML config file; command-line values take precedence
    #[arg(long, env = "GRIDRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Identity to connect as (repeatable)
    #[arg(long = "identity", env = "GRIDRELAY_IDENTITIES", value_delimiter = ',')]
    identities: Vec<String>,

    /// Coordinator endpoint (repeatable, ws:// or wss://)
    #[arg(long = "endpoint", env = "GRIDRELAY_ENDPOINTS", value_delimiter = ',')]
    endpoints: Vec<String>,

    /// Use at most this many local addresses (0 = all)
    #[arg(long, env = "GRIDRELAY_ADDRESS_LIMIT")]
    address_limit: Option<usize>,

    /// PEM bundle of trust anchors for the coordinator
    #[arg(long, env = "GRIDRELAY_CA_BUNDLE")]
    ca_bundle: Option<PathBuf>,

    /// Skip certificate verification (insecure, for development only)
    #[arg(long)]
    insecure: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "GRIDRELAY_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

/// Config file (or defaults) overlaid with command-line values
fn load_config(cli: &Cli) -> Result<ClientConfig> {
    let mut config = match &cli.config {
        Some(path) => ClientConfig::from_yaml_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ClientConfig::default(),
    };

    if !cli.identities.is_empty() {
        config.identities = cli.identities.clone();
    }
    if !cli.endpoints.is_empty() {
        config.endpoints = cli.endpoints.clone();
    }
    if cli.address_limit.is_some() {
        config.address_limit = cli.address_limit;
    }
    if cli.ca_bundle.is_some() {
        config.ca_bundle = cli.ca_bundle.clone();
    }
    if cli.insecure {
        config.insecure = true;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn log_allocation(allocation: &Allocation) {
    match allocation {
        Allocation::Shared {
            address,
            identities,
        } => {
            info!(
                "Single address {} shared by {} identities",
                address,
                identities.len()
            );
        }
        Allocation::Partitioned(assignments) => {
            for (identity, addresses) in assignments {
                info!("[{}] {} address(es): {:?}", identity, addresses.len(), addresses);
            }
        }
    }
}

async fn log_summary(status: StatusAggregator, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        info!("📊 {}", status.snapshot());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level);

    info!(
        "Gridrelay {} ({}) starting...",
        env!("CARGO_PKG_VERSION"),
        env!("GRIDRELAY_COMMIT")
    );

    let config = load_config(&cli)?;

    let addresses = resolve_local_addresses(config.effective_address_limit())
        .context("Failed to resolve local addresses")?;
    info!("Using {} local address(es)", addresses.len());

    let allocation =
        allocate(&config.identities, &addresses).context("Failed to allocate addresses")?;
    log_allocation(&allocation);

    let mut ws_config = WebSocketConfig::client_default();
    if let Some(ca_bundle) = &config.ca_bundle {
        ws_config = ws_config.with_ca_bundle(ca_bundle.clone());
    }
    if config.insecure {
        warn!("⚠️  Certificate verification disabled (insecure mode)");
        ws_config = ws_config.with_insecure_skip_verify();
    }
    let connector = WebSocketConnector::new(Arc::new(ws_config))
        .context("Invalid coordinator transport configuration")?;

    let status = StatusAggregator::new(config.identities.len());
    let supervisor = Supervisor::new(
        &config,
        Arc::new(connector),
        Arc::new(Dispatcher::from_config(&config)),
        status.clone(),
    );

    let plan = allocation.start_plan();
    info!(
        "Starting {} connection(s), {}s apart",
        plan.len(),
        config.start_delay.as_secs()
    );
    let starter = {
        let supervisor = supervisor.clone();
        let delay = config.start_delay;
        tokio::spawn(async move { supervisor.start_all(plan, delay).await })
    };
    let summary = tokio::spawn(log_summary(status.clone(), config.summary_interval));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C, shutting down...");

    starter.abort();
    summary.abort();
    supervisor.shutdown().await;

    info!("Gridrelay stopped ({})", status.snapshot());
    Ok(())
}
