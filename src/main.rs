mod config;
mod dialer;
mod egress;
mod ingress;
mod node;
mod parser;
mod publisher;
mod subscription;
mod update;
mod web;

use anyhow::Result;
use clap::Parser;
use clash_lib::setup_default_crypto_provider;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "conflux")]
#[command(about = "Aggregates airport subscriptions into a deduplicated, geo-labelled node list")]
struct Args {
    /// Data root holding the token and the published node.conf
    #[arg(long, default_value = "/data/conflux")]
    data_dir: String,

    /// HTTP listen port
    #[arg(short, long, default_value = "80")]
    port: u16,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

const STALE_CHECK_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);
const STALE_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .init();

    setup_default_crypto_provider();

    info!("conflux {} starting...", env!("CARGO_PKG_VERSION"));
    let config = Arc::new(config::Config::load(&args.data_dir)?);
    info!(
        "{} subscription sources configured, data root {}",
        config.airports.len(),
        config.paths.data_dir().display()
    );

    let dialer: Arc<dyn dialer::ProxyDialer> = Arc::new(dialer::ClashDialer::new()?);

    if !config.paths.node_conf().exists() {
        warn!("node.conf missing, scheduling initial update");
        tokio::spawn(update::update_nodes(config.clone(), dialer.clone()));
    }
    tokio::spawn(stale_checker(config.clone(), dialer.clone()));

    let state = web::AppState { config, dialer };
    web::serve(state, args.port).await
}

/// Refresh the manifest when it has gone a full day without an update.
async fn stale_checker(config: Arc<config::Config>, dialer: Arc<dyn dialer::ProxyDialer>) {
    let mut interval = tokio::time::interval(STALE_CHECK_INTERVAL);
    interval.tick().await;
    loop {
        interval.tick().await;
        let modified = tokio::fs::metadata(config.paths.node_conf())
            .await
            .and_then(|meta| meta.modified());
        if let Ok(modified) = modified {
            if modified.elapsed().map_or(false, |age| age > STALE_AFTER) {
                warn!("node.conf older than 24h, running update");
                update::update_nodes(config.clone(), dialer.clone()).await;
            }
        }
    }
}
