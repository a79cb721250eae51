//! tower-relay binary entry point.
//!
//! Usage:
//! ```bash
//! tower-relay --config relay.toml
//! RUST_LOG=debug tower-relay --bind 0.0.0.0:7447
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use tower_relay::{Config, Relay};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Development pub/sub relay for tower rendezvous.
#[derive(Parser, Debug)]
#[command(name = "tower-relay")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file; defaults are used when it does not exist
    #[arg(long, short, default_value = "relay.toml")]
    config: PathBuf,

    /// Override the bind address from the configuration
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = if cli.config.exists() {
        Config::from_file(&cli.config)
            .with_context(|| format!("failed to load {}", cli.config.display()))?
    } else {
        info!("{} not found, using defaults", cli.config.display());
        Config::default()
    };
    if let Some(bind) = cli.bind {
        config.server.bind_address = bind;
    }

    let relay = Relay::new(config);
    let listener = relay.bind().await.context("failed to bind relay address")?;

    tokio::select! {
        result = relay.serve(listener) => result.context("relay stopped")?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }

    let stats = relay.stats();
    info!(
        "served {} connections, accepted {} events, refused {} invalid and {} rate-limited",
        stats.connections_total.load(Ordering::Relaxed),
        stats.events_accepted.load(Ordering::Relaxed),
        stats.events_invalid.load(Ordering::Relaxed),
        stats.rate_limit_hits.load(Ordering::Relaxed),
    );
    Ok(())
}
