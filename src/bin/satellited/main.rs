//! Satellite daemon: runs one overlay node with the rating demo events
//! and an optional admin HTTP API.

mod api;
mod ratings;

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use satellite::{Keypair, Satellite, SatelliteConfig};

#[derive(Parser, Debug)]
#[command(name = "satellited")]
#[command(author, version, about = "Satellite overlay daemon", long_about = None)]
struct Args {
    /// Listen for peers on this host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Listen for peers on this port
    #[arg(long, default_value_t = 3000)]
    port: u16,

    /// Request a UPnP port mapping on startup
    #[arg(long)]
    upnp: bool,

    /// Bootstrap the overlay from this peer (host:port)
    #[arg(long)]
    dial: Option<String>,

    /// Enable the admin API and serve it on this address
    #[arg(long)]
    api: Option<String>,

    /// Database path
    #[arg(long)]
    dbpath: Option<String>,

    /// Read/write the node key from/to this path
    #[arg(long)]
    key: Option<String>,

    /// Generate new keys when the key file does not exist
    #[arg(long)]
    generate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    info!("starting satellite daemon");

    let Some(dbpath) = args.dbpath.as_deref() else {
        anyhow::bail!("no database path provided (--dbpath)");
    };
    let db = sled::open(dbpath).context("opening database failed")?;

    let keypair = load_keys(args.key.as_deref(), args.generate)?;

    let config = SatelliteConfig {
        host: args.host.clone(),
        port: args.port,
        enable_upnp: args.upnp,
        ..Default::default()
    };
    let sat = Satellite::build(config, keypair).await?;

    if let Some(dial_to) = &args.dial {
        info!(addr = %dial_to, "connecting overlay bootstrap");
        match sat.dial(dial_to).await {
            Ok(peer) => info!(peer = %peer.id(), "bootstrapped"),
            Err(e) => warn!(error = %e, "failed to dial bootstrap peer"),
        }
    }

    ratings::bootstrap_events(&sat, db.clone()).await?;

    if let Some(api_addr) = &args.api {
        info!(addr = %api_addr, "starting admin API");
        let router = api::router(sat.clone());
        let listener = tokio::net::TcpListener::bind(api_addr)
            .await
            .with_context(|| format!("failed to bind API listener on {}", api_addr))?;
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                error!(error = %e, "admin API server failed");
            }
        });
    } else {
        info!("no API address provided");
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("received shutdown signal, exiting gracefully");

    sat.shutdown().await;
    db.flush().context("failed to flush database")?;
    Ok(())
}

/// Load the node key, optionally creating it first.
fn load_keys(path: Option<&str>, generate: bool) -> Result<Keypair> {
    let path =
        path.context("no key path provided (--key); pass --generate to create a new one")?;

    if generate {
        if Path::new(path).exists() {
            info!("--generate specified but key already exists, using that instead");
        } else {
            info!("generating new keys");
            let keypair = Keypair::generate();
            keypair.write_to(path)?;
            info!(id = %keypair.identity(), path, "new key generated");
            return Ok(keypair);
        }
    }

    Keypair::read_from(path)
        .context("failed to load keys; the file may not exist, try --generate")
}
