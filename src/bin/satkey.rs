//! Key tool: generate a node keypair or inspect an existing key file.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use satellite::Keypair;

#[derive(Parser, Debug)]
#[command(name = "satkey")]
#[command(author, version, about = "Generate or read satellite node keys", long_about = None)]
struct Args {
    /// Destination file name
    #[arg(short, long, default_value = "mykey.key")]
    file: String,

    /// Read an existing key instead of generating one
    #[arg(short, long)]
    read: bool,
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let args = Args::parse();

    if args.read {
        info!(file = %args.file, "reading key");
        let keypair = Keypair::read_from(&args.file).context("failed to read key")?;
        println!("{}", keypair.identity());
        return Ok(());
    }

    if Path::new(&args.file).exists() {
        anyhow::bail!("refusing to overwrite existing key file {}", args.file);
    }

    info!("generating keys");
    let keypair = Keypair::generate();
    keypair.write_to(&args.file)?;

    info!(id = %keypair.identity(), file = %args.file, "new key generated");
    println!("{}", keypair.identity());
    Ok(())
}
