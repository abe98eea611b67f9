use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::Level;

mod commands;
mod config;
mod inbox;

use config::NodeConfig;
use peerlog_store::FilterPreset;

#[derive(Parser)]
#[command(name = "peerlogd")]
#[command(about = "Peerlog daemon - share payloads on the LAN and keep a local commit log", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Display name (defaults to hostname)
    #[arg(short, long)]
    name: Option<String>,

    /// TCP port for incoming sessions (0 picks a free one)
    #[arg(short, long, default_value = "7656")]
    port: u16,

    /// Data directory
    #[arg(short, long)]
    data_dir: Option<String>,

    /// Service namespace to advertise and browse
    #[arg(short, long)]
    service: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Advertise and store every payload received
    Host,
    /// Browse and connect to a peer
    Join {
        /// Display name of the peer to join (defaults to the first found)
        #[arg(long)]
        peer: Option<String>,
    },
    /// Send a file to a peer
    Share {
        file: PathBuf,
        /// Display name of the recipient (defaults to the first found)
        #[arg(long)]
        peer: Option<String>,
    },
    /// Fetch commits from GitHub into the local store
    Sync {
        /// Repository as owner/name
        #[arg(long, default_value = "apple/swift")]
        repo: String,
        /// Pages of 100 commits to fetch (0 fetches nothing)
        #[arg(long, default_value = "1")]
        pages: u32,
    },
    /// Print stored commits, newest first
    Commits {
        /// all, fixes, no-merges, recent or author:<name>
        #[arg(long, default_value = "all")]
        filter: FilterPreset,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    let config = NodeConfig::new(cli.name, cli.port, cli.data_dir, cli.service);

    match cli.command {
        Some(Commands::Host) | None => commands::host(&config).await?,
        Some(Commands::Join { peer }) => commands::join(&config, peer).await?,
        Some(Commands::Share { file, peer }) => commands::share(&config, &file, peer).await?,
        Some(Commands::Sync { repo, pages }) => commands::sync(&config, &repo, pages).await?,
        Some(Commands::Commits { filter }) => commands::commits(&config, &filter)?,
    }

    Ok(())
}
