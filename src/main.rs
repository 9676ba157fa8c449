use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use los_sync::commands::{ConfigCommand, RecordCommand, SyncCommand, TombstonesCommand};
use los_sync::config::Config;

#[derive(Parser)]
#[command(name = "los")]
#[command(version)]
#[command(about = "Keeps life-tracking records in sync across devices", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync with the server
    Sync(SyncCommand),

    /// Read and write local records
    Record(RecordCommand),

    /// Inspect and prune recorded deletions
    Tombstones(TombstonesCommand),

    /// Manage configuration
    Config(ConfigCommand),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "los=warn,los_sync=warn,los_sync_core=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config)?;

    match cli.command {
        Some(Commands::Sync(cmd)) => cmd.run(&config).await?,
        Some(Commands::Record(cmd)) => cmd.run(&config).await?,
        Some(Commands::Tombstones(cmd)) => cmd.run(&config).await?,
        Some(Commands::Config(cmd)) => cmd.run(&config)?,
        None => {
            println!("Use --help to see available commands");
        }
    }

    Ok(())
}
