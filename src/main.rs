use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use commands::{ConfigCommand, OutboxCommand, RecordCommand, SyncCommand};
use tillsync::config::Config;
use tillsync::db::{init_db, load_or_create_device_id, EntityStore};

#[derive(Parser)]
#[command(name = "tillsync")]
#[command(version)]
#[command(about = "Offline-first point-of-sale store with server sync", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create, change and inspect local records
    Record(RecordCommand),

    /// Inspect and maintain the outbox
    Outbox(OutboxCommand),

    /// Push, pull, or run the background sync service
    Sync(SyncCommand),

    /// Manage configuration
    Config(ConfigCommand),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tillsync=info".into()),
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

    let config = Config::load(cli.config)?;

    let Some(command) = cli.command else {
        println!("Use --help to see available commands");
        return Ok(());
    };

    if let Commands::Config(cmd) = &command {
        cmd.run(&config)?;
        return Ok(());
    }

    let pool = init_db(&config.database_path.value).await?;
    let device_id = match &config.device_id.value {
        Some(id) => id.clone(),
        None => load_or_create_device_id(&pool).await?,
    };
    tracing::debug!(%device_id, db = %config.database_path.value.display(), "store opened");
    let store = EntityStore::new(pool, device_id);

    match command {
        Commands::Record(cmd) => cmd.run(&store).await?,
        Commands::Outbox(cmd) => cmd.run(&store, &config).await?,
        Commands::Sync(cmd) => cmd.run(store, &config).await?,
        Commands::Config(_) => {}
    }

    Ok(())
}
