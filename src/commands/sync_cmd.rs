//! Sync CLI commands for synchronizing with the server.

use clap::{Args, Subcommand};
use std::sync::Arc;

use super::OutputFormat;
use tillsync::config::Config;
use tillsync::db::{EntityStore, OutboxRepository};
use tillsync::models::RemoteEntity;
use tillsync::sync::{HttpRemote, PullReconciler, PushPipeline, RemoteApi, SyncService};
use tillsync::SyncError;

/// Sync with remote server
#[derive(Args)]
pub struct SyncCommand {
    #[command(subcommand)]
    command: SyncSubcommand,
}

#[derive(Subcommand)]
enum SyncSubcommand {
    /// Push pending outbox entries once
    Push {
        /// Only this entity (e.g. OrdersPush or orders)
        entity: Option<RemoteEntity>,
    },

    /// Pull server state once
    Pull {
        /// Only this entity (e.g. Products)
        entity: Option<RemoteEntity>,
    },

    /// Show sync configuration, outbox counts and server status
    Status {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Run the background sync service until interrupted
    Run,
}

impl SyncCommand {
    pub async fn run(
        &self,
        store: EntityStore,
        config: &Config,
    ) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            SyncSubcommand::Push { entity } => push(&store, config, *entity).await,
            SyncSubcommand::Pull { entity } => pull(&store, config, *entity).await,
            SyncSubcommand::Status { format } => status(&store, config, format).await,
            SyncSubcommand::Run => run_service(store, config).await,
        }
    }
}

fn remote_from_config(config: &Config) -> Result<Arc<HttpRemote>, SyncError> {
    let server_url = config
        .sync
        .server_url
        .clone()
        .ok_or(SyncError::NotConfigured)?;
    let remote = HttpRemote::new(
        server_url,
        config.sync.api_key.clone(),
        config.sync.request_timeout(),
    )?;
    Ok(Arc::new(remote))
}

async fn push(
    store: &EntityStore,
    config: &Config,
    entity: Option<RemoteEntity>,
) -> Result<(), Box<dyn std::error::Error>> {
    let remote = remote_from_config(config)?;
    let pipeline = PushPipeline::new(
        OutboxRepository::new(store.pool().clone()),
        remote,
        config.sync.push_config(),
    );

    let entities: Vec<RemoteEntity> = match entity {
        Some(entity) => vec![entity],
        None => RemoteEntity::pushable().collect(),
    };

    let mut failures = 0;
    for entity in entities {
        match pipeline.drain_and_push(entity).await {
            Ok(report) if report.sent == 0 && report.quarantined == 0 => {
                println!("  ✓ {} up to date", entity);
            }
            Ok(report) => {
                println!(
                    "  ✓ {} pushed {}/{} ({} rejected, {} quarantined)",
                    entity, report.pushed, report.sent, report.rejected, report.quarantined
                );
            }
            Err(e) => {
                failures += 1;
                println!("  ✗ {}: {}", entity, e);
            }
        }
    }

    if failures > 0 {
        return Err(format!("{} entit{} failed to push", failures, if failures == 1 { "y" } else { "ies" }).into());
    }
    Ok(())
}

async fn pull(
    store: &EntityStore,
    config: &Config,
    entity: Option<RemoteEntity>,
) -> Result<(), Box<dyn std::error::Error>> {
    let remote = remote_from_config(config)?;
    let reconciler = PullReconciler::new(
        store.pool().clone(),
        remote,
        store.device_id(),
        config.sync.pull_query(),
    );

    let entities: Vec<RemoteEntity> = match entity {
        Some(entity) => vec![entity],
        None => RemoteEntity::ALL.to_vec(),
    };

    let mut failures = 0;
    for entity in entities {
        match reconciler.pull(entity).await {
            Ok(report) => println!(
                "  ✓ {} applied {}, deferred {}, skipped {}",
                entity, report.applied, report.deferred, report.skipped_invalid
            ),
            Err(e) => {
                failures += 1;
                println!("  ✗ {}: {}", entity, e);
            }
        }
    }

    if failures > 0 {
        return Err(format!("{} entit{} failed to pull", failures, if failures == 1 { "y" } else { "ies" }).into());
    }
    Ok(())
}

async fn status(
    store: &EntityStore,
    config: &Config,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let counts = OutboxRepository::new(store.pool().clone()).counts().await?;
    let online = match remote_from_config(config) {
        Ok(remote) => Some(remote.health().await),
        Err(_) => None,
    };

    if let OutputFormat::Json = format {
        let status = serde_json::json!({
            "device_id": store.device_id(),
            "server_url": config.sync.server_url,
            "online": online,
            "outbox": counts,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Sync Status");
    println!("===========");
    println!();
    println!("Device:      {}", store.device_id());

    match &config.sync.server_url {
        Some(url) => println!("Server:      {}", url),
        None => {
            println!("Server:      not configured");
            println!();
            println!("To enable sync, add to your config file:");
            println!();
            println!("  sync:");
            println!("    server_url: \"https://pos.example.com\"");
            println!("    api_key: \"your-api-key\"");
            println!();
            println!("Or set environment variables:");
            println!("  TILLSYNC_SERVER_URL");
            println!("  TILLSYNC_API_KEY");
        }
    }
    match online {
        Some(true) => println!("Reachable:   ✓ online"),
        Some(false) => println!("Reachable:   ✗ offline"),
        None => {}
    }

    println!();
    println!("Outbox");
    println!("  pending:     {}", counts.pending);
    println!("  pushed:      {}", counts.pushed);
    println!("  quarantined: {}", counts.quarantined);
    Ok(())
}

async fn run_service(store: EntityStore, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let remote = remote_from_config(config)?;
    let settings = config.sync.sync_settings(store.device_id());
    let service = SyncService::start(store, remote, settings).await?;

    let mut status = service.status();
    println!("Sync service running. Press Ctrl-C to stop.");

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *status.borrow_and_update();
                tracing::info!(
                    pending = current.pending,
                    quarantined = current.quarantined,
                    online = current.online,
                    syncing = current.is_syncing(),
                    "sync status"
                );
            }
        }
    }

    service.shutdown().await;
    Ok(())
}
