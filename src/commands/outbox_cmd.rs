use chrono::{Duration, Utc};
use clap::{Args, Subcommand};

use super::OutputFormat;
use tillsync::config::Config;
use tillsync::db::{EntityStore, OutboxRepository};
use tillsync::models::{OutboxEntry, OutboxStatus};

#[derive(Args)]
pub struct OutboxCommand {
    #[command(subcommand)]
    pub command: OutboxSubcommand,
}

#[derive(Subcommand)]
pub enum OutboxSubcommand {
    /// List outbox entries in replay order
    List {
        /// Only entries with this status (pending, pushed, quarantined)
        #[arg(long, short)]
        status: Option<OutboxStatus>,

        /// Maximum number of entries
        #[arg(long, default_value = "100")]
        limit: i64,

        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// List entries excluded from automatic retry
    Quarantined {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Return a quarantined entry to the pending queue
    Requeue {
        /// Sequence id of the entry
        sequence_id: i64,
    },

    /// Delete pushed entries past the retention period
    Compact {
        /// Override the configured retention, in days
        #[arg(long)]
        older_than_days: Option<i64>,
    },
}

fn print_entries(entries: &[OutboxEntry], format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    if entries.is_empty() {
        println!("No outbox entries found");
        return Ok(());
    }

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(entries)?);
        }
        OutputFormat::Text => {
            for entry in entries {
                println!("{}", entry);
            }
            println!("\nTotal: {} entr{}", entries.len(), if entries.len() == 1 { "y" } else { "ies" });
        }
    }
    Ok(())
}

impl OutboxCommand {
    pub async fn run(
        &self,
        store: &EntityStore,
        config: &Config,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let outbox = OutboxRepository::new(store.pool().clone());

        match &self.command {
            OutboxSubcommand::List {
                status,
                limit,
                format,
            } => {
                let entries = outbox.list(*status, *limit).await?;
                print_entries(&entries, format)
            }

            OutboxSubcommand::Quarantined { format } => {
                let entries = outbox.list(Some(OutboxStatus::Quarantined), i64::MAX).await?;
                print_entries(&entries, format)
            }

            OutboxSubcommand::Requeue { sequence_id } => {
                if outbox.requeue(*sequence_id).await? {
                    println!("Requeued entry #{}", sequence_id);
                    Ok(())
                } else {
                    Err(format!("Entry #{} is not quarantined", sequence_id).into())
                }
            }

            OutboxSubcommand::Compact { older_than_days } => {
                let days = older_than_days.unwrap_or(config.sync.retention_days);
                if days < 0 {
                    return Err("Retention must not be negative".into());
                }
                let removed = outbox.compact(Utc::now() - Duration::days(days)).await?;
                println!("Removed {} pushed entr{}", removed, if removed == 1 { "y" } else { "ies" });
                Ok(())
            }
        }
    }
}
