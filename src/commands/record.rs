use clap::{Args, Subcommand};
use serde_json::Value;
use std::io::{self, Write};

use super::OutputFormat;
use tillsync::db::EntityStore;
use tillsync::models::Table;

#[derive(Args)]
pub struct RecordCommand {
    #[command(subcommand)]
    pub command: RecordSubcommand,
}

#[derive(Subcommand)]
pub enum RecordSubcommand {
    /// Insert a record from a JSON object
    Insert {
        /// Table name (e.g. orders, payments)
        table: Table,

        /// JSON document; `_id` is generated when absent
        document: String,
    },

    /// Set fields on an existing record
    Update {
        table: Table,

        id: String,

        /// JSON object of fields to set
        changes: String,
    },

    /// Delete a record
    Delete {
        table: Table,

        id: String,

        /// Skip confirmation prompt
        #[arg(long, short)]
        force: bool,
    },

    /// Show one record
    Show {
        table: Table,

        id: String,

        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// List the records of a table
    List {
        table: Table,

        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

fn parse_object(raw: &str) -> Result<Value, Box<dyn std::error::Error>> {
    let value: Value = serde_json::from_str(raw)?;
    if !value.is_object() {
        return Err("Expected a JSON object".into());
    }
    Ok(value)
}

impl RecordCommand {
    pub async fn run(&self, store: &EntityStore) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            RecordSubcommand::Insert { table, document } => {
                let created = store.insert(*table, parse_object(document)?).await?;
                println!("Created record:");
                println!("{}", created);
                Ok(())
            }

            RecordSubcommand::Update { table, id, changes } => {
                let updated = store.update(*table, id, parse_object(changes)?).await?;
                println!("Updated record:");
                println!("{}", updated);
                Ok(())
            }

            RecordSubcommand::Delete { table, id, force } => {
                if store.get(*table, id).await?.is_none() {
                    return Err(format!("Record not found: {}/{}", table, id).into());
                }

                if !force {
                    print!("Delete {}/{}? [y/N] ", table, id);
                    io::stdout().flush()?;

                    let mut input = String::new();
                    io::stdin().read_line(&mut input)?;

                    if !input.trim().eq_ignore_ascii_case("y") {
                        println!("Cancelled");
                        return Ok(());
                    }
                }

                store.delete(*table, id).await?;
                println!("Deleted {}/{}", table, id);
                Ok(())
            }

            RecordSubcommand::Show { table, id, format } => match store.get(*table, id).await? {
                Some(record) => {
                    match format {
                        OutputFormat::Json => {
                            println!("{}", serde_json::to_string_pretty(&record)?);
                        }
                        OutputFormat::Text => {
                            println!("{}", record);
                        }
                    }
                    Ok(())
                }
                None => Err(format!("Record not found: {}/{}", table, id).into()),
            },

            RecordSubcommand::List { table, format } => {
                let records = store.list(*table).await?;

                if records.is_empty() {
                    println!("No records in {}", table);
                    return Ok(());
                }

                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&records)?);
                    }
                    OutputFormat::Text => {
                        println!("{:<36}  {:<7}  UPDATED", "ID", "SOURCE");
                        println!("{}", "-".repeat(72));
                        for record in &records {
                            println!(
                                "{:<36}  {:<7}  {}",
                                record.id,
                                record.source,
                                record.updated_at.format("%Y-%m-%d %H:%M:%S")
                            );
                        }
                        println!("\nTotal: {} record(s)", records.len());
                    }
                }
                Ok(())
            }
        }
    }
}
