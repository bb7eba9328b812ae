use clap::ValueEnum;

mod config_cmd;
mod outbox_cmd;
mod record;
mod sync_cmd;

pub use config_cmd::ConfigCommand;
pub use outbox_cmd::OutboxCommand;
pub use record::RecordCommand;
pub use sync_cmd::SyncCommand;

#[derive(Clone, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}
