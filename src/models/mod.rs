mod outbox;
mod record;
mod table;

pub use outbox::{
    BulkWriteOp, OutboxAction, OutboxEntry, OutboxPayload, OutboxStatus, PayloadError,
};
pub use record::{document_id, Source, SyncableRecord};
pub use table::{RemoteEntity, Table};
