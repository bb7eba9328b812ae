//! Change capture for syncable tables.
//!
//! Every mutation made through [`crate::db::EntityStore`] passes through
//! [`ChangeCapture::capture`] while its transaction is still open, so the
//! outbox entry commits (or rolls back) together with the mutation.
//!
//! Skipped mutations:
//! - anything on the outbox table itself
//! - tables without a pushable remote entity
//! - records whose `source` is `server`, except the per-device settings
//!   record, which is re-keyed to the device id and captured
//! - opening-balance cash transactions. An update that turns one into an
//!   ordinary transaction is captured as an insert of the full record,
//!   since the server never received it.

use chrono::Utc;
use serde_json::Value;
use sqlx::SqliteConnection;
use std::sync::Arc;
use uuid::Uuid;

use crate::db::{append_entry, NewOutboxEntry};
use crate::error::StoreError;
use crate::models::{OutboxPayload, RemoteEntity, Source, Table};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    OutboxTable,
    NotSyncable,
    ServerOrigin,
    OpeningBalance,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CaptureDecision {
    Capture {
        record_id: String,
        payload: OutboxPayload,
    },
    Skip(SkipReason),
}

/// A committed-to-be mutation as seen by the capture step.
#[derive(Debug)]
pub struct Change<'a> {
    pub table: Table,
    pub record_id: &'a str,
    pub source: Source,
    /// Post-image for inserts/updates, pre-image for deletes.
    pub image: &'a Value,
    /// Pre-image of an update.
    pub previous: Option<&'a Value>,
    pub payload: OutboxPayload,
}

/// Result of a successful append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapturedChange {
    pub sequence_id: i64,
    pub entity: Option<RemoteEntity>,
}

#[derive(Debug, Clone)]
pub struct ChangeCapture {
    device_id: Arc<str>,
}

impl ChangeCapture {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: Arc::from(device_id.into()),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn decide(&self, change: Change<'_>) -> CaptureDecision {
        let Change {
            table,
            record_id,
            source,
            image,
            previous,
            mut payload,
        } = change;

        if table == Table::Outbox {
            return CaptureDecision::Skip(SkipReason::OutboxTable);
        }
        if !table.is_captured() {
            return CaptureDecision::Skip(SkipReason::NotSyncable);
        }
        let is_opening = is_opening_balance(table, image);
        match previous.map(|p| is_opening_balance(table, p)) {
            Some(false) => {}
            Some(true) if !is_opening => payload = OutboxPayload::insert(image.clone()),
            _ if is_opening => return CaptureDecision::Skip(SkipReason::OpeningBalance),
            _ => {}
        }
        if table.is_device_singleton() {
            payload.rekey(&self.device_id);
            return CaptureDecision::Capture {
                record_id: self.device_id.to_string(),
                payload,
            };
        }
        if source == Source::Server {
            return CaptureDecision::Skip(SkipReason::ServerOrigin);
        }

        CaptureDecision::Capture {
            record_id: record_id.to_string(),
            payload,
        }
    }

    /// Appends the outbox entry for `change` on the caller's transaction.
    ///
    /// An error here must abort the surrounding transaction.
    pub async fn capture(
        &self,
        conn: &mut SqliteConnection,
        change: Change<'_>,
    ) -> Result<Option<CapturedChange>, StoreError> {
        let table = change.table;
        let (record_id, payload) = match self.decide(change) {
            CaptureDecision::Capture { record_id, payload } => (record_id, payload),
            CaptureDecision::Skip(reason) => {
                tracing::trace!(%table, ?reason, "change not captured");
                return Ok(None);
            }
        };

        let entry = NewOutboxEntry {
            request_id: Some(Uuid::new_v4().to_string()),
            table_name: table,
            record_id,
            payload,
            timestamp: Utc::now(),
        };

        let sequence_id =
            append_entry(conn, &entry)
                .await
                .map_err(|e| StoreError::Capture {
                    table,
                    record_id: entry.record_id.clone(),
                    reason: e.to_string(),
                })?;

        tracing::debug!(
            sequence_id,
            %table,
            record_id = %entry.record_id,
            action = %entry.payload.action(),
            "captured outbox entry"
        );

        Ok(Some(CapturedChange {
            sequence_id,
            entity: table.remote_entity(),
        }))
    }
}

fn is_opening_balance(table: Table, image: &Value) -> bool {
    table == Table::CashTransactions
        && image.get("type").and_then(Value::as_str) == Some("opening")
}
