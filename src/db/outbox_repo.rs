use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use std::str::FromStr;

use super::{format_timestamp, parse_timestamp};
use crate::error::StoreError;
use crate::models::{OutboxAction, OutboxEntry, OutboxPayload, OutboxStatus, Table};

/// Everything needed to append an entry; the store assigns the sequence id.
#[derive(Debug, Clone)]
pub struct NewOutboxEntry {
    pub request_id: Option<String>,
    pub table_name: Table,
    pub record_id: String,
    pub payload: OutboxPayload,
    pub timestamp: DateTime<Utc>,
}

/// Entry counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutboxCounts {
    pub pending: u64,
    pub pushed: u64,
    pub quarantined: u64,
}

/// The persisted batch a group of pending entries belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedBatch {
    pub request_id: String,
    /// Leading run of the candidate entries stamped with `request_id`.
    pub sequence_ids: Vec<i64>,
}

#[derive(sqlx::FromRow)]
struct OutboxRow {
    sequence_id: i64,
    request_id: Option<String>,
    table_name: String,
    record_id: String,
    action: String,
    payload: String,
    timestamp: String,
    status: String,
    batch_request_id: Option<String>,
    attempts: i64,
    last_error: Option<String>,
}

impl TryFrom<OutboxRow> for OutboxEntry {
    type Error = StoreError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        let corrupt = |reason: String| StoreError::CorruptRow {
            table: "outbox".to_string(),
            reason: format!("#{}: {}", row.sequence_id, reason),
        };
        Ok(OutboxEntry {
            sequence_id: row.sequence_id,
            request_id: row.request_id,
            table_name: Table::from_str(&row.table_name).map_err(corrupt)?,
            record_id: row.record_id,
            action: OutboxAction::from_str(&row.action).map_err(corrupt)?,
            payload: row.payload,
            timestamp: parse_timestamp("outbox", &row.timestamp)?,
            status: OutboxStatus::from_str(&row.status).map_err(corrupt)?,
            batch_request_id: row.batch_request_id,
            attempts: row.attempts,
            last_error: row.last_error,
        })
    }
}

const SELECT_ENTRY: &str = "SELECT sequence_id, request_id, table_name, record_id, action, payload, timestamp, status, batch_request_id, attempts, last_error FROM outbox";

/// Appends an entry inside the caller's transaction and returns its sequence id.
pub(crate) async fn append_entry(
    conn: &mut SqliteConnection,
    entry: &NewOutboxEntry,
) -> Result<i64, StoreError> {
    let payload = entry.payload.to_json()?;

    let result = sqlx::query(
        r#"
        INSERT INTO outbox (request_id, table_name, record_id, action, payload, timestamp, status)
        VALUES (?, ?, ?, ?, ?, ?, 'pending')
        "#,
    )
    .bind(&entry.request_id)
    .bind(entry.table_name.name())
    .bind(&entry.record_id)
    .bind(entry.payload.action().to_string())
    .bind(&payload)
    .bind(format_timestamp(entry.timestamp))
    .execute(&mut *conn)
    .await?;

    Ok(result.last_insert_rowid())
}

/// True while any local change to the record has not reached the server,
/// including quarantined entries awaiting an operator.
pub(crate) async fn has_unpushed_for_record(
    conn: &mut SqliteConnection,
    table: Table,
    record_id: &str,
) -> Result<bool, StoreError> {
    let (exists,): (bool,) = sqlx::query_as(
        "SELECT EXISTS(SELECT 1 FROM outbox WHERE table_name = ? AND record_id = ? AND status != 'pushed')",
    )
    .bind(table.name())
    .bind(record_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(exists)
}

/// Marks every still-pending entry of a batch as pushed.
pub(crate) async fn mark_batch_pushed(
    conn: &mut SqliteConnection,
    batch_request_id: &str,
) -> Result<u64, StoreError> {
    let result = sqlx::query(
        "UPDATE outbox SET status = 'pushed', pushed_at = ? WHERE batch_request_id = ? AND status = 'pending'",
    )
    .bind(format_timestamp(Utc::now()))
    .bind(batch_request_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

#[derive(Clone)]
pub struct OutboxRepository {
    pool: SqlitePool,
}

impl OutboxRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Pending entries of one table in replay order.
    pub async fn pending_for_table(
        &self,
        table: Table,
        limit: i64,
    ) -> Result<Vec<OutboxEntry>, StoreError> {
        let sql = format!(
            "{} WHERE table_name = ? AND status = 'pending' ORDER BY sequence_id ASC LIMIT ?",
            SELECT_ENTRY
        );
        let rows: Vec<OutboxRow> = sqlx::query_as(&sql)
            .bind(table.name())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(OutboxEntry::try_from).collect()
    }

    pub async fn list(
        &self,
        status: Option<OutboxStatus>,
        limit: i64,
    ) -> Result<Vec<OutboxEntry>, StoreError> {
        let rows: Vec<OutboxRow> = match status {
            Some(status) => {
                let sql = format!(
                    "{} WHERE status = ? ORDER BY sequence_id ASC LIMIT ?",
                    SELECT_ENTRY
                );
                sqlx::query_as(&sql)
                    .bind(status.as_str())
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!("{} ORDER BY sequence_id ASC LIMIT ?", SELECT_ENTRY);
                sqlx::query_as(&sql)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.into_iter().map(OutboxEntry::try_from).collect()
    }

    pub async fn get(&self, sequence_id: i64) -> Result<Option<OutboxEntry>, StoreError> {
        let sql = format!("{} WHERE sequence_id = ?", SELECT_ENTRY);
        let row: Option<OutboxRow> = sqlx::query_as(&sql)
            .bind(sequence_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(OutboxEntry::try_from).transpose()
    }

    /// Stamps unbatched entries with `candidate` and reads back the batch id
    /// actually stored for them, in one transaction.
    ///
    /// Returns `None` when the first entry is no longer pending. Entries that
    /// another pass stamped first keep that pass's id, and the returned group
    /// stops at the first entry whose stored id differs from the leader's.
    pub async fn claim_batch(
        &self,
        sequence_ids: &[i64],
        candidate: &str,
    ) -> Result<Option<ClaimedBatch>, StoreError> {
        let mut tx = self.pool.begin().await?;
        for sequence_id in sequence_ids {
            sqlx::query(
                "UPDATE outbox SET batch_request_id = ? WHERE sequence_id = ? AND status = 'pending' AND batch_request_id IS NULL",
            )
            .bind(candidate)
            .bind(sequence_id)
            .execute(&mut *tx)
            .await?;
        }

        let mut claimed: Option<ClaimedBatch> = None;
        for sequence_id in sequence_ids {
            let stored: Option<(Option<String>,)> = sqlx::query_as(
                "SELECT batch_request_id FROM outbox WHERE sequence_id = ? AND status = 'pending'",
            )
            .bind(sequence_id)
            .fetch_optional(&mut *tx)
            .await?;
            let Some((Some(batch),)) = stored else {
                break;
            };
            match claimed.as_mut() {
                None => {
                    claimed = Some(ClaimedBatch {
                        request_id: batch,
                        sequence_ids: vec![*sequence_id],
                    })
                }
                Some(group) if group.request_id == batch => group.sequence_ids.push(*sequence_id),
                Some(_) => break,
            }
        }
        tx.commit().await?;
        Ok(claimed)
    }

    /// Marks entries pushed. Already-pushed entries are left alone, so the
    /// returned count never double-counts a duplicate acknowledgement.
    pub async fn mark_pushed(&self, sequence_ids: &[i64]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let now = format_timestamp(Utc::now());
        let mut marked = 0;
        for sequence_id in sequence_ids {
            let result = sqlx::query(
                "UPDATE outbox SET status = 'pushed', pushed_at = ? WHERE sequence_id = ? AND status = 'pending'",
            )
            .bind(&now)
            .bind(sequence_id)
            .execute(&mut *tx)
            .await?;
            marked += result.rows_affected();
        }
        tx.commit().await?;
        Ok(marked)
    }

    /// Counts a server rejection against an entry, quarantining it once
    /// `max_rejections` is reached. Returns the entry's resulting status.
    pub async fn record_rejection(
        &self,
        sequence_id: i64,
        error: &str,
        max_rejections: i64,
    ) -> Result<OutboxStatus, StoreError> {
        let updated: Option<(String,)> = sqlx::query_as(
            r#"
            UPDATE outbox
            SET attempts = attempts + 1,
                last_error = ?,
                status = CASE WHEN attempts + 1 >= ? THEN 'quarantined' ELSE status END
            WHERE sequence_id = ? AND status = 'pending'
            RETURNING status
            "#,
        )
        .bind(error)
        .bind(max_rejections)
        .bind(sequence_id)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some((status,)) => OutboxStatus::from_str(&status).map_err(|reason| {
                StoreError::CorruptRow {
                    table: "outbox".to_string(),
                    reason,
                }
            }),
            // Not pending any more; report where it ended up.
            None => self
                .get(sequence_id)
                .await?
                .map(|entry| entry.status)
                .ok_or_else(|| StoreError::NotFound {
                    table: Table::Outbox,
                    id: sequence_id.to_string(),
                }),
        }
    }

    pub async fn quarantine(&self, sequence_id: i64, reason: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE outbox SET status = 'quarantined', last_error = ? WHERE sequence_id = ? AND status = 'pending'",
        )
        .bind(reason)
        .bind(sequence_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Operator path: put a quarantined entry back into the pending queue.
    pub async fn requeue(&self, sequence_id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'pending', attempts = 0, last_error = NULL, batch_request_id = NULL
            WHERE sequence_id = ? AND status = 'quarantined'
            "#,
        )
        .bind(sequence_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn counts(&self) -> Result<OutboxCounts, StoreError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM outbox GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = OutboxCounts::default();
        for (status, count) in rows {
            let count = count.max(0) as u64;
            match OutboxStatus::from_str(&status) {
                Ok(OutboxStatus::Pending) => counts.pending = count,
                Ok(OutboxStatus::Pushed) => counts.pushed = count,
                Ok(OutboxStatus::Quarantined) => counts.quarantined = count,
                Err(_) => {}
            }
        }
        Ok(counts)
    }

    /// Deletes pushed entries acknowledged before `cutoff`. Pending and
    /// quarantined entries are never compacted.
    pub async fn compact(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result =
            sqlx::query("DELETE FROM outbox WHERE status = 'pushed' AND pushed_at < ?")
                .bind(format_timestamp(cutoff))
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}
