use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::{SqliteConnection, SqlitePool};
use std::str::FromStr;
use uuid::Uuid;

use super::{format_timestamp, parse_timestamp};
use crate::error::StoreError;
use crate::models::{document_id, OutboxPayload, Source, SyncableRecord, Table};
use crate::sync::{CapturedChange, Change, ChangeCapture, SignalPublisher};

/// The durable entity store. Every local mutation commits together with its
/// outbox entry; nothing is visible to other readers before both are written.
#[derive(Clone)]
pub struct EntityStore {
    pool: SqlitePool,
    capture: ChangeCapture,
    signals: Option<SignalPublisher>,
}

#[derive(sqlx::FromRow)]
struct RecordRow {
    id: String,
    source: String,
    document: String,
    updated_at: String,
}

impl RecordRow {
    fn into_record(self, table: Table) -> Result<SyncableRecord, StoreError> {
        let corrupt = |reason: String| StoreError::CorruptRow {
            table: table.name().to_string(),
            reason: format!("{}: {}", self.id, reason),
        };
        let source = Source::from_str(&self.source).map_err(corrupt)?;
        let document = serde_json::from_str(&self.document).map_err(|e| corrupt(e.to_string()))?;
        let updated_at = parse_timestamp(table.name(), &self.updated_at)?;
        Ok(SyncableRecord {
            id: self.id,
            source,
            document,
            updated_at,
        })
    }
}

async fn fetch_row(
    conn: &mut SqliteConnection,
    table: Table,
    id: &str,
) -> Result<Option<SyncableRecord>, StoreError> {
    let sql = format!(
        "SELECT id, source, document, updated_at FROM {} WHERE id = ?",
        table.name()
    );
    let row: Option<RecordRow> = sqlx::query_as(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(|r| r.into_record(table)).transpose()
}

/// Writes a server-origin record without touching the outbox.
pub(crate) async fn upsert_server_record(
    conn: &mut SqliteConnection,
    table: Table,
    id: &str,
    document: &Value,
) -> Result<(), StoreError> {
    ensure_entity_table(table)?;
    let sql = format!(
        r#"
        INSERT INTO {} (id, source, document, updated_at) VALUES (?, 'server', ?, ?)
        ON CONFLICT(id) DO UPDATE SET source = 'server', document = excluded.document, updated_at = excluded.updated_at
        "#,
        table.name()
    );
    sqlx::query(&sql)
        .bind(id)
        .bind(serde_json::to_string(document)?)
        .bind(format_timestamp(Utc::now()))
        .execute(&mut *conn)
        .await?;
    Ok(())
}

fn ensure_entity_table(table: Table) -> Result<(), StoreError> {
    if table.is_entity_table() {
        Ok(())
    } else {
        Err(StoreError::NotEntityTable(table))
    }
}

fn as_object(document: Value) -> Result<Map<String, Value>, StoreError> {
    match document {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::InvalidDocument(format!(
            "expected a JSON object, got {}",
            other
        ))),
    }
}

impl EntityStore {
    pub fn new(pool: SqlitePool, device_id: impl Into<String>) -> Self {
        Self {
            pool,
            capture: ChangeCapture::new(device_id),
            signals: None,
        }
    }

    /// Publishes a sync signal after every committed capture.
    pub fn with_signals(mut self, signals: SignalPublisher) -> Self {
        self.signals = Some(signals);
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn device_id(&self) -> &str {
        self.capture.device_id()
    }

    /// The per-device settings row is always keyed by the device id, which
    /// is also where pulled server copies land.
    fn record_key<'a>(&'a self, table: Table, id: &'a str) -> &'a str {
        if table.is_device_singleton() {
            self.device_id()
        } else {
            id
        }
    }

    /// Inserts a local record. The id comes from the document's `_id`, or is
    /// generated when absent. Device settings always take the device id.
    pub async fn insert(&self, table: Table, document: Value) -> Result<SyncableRecord, StoreError> {
        ensure_entity_table(table)?;
        let mut doc = as_object(document)?;
        let id = if table.is_device_singleton() {
            self.device_id().to_string()
        } else {
            document_id(&Value::Object(doc.clone())).unwrap_or_else(|| Uuid::new_v4().to_string())
        };
        doc.insert("_id".to_string(), Value::String(id.clone()));
        let document = Value::Object(doc);
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;

        if fetch_row(&mut tx, table, &id).await?.is_some() {
            return Err(StoreError::AlreadyExists { table, id });
        }

        let sql = format!(
            "INSERT INTO {} (id, source, document, updated_at) VALUES (?, 'local', ?, ?)",
            table.name()
        );
        sqlx::query(&sql)
            .bind(&id)
            .bind(serde_json::to_string(&document)?)
            .bind(format_timestamp(now))
            .execute(&mut *tx)
            .await?;

        let captured = self
            .capture
            .capture(
                &mut tx,
                Change {
                    table,
                    record_id: &id,
                    source: Source::Local,
                    image: &document,
                    previous: None,
                    payload: OutboxPayload::insert(document.clone()),
                },
            )
            .await?;

        tx.commit().await?;
        self.notify(captured);

        Ok(SyncableRecord {
            id,
            source: Source::Local,
            document,
            updated_at: parse_timestamp(table.name(), &format_timestamp(now))?,
        })
    }

    /// Applies a shallow `$set` of `changes` to an existing record.
    pub async fn update(
        &self,
        table: Table,
        id: &str,
        changes: Value,
    ) -> Result<SyncableRecord, StoreError> {
        ensure_entity_table(table)?;
        let id = self.record_key(table, id);
        let changes = as_object(changes)?;
        if let Some(new_id) = changes.get("_id") {
            if new_id.as_str() != Some(id) {
                return Err(StoreError::InvalidDocument("_id cannot be changed".to_string()));
            }
        }

        let mut tx = self.pool.begin().await?;

        let existing = fetch_row(&mut tx, table, id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                table,
                id: id.to_string(),
            })?;

        let previous = existing.document;
        let mut merged = as_object(previous.clone())?;
        for (key, value) in &changes {
            merged.insert(key.clone(), value.clone());
        }
        let document = Value::Object(merged);
        let now = Utc::now();

        let sql = format!(
            "UPDATE {} SET document = ?, updated_at = ? WHERE id = ?",
            table.name()
        );
        sqlx::query(&sql)
            .bind(serde_json::to_string(&document)?)
            .bind(format_timestamp(now))
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let captured = self
            .capture
            .capture(
                &mut tx,
                Change {
                    table,
                    record_id: id,
                    source: existing.source,
                    image: &document,
                    previous: Some(&previous),
                    payload: OutboxPayload::update(id, Value::Object(changes)),
                },
            )
            .await?;

        tx.commit().await?;
        self.notify(captured);

        Ok(SyncableRecord {
            id: id.to_string(),
            source: existing.source,
            document,
            updated_at: parse_timestamp(table.name(), &format_timestamp(now))?,
        })
    }

    pub async fn delete(&self, table: Table, id: &str) -> Result<(), StoreError> {
        ensure_entity_table(table)?;
        let id = self.record_key(table, id);
        let mut tx = self.pool.begin().await?;

        let existing = fetch_row(&mut tx, table, id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                table,
                id: id.to_string(),
            })?;

        let sql = format!("DELETE FROM {} WHERE id = ?", table.name());
        sqlx::query(&sql).bind(id).execute(&mut *tx).await?;

        let captured = self
            .capture
            .capture(
                &mut tx,
                Change {
                    table,
                    record_id: id,
                    source: existing.source,
                    image: &existing.document,
                    previous: None,
                    payload: OutboxPayload::delete(id),
                },
            )
            .await?;

        tx.commit().await?;
        self.notify(captured);
        Ok(())
    }

    pub async fn get(&self, table: Table, id: &str) -> Result<Option<SyncableRecord>, StoreError> {
        ensure_entity_table(table)?;
        let id = self.record_key(table, id);
        let mut conn = self.pool.acquire().await?;
        fetch_row(&mut conn, table, id).await
    }

    pub async fn list(&self, table: Table) -> Result<Vec<SyncableRecord>, StoreError> {
        ensure_entity_table(table)?;
        let sql = format!(
            "SELECT id, source, document, updated_at FROM {} ORDER BY updated_at, id",
            table.name()
        );
        let rows: Vec<RecordRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        rows.into_iter().map(|r| r.into_record(table)).collect()
    }

    fn notify(&self, captured: Option<CapturedChange>) {
        if let (Some(signals), Some(CapturedChange {
            entity: Some(entity),
            ..
        })) = (&self.signals, captured)
        {
            signals.publish(entity);
        }
    }
}
