//! Merges server-authoritative records into the local store.
//!
//! Writes go straight to the entity tables with `source = server` and never
//! touch the outbox. A record with a pending local change is left alone until
//! that change has been pushed.

use serde_json::Value;
use sqlx::{SqliteConnection, SqlitePool};
use std::sync::Arc;

use super::remote::{PullQuery, RemoteApi};
use crate::db::{has_unpushed_for_record, upsert_server_record};
use crate::error::{StoreError, SyncError};
use crate::models::{document_id, RemoteEntity, Table};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GuardedWrite {
    Applied,
    Deferred,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub entity: RemoteEntity,
    pub applied: usize,
    pub deferred: usize,
    pub skipped_invalid: usize,
}

impl ReconcileReport {
    pub(crate) fn new(entity: RemoteEntity) -> Self {
        Self {
            entity,
            applied: 0,
            deferred: 0,
            skipped_invalid: 0,
        }
    }

    pub(crate) fn count(&mut self, outcome: GuardedWrite) {
        match outcome {
            GuardedWrite::Applied => self.applied += 1,
            GuardedWrite::Deferred => self.deferred += 1,
            GuardedWrite::Invalid => self.skipped_invalid += 1,
        }
    }
}

/// Upserts one server record unless a pending local change references it.
///
/// The device settings singleton is stored under the device id whatever key
/// the server used.
pub(crate) async fn guarded_write(
    conn: &mut SqliteConnection,
    table: Table,
    device_id: &str,
    record: &Value,
) -> Result<GuardedWrite, StoreError> {
    if !record.is_object() {
        return Ok(GuardedWrite::Invalid);
    }

    let (id, document) = if table.is_device_singleton() {
        let mut document = record.clone();
        if let Some(obj) = document.as_object_mut() {
            obj.insert("_id".to_string(), Value::String(device_id.to_string()));
        }
        (device_id.to_string(), document)
    } else {
        match document_id(record) {
            Some(id) => (id, record.clone()),
            None => return Ok(GuardedWrite::Invalid),
        }
    };

    if has_unpushed_for_record(conn, table, &id).await? {
        tracing::debug!(%table, %id, "server write deferred, local change pending");
        return Ok(GuardedWrite::Deferred);
    }

    upsert_server_record(conn, table, &id, &document).await?;
    Ok(GuardedWrite::Applied)
}

pub struct PullReconciler<R: RemoteApi + ?Sized> {
    pool: SqlitePool,
    remote: Arc<R>,
    device_id: String,
    query: PullQuery,
}

impl<R: RemoteApi + ?Sized> Clone for PullReconciler<R> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            remote: Arc::clone(&self.remote),
            device_id: self.device_id.clone(),
            query: self.query.clone(),
        }
    }
}

impl<R: RemoteApi + ?Sized> PullReconciler<R> {
    pub fn new(
        pool: SqlitePool,
        remote: Arc<R>,
        device_id: impl Into<String>,
        query: PullQuery,
    ) -> Self {
        Self {
            pool,
            remote,
            device_id: device_id.into(),
            query,
        }
    }

    /// Applies `records` in one transaction.
    pub async fn reconcile(
        &self,
        entity: RemoteEntity,
        records: &[Value],
    ) -> Result<ReconcileReport, StoreError> {
        let table = entity.table();
        let mut report = ReconcileReport::new(entity);

        let mut tx = self.pool.begin().await?;
        for record in records {
            let outcome = guarded_write(&mut tx, table, &self.device_id, record).await?;
            if outcome == GuardedWrite::Invalid {
                tracing::warn!(%entity, "skipping server record without a usable _id");
            }
            report.count(outcome);
        }
        tx.commit().await?;

        tracing::debug!(
            %entity,
            applied = report.applied,
            deferred = report.deferred,
            skipped = report.skipped_invalid,
            "reconciled server records"
        );
        Ok(report)
    }

    /// Fetches the entity's server state and reconciles it.
    pub async fn pull(&self, entity: RemoteEntity) -> Result<ReconcileReport, SyncError> {
        let records = self.remote.fetch(entity, &self.query).await?;
        Ok(self.reconcile(entity, &records).await?)
    }
}
