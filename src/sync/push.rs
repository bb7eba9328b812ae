//! Drains pending outbox entries for one remote entity into bulk writes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::remote::{BulkOperation, BulkWriteRequest, RemoteApi};
use crate::db::OutboxRepository;
use crate::error::{StoreError, SyncError};
use crate::models::{OutboxEntry, OutboxPayload, OutboxStatus, RemoteEntity};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushConfig {
    /// Server rejections tolerated before an entry is quarantined.
    pub max_rejections: i64,
    /// Upper bound on entries per bulk write.
    pub batch_limit: i64,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            max_rejections: 3,
            batch_limit: 500,
        }
    }
}

/// What one drain-and-push pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushReport {
    pub entity: RemoteEntity,
    pub batches: Vec<String>,
    pub sent: usize,
    pub pushed: u64,
    pub rejected: usize,
    pub quarantined: usize,
}

impl PushReport {
    fn new(entity: RemoteEntity) -> Self {
        Self {
            entity,
            batches: Vec::new(),
            sent: 0,
            pushed: 0,
            rejected: 0,
            quarantined: 0,
        }
    }
}

struct Batch {
    request_id: String,
    entries: Vec<(OutboxEntry, OutboxPayload)>,
}

/// Clones share one pass lock per entity, so passes for the same entity
/// never overlap within a process.
pub struct PushPipeline<R: RemoteApi + ?Sized> {
    outbox: OutboxRepository,
    remote: Arc<R>,
    config: PushConfig,
    passes: Arc<HashMap<RemoteEntity, Mutex<()>>>,
}

impl<R: RemoteApi + ?Sized> Clone for PushPipeline<R> {
    fn clone(&self) -> Self {
        Self {
            outbox: self.outbox.clone(),
            remote: Arc::clone(&self.remote),
            config: self.config,
            passes: Arc::clone(&self.passes),
        }
    }
}

impl<R: RemoteApi + ?Sized> PushPipeline<R> {
    pub fn new(outbox: OutboxRepository, remote: Arc<R>, config: PushConfig) -> Self {
        let passes = RemoteEntity::pushable()
            .map(|entity| (entity, Mutex::new(())))
            .collect();
        Self {
            outbox,
            remote,
            config,
            passes: Arc::new(passes),
        }
    }

    /// Pushes every pending entry of `entity`'s table, batch by batch, in
    /// sequence order. Waits for any pass already running for `entity`.
    ///
    /// A transport failure leaves the current batch pending (with its batch
    /// request id already persisted) and is returned to the caller.
    pub async fn drain_and_push(&self, entity: RemoteEntity) -> Result<PushReport, SyncError> {
        let Some(pass) = self.passes.get(&entity) else {
            return Err(SyncError::NotPushable(entity));
        };
        let _pass = pass.lock().await;

        let mut report = PushReport::new(entity);
        loop {
            let Some(batch) = self.next_batch(entity, &mut report).await? else {
                break;
            };
            let size = batch.entries.len();
            let pushed = self.send_batch(entity, batch, &mut report).await?;
            if pushed < size as u64 {
                break;
            }
        }

        tracing::debug!(
            %entity,
            sent = report.sent,
            pushed = report.pushed,
            rejected = report.rejected,
            quarantined = report.quarantined,
            "push pass finished"
        );
        Ok(report)
    }

    /// Loads the next group of pending entries sharing one persisted batch
    /// request id, quarantining any whose payload cannot be decoded.
    async fn next_batch(
        &self,
        entity: RemoteEntity,
        report: &mut PushReport,
    ) -> Result<Option<Batch>, SyncError> {
        loop {
            let pending = self
                .outbox
                .pending_for_table(entity.table(), self.config.batch_limit)
                .await?;

            let mut decoded = Vec::with_capacity(pending.len());
            for entry in pending {
                match entry.decode_payload() {
                    Ok(payload) => decoded.push((entry, payload)),
                    Err(e) => {
                        tracing::error!(
                            sequence_id = entry.sequence_id,
                            %entity,
                            error = %e,
                            "quarantining undecodable outbox entry"
                        );
                        if self.outbox.quarantine(entry.sequence_id, &e.to_string()).await? {
                            report.quarantined += 1;
                        }
                    }
                }
            }

            let Some((first, _)) = decoded.first() else {
                return Ok(None);
            };

            // Resend an interrupted batch exactly as it was first stamped.
            let existing = first.batch_request_id.clone();
            let mut entries: Vec<_> = decoded
                .into_iter()
                .take_while(|(entry, _)| entry.batch_request_id == existing)
                .collect();

            let ids: Vec<i64> = entries.iter().map(|(e, _)| e.sequence_id).collect();
            let candidate = Uuid::new_v4().to_string();
            let Some(claimed) = self.outbox.claim_batch(&ids, &candidate).await? else {
                // The leader was pushed by another writer since the scan.
                continue;
            };
            if existing.is_none() && claimed.request_id != candidate {
                tracing::debug!(
                    %entity,
                    request_id = %claimed.request_id,
                    "entries already stamped by another writer"
                );
            }
            entries.truncate(claimed.sequence_ids.len());

            return Ok(Some(Batch {
                request_id: claimed.request_id,
                entries,
            }));
        }
    }

    async fn send_batch(
        &self,
        entity: RemoteEntity,
        batch: Batch,
        report: &mut PushReport,
    ) -> Result<u64, SyncError> {
        let mut operations = Vec::with_capacity(batch.entries.len());
        for (entry, payload) in &batch.entries {
            operations.push(BulkOperation {
                id: entry.sequence_id,
                request_id: entry
                    .request_id
                    .clone()
                    .unwrap_or_else(|| format!("{}:{}", batch.request_id, entry.sequence_id)),
                data: serde_json::to_string(&payload.to_operation()).map_err(StoreError::from)?,
            });
        }

        let request = BulkWriteRequest {
            request_id: batch.request_id.clone(),
            operations,
        };

        tracing::debug!(
            %entity,
            request_id = %request.request_id,
            operations = request.operations.len(),
            "sending bulk write"
        );
        report.batches.push(batch.request_id.clone());
        report.sent += request.operations.len();

        let response = match self.remote.bulk_write(entity, &request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(
                    %entity,
                    request_id = %request.request_id,
                    error = %e,
                    "bulk write failed, entries stay pending"
                );
                return Err(e);
            }
        };

        let acknowledged: HashSet<i64> = response.acknowledged.iter().copied().collect();
        let prefix: Vec<i64> = batch
            .entries
            .iter()
            .map(|(entry, _)| entry.sequence_id)
            .take_while(|id| acknowledged.contains(id))
            .collect();

        let pushed = self.outbox.mark_pushed(&prefix).await?;
        report.pushed += pushed;

        let in_batch: HashSet<i64> = batch.entries.iter().map(|(e, _)| e.sequence_id).collect();
        for rejected in &response.rejected {
            if !in_batch.contains(&rejected.id) {
                tracing::warn!(%entity, id = rejected.id, "server rejected an unknown operation id");
                continue;
            }
            report.rejected += 1;
            let status = self
                .outbox
                .record_rejection(rejected.id, &rejected.error, self.config.max_rejections)
                .await?;
            if status == OutboxStatus::Quarantined {
                report.quarantined += 1;
                tracing::error!(
                    sequence_id = rejected.id,
                    %entity,
                    error = %rejected.error,
                    "outbox entry quarantined after repeated rejections"
                );
            } else {
                tracing::warn!(
                    sequence_id = rejected.id,
                    %entity,
                    error = %rejected.error,
                    "server rejected operation"
                );
            }
        }

        if pushed > 0 {
            tracing::info!(%entity, pushed, request_id = %batch.request_id, "entries pushed");
        }
        Ok(pushed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{setup_db, TestDb};
    use crate::db::EntityStore;
    use crate::models::Table;
    use crate::sync::testing::ScriptedRemote;
    use serde_json::json;

    struct TestContext {
        store: EntityStore,
        outbox: OutboxRepository,
        remote: Arc<ScriptedRemote>,
        pipeline: PushPipeline<ScriptedRemote>,
        _db: TestDb,
    }

    async fn setup() -> TestContext {
        let db = setup_db().await;
        let outbox = OutboxRepository::new(db.pool.clone());
        let remote = Arc::new(ScriptedRemote::new());
        TestContext {
            store: EntityStore::new(db.pool.clone(), "device-1"),
            pipeline: PushPipeline::new(outbox.clone(), remote.clone(), PushConfig::default()),
            outbox,
            remote,
            _db: db,
        }
    }

    fn ops(request: &BulkWriteRequest) -> Vec<serde_json::Value> {
        request
            .operations
            .iter()
            .map(|op| serde_json::from_str(&op.data).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_insert_then_push_then_nothing_left() {
        let ctx = setup().await;
        ctx.store
            .insert(Table::Orders, json!({"_id": "o1", "total": 10}))
            .await
            .unwrap();

        let report = ctx.pipeline.drain_and_push(RemoteEntity::Orders).await.unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(report.pushed, 1);

        let requests = ctx.remote.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(
            ops(&requests[0].1),
            vec![json!({"insertOne": {"document": {"_id": "o1", "total": 10}}})]
        );

        let entries = ctx.outbox.list(None, 10).await.unwrap();
        assert_eq!(entries[0].status, OutboxStatus::Pushed);

        let second = ctx.pipeline.drain_and_push(RemoteEntity::Orders).await.unwrap();
        assert_eq!(second.sent, 0);
        assert_eq!(ctx.remote.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_batch_preserves_mutation_order() {
        let ctx = setup().await;
        ctx.store.insert(Table::Orders, json!({"_id": "o1"})).await.unwrap();
        ctx.store
            .update(Table::Orders, "o1", json!({"status": "paid"}))
            .await
            .unwrap();
        ctx.store.delete(Table::Orders, "o1").await.unwrap();

        ctx.pipeline.drain_and_push(RemoteEntity::Orders).await.unwrap();

        let requests = ctx.remote.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(
            ops(&requests[0].1),
            vec![
                json!({"insertOne": {"document": {"_id": "o1"}}}),
                json!({"updateOne": {"filter": {"_id": "o1"}, "update": {"$set": {"status": "paid"}}}}),
                json!({"deleteOne": {"filter": {"_id": "o1"}}}),
            ]
        );
        let ids: Vec<i64> = requests[0].1.operations.iter().map(|op| op.id).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_tables_push_independently() {
        let ctx = setup().await;
        ctx.store.insert(Table::Orders, json!({"_id": "o1"})).await.unwrap();
        ctx.store.insert(Table::Payments, json!({"_id": "p1"})).await.unwrap();

        let report = ctx.pipeline.drain_and_push(RemoteEntity::Payments).await.unwrap();
        assert_eq!(report.pushed, 1);

        let counts = ctx.outbox.counts().await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.pushed, 1);
    }

    #[tokio::test]
    async fn test_transport_failures_reuse_batch_id_and_never_duplicate() {
        let ctx = setup().await;
        ctx.store.insert(Table::Orders, json!({"_id": "o1"})).await.unwrap();
        ctx.store.insert(Table::Orders, json!({"_id": "o2"})).await.unwrap();
        ctx.remote.fail_next(2);

        assert!(ctx.pipeline.drain_and_push(RemoteEntity::Orders).await.is_err());
        assert!(ctx.pipeline.drain_and_push(RemoteEntity::Orders).await.is_err());
        assert_eq!(ctx.outbox.counts().await.unwrap().pending, 2);

        let report = ctx.pipeline.drain_and_push(RemoteEntity::Orders).await.unwrap();
        assert_eq!(report.pushed, 2);

        let requests = ctx.remote.requests();
        assert_eq!(requests.len(), 3);
        assert!(requests
            .iter()
            .all(|(_, r)| r.request_id == requests[0].1.request_id));
        assert_eq!(ctx.remote.applied().len(), 2);
    }

    #[tokio::test]
    async fn test_lost_response_resend_is_deduplicated_by_server() {
        let ctx = setup().await;
        ctx.store.insert(Table::Orders, json!({"_id": "o1"})).await.unwrap();
        ctx.remote.lose_response_next(1);

        assert!(ctx.pipeline.drain_and_push(RemoteEntity::Orders).await.is_err());
        assert_eq!(ctx.remote.applied().len(), 1);

        let report = ctx.pipeline.drain_and_push(RemoteEntity::Orders).await.unwrap();
        assert_eq!(report.pushed, 1);
        assert_eq!(ctx.remote.applied().len(), 1);
    }

    #[tokio::test]
    async fn test_partial_ack_marks_only_in_sequence_prefix() {
        let ctx = setup().await;
        for id in ["o1", "o2", "o3"] {
            ctx.store.insert(Table::Orders, json!({"_id": id})).await.unwrap();
        }
        let seqs: Vec<i64> = ctx
            .outbox
            .list(None, 10)
            .await
            .unwrap()
            .iter()
            .map(|e| e.sequence_id)
            .collect();
        ctx.remote.reject(seqs[1], "validation failed");

        let report = ctx.pipeline.drain_and_push(RemoteEntity::Orders).await.unwrap();
        assert_eq!(report.pushed, 1);
        assert_eq!(report.rejected, 1);

        let entries = ctx.outbox.list(None, 10).await.unwrap();
        assert_eq!(entries[0].status, OutboxStatus::Pushed);
        assert_eq!(entries[1].status, OutboxStatus::Pending);
        assert_eq!(entries[1].attempts, 1);
        assert_eq!(entries[2].status, OutboxStatus::Pending);
    }

    #[tokio::test]
    async fn test_repeated_rejection_quarantines_and_unblocks_queue() {
        let ctx = setup().await;
        ctx.store.insert(Table::Orders, json!({"_id": "o1"})).await.unwrap();
        ctx.store.insert(Table::Orders, json!({"_id": "o2"})).await.unwrap();
        let first = ctx.outbox.list(None, 10).await.unwrap()[0].sequence_id;
        ctx.remote.reject(first, "bad order");

        for _ in 0..3 {
            ctx.pipeline.drain_and_push(RemoteEntity::Orders).await.unwrap();
        }
        let entry = ctx.outbox.get(first).await.unwrap().unwrap();
        assert_eq!(entry.status, OutboxStatus::Quarantined);
        assert_eq!(entry.last_error.as_deref(), Some("bad order"));

        ctx.pipeline.drain_and_push(RemoteEntity::Orders).await.unwrap();
        let counts = ctx.outbox.counts().await.unwrap();
        assert_eq!(counts.pushed, 1);
        assert_eq!(counts.quarantined, 1);
        assert_eq!(counts.pending, 0);
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_quarantined_immediately() {
        let ctx = setup().await;
        ctx.store.insert(Table::Orders, json!({"_id": "o1"})).await.unwrap();
        ctx.store.insert(Table::Orders, json!({"_id": "o2"})).await.unwrap();
        let first = ctx.outbox.list(None, 10).await.unwrap()[0].sequence_id;

        // Drop the immutability trigger to simulate a row corrupted on disk.
        sqlx::query("DROP TRIGGER outbox_entry_immutable")
            .execute(ctx.store.pool())
            .await
            .unwrap();
        sqlx::query("UPDATE outbox SET payload = 'not json' WHERE sequence_id = ?")
            .bind(first)
            .execute(ctx.store.pool())
            .await
            .unwrap();

        let report = ctx.pipeline.drain_and_push(RemoteEntity::Orders).await.unwrap();
        assert_eq!(report.quarantined, 1);
        assert_eq!(report.pushed, 1);
        assert_eq!(
            ctx.outbox.get(first).await.unwrap().unwrap().status,
            OutboxStatus::Quarantined
        );
    }

    #[tokio::test]
    async fn test_reference_entities_are_not_pushable() {
        let ctx = setup().await;
        let result = ctx.pipeline.drain_and_push(RemoteEntity::Products).await;
        assert!(matches!(result, Err(SyncError::NotPushable(RemoteEntity::Products))));
    }

    #[tokio::test]
    async fn test_batch_limit_splits_into_multiple_requests() {
        let ctx = setup().await;
        let pipeline = PushPipeline::new(
            ctx.outbox.clone(),
            ctx.remote.clone(),
            PushConfig {
                max_rejections: 3,
                batch_limit: 2,
            },
        );
        for id in ["o1", "o2", "o3"] {
            ctx.store.insert(Table::Orders, json!({"_id": id})).await.unwrap();
        }

        let report = pipeline.drain_and_push(RemoteEntity::Orders).await.unwrap();
        assert_eq!(report.pushed, 3);
        assert_eq!(report.batches.len(), 2);
        assert_ne!(report.batches[0], report.batches[1]);
    }

    async fn persisted_batch_ids(outbox: &OutboxRepository) -> HashSet<String> {
        outbox
            .list(None, 100)
            .await
            .unwrap()
            .into_iter()
            .filter_map(|e| e.batch_request_id)
            .collect()
    }

    #[tokio::test]
    async fn test_concurrent_passes_for_one_entity_send_once() {
        let ctx = setup().await;
        ctx.store.insert(Table::Orders, json!({"_id": "o1"})).await.unwrap();
        ctx.store.insert(Table::Orders, json!({"_id": "o2"})).await.unwrap();

        let other = ctx.pipeline.clone();
        let (a, b) = tokio::join!(
            ctx.pipeline.drain_and_push(RemoteEntity::Orders),
            other.drain_and_push(RemoteEntity::Orders)
        );
        assert_eq!(a.unwrap().pushed + b.unwrap().pushed, 2);

        let requests = ctx.remote.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].1.operations.len(), 2);
        assert!(persisted_batch_ids(&ctx.outbox)
            .await
            .contains(&requests[0].1.request_id));
    }

    #[tokio::test]
    async fn test_independent_pipelines_only_send_persisted_batch_ids() {
        let ctx = setup().await;
        ctx.store.insert(Table::Orders, json!({"_id": "o1"})).await.unwrap();
        ctx.store.insert(Table::Orders, json!({"_id": "o2"})).await.unwrap();

        // Separate pipelines share no pass lock, like two processes.
        let other = PushPipeline::new(ctx.outbox.clone(), ctx.remote.clone(), PushConfig::default());
        let (a, b) = tokio::join!(
            ctx.pipeline.drain_and_push(RemoteEntity::Orders),
            other.drain_and_push(RemoteEntity::Orders)
        );
        a.unwrap();
        b.unwrap();

        let persisted = persisted_batch_ids(&ctx.outbox).await;
        assert_eq!(persisted.len(), 1);
        for (_, request) in ctx.remote.requests() {
            assert!(persisted.contains(&request.request_id));
        }
        assert_eq!(ctx.outbox.counts().await.unwrap().pushed, 2);
        assert_eq!(ctx.remote.applied().len(), 2);
    }
}
