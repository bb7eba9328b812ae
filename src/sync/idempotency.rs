//! Exactly-once handling of server notifications.
//!
//! Every notification carries a `requestId`. Once a notification has been
//! applied its id is written to `processed_notifications` in the same
//! transaction as its effects, so redelivery is a no-op.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqlitePool;
use std::str::FromStr;

use super::pull::{guarded_write, ReconcileReport};
use crate::db::{mark_batch_pushed, NotificationLog};
use crate::error::StoreError;
use crate::models::RemoteEntity;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum NotificationKind {
    /// The batch whose request id matches was applied server side.
    Applied,
    /// Local state for the entity is stale and must be pulled again.
    Reload,
    Upsert {
        #[serde(default)]
        records: Vec<Value>,
    },
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Applied => "applied",
            NotificationKind::Reload => "reload",
            NotificationKind::Upsert { .. } => "upsert",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerNotification {
    pub request_id: String,
    pub entity_name: String,
    #[serde(flatten)]
    pub kind: NotificationKind,
}

impl ServerNotification {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationOutcome {
    /// Already processed.
    Duplicate,
    Acknowledged { entries: u64 },
    /// The caller must pull `entity` and then call
    /// [`IdempotencyTracker::complete_reload`].
    ReloadRequested(RemoteEntity),
    Upserted(ReconcileReport),
    /// Recorded but not applicable, e.g. an unknown entity name.
    Ignored,
}

#[derive(Clone)]
pub struct IdempotencyTracker {
    pool: SqlitePool,
    device_id: String,
}

impl IdempotencyTracker {
    pub fn new(pool: SqlitePool, device_id: impl Into<String>) -> Self {
        Self {
            pool,
            device_id: device_id.into(),
        }
    }

    pub async fn handle(
        &self,
        notification: &ServerNotification,
    ) -> Result<NotificationOutcome, StoreError> {
        let request_id = notification.request_id.as_str();
        let kind = notification.kind.as_str();
        let mut tx = self.pool.begin().await?;

        if NotificationLog::is_processed_in(&mut tx, request_id).await? {
            tracing::debug!(request_id, kind, "duplicate notification ignored");
            return Ok(NotificationOutcome::Duplicate);
        }

        let entity = RemoteEntity::from_str(&notification.entity_name).ok();

        let outcome = match (&notification.kind, entity) {
            (NotificationKind::Applied, _) => {
                let entries = mark_batch_pushed(&mut tx, request_id).await?;
                NotificationOutcome::Acknowledged { entries }
            }
            (NotificationKind::Reload, Some(entity)) => {
                // Recorded by complete_reload once the pull has landed.
                return Ok(NotificationOutcome::ReloadRequested(entity));
            }
            (NotificationKind::Upsert { records }, Some(entity)) => {
                let mut report = ReconcileReport::new(entity);
                for record in records {
                    let outcome =
                        guarded_write(&mut tx, entity.table(), &self.device_id, record).await?;
                    report.count(outcome);
                }
                NotificationOutcome::Upserted(report)
            }
            (_, None) => {
                tracing::warn!(
                    request_id,
                    entity_name = %notification.entity_name,
                    "notification for unknown entity"
                );
                NotificationOutcome::Ignored
            }
        };

        NotificationLog::record_in(&mut tx, request_id, &notification.entity_name, kind).await?;
        tx.commit().await?;

        tracing::info!(request_id, kind, ?outcome, "notification applied");
        Ok(outcome)
    }

    pub async fn is_processed(&self, request_id: &str) -> Result<bool, StoreError> {
        NotificationLog::new(self.pool.clone())
            .is_processed(request_id)
            .await
    }

    /// Marks a reload notification processed after its pull succeeded.
    pub async fn complete_reload(
        &self,
        request_id: &str,
        entity: RemoteEntity,
    ) -> Result<bool, StoreError> {
        NotificationLog::new(self.pool.clone())
            .record(request_id, entity.name(), NotificationKind::Reload.as_str())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{setup_db, TestDb};
    use crate::db::{EntityStore, OutboxRepository};
    use crate::models::{OutboxStatus, Table};
    use serde_json::json;

    struct TestContext {
        store: EntityStore,
        outbox: OutboxRepository,
        tracker: IdempotencyTracker,
        _db: TestDb,
    }

    async fn setup() -> TestContext {
        let db = setup_db().await;
        TestContext {
            store: EntityStore::new(db.pool.clone(), "device-1"),
            outbox: OutboxRepository::new(db.pool.clone()),
            tracker: IdempotencyTracker::new(db.pool.clone(), "device-1"),
            _db: db,
        }
    }

    fn notification(raw: Value) -> ServerNotification {
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn test_parse_notification_frames() {
        let parsed = ServerNotification::from_json(
            r#"{"requestId":"r1","entityName":"Products","kind":"upsert","records":[{"_id":"p1"}]}"#,
        )
        .unwrap();
        assert_eq!(parsed.request_id, "r1");
        assert_eq!(
            parsed.kind,
            NotificationKind::Upsert {
                records: vec![json!({"_id": "p1"})]
            }
        );

        let parsed =
            ServerNotification::from_json(r#"{"requestId":"r2","entityName":"OrdersPush","kind":"reload"}"#)
                .unwrap();
        assert_eq!(parsed.kind, NotificationKind::Reload);
    }

    #[tokio::test]
    async fn test_applied_marks_batch_pushed_once() {
        let ctx = setup().await;
        ctx.store.insert(Table::Orders, json!({"_id": "o1"})).await.unwrap();
        let seq = ctx.outbox.list(None, 10).await.unwrap()[0].sequence_id;
        ctx.outbox.claim_batch(&[seq], "batch-1").await.unwrap();

        let applied = notification(
            json!({"requestId": "batch-1", "entityName": "OrdersPush", "kind": "applied"}),
        );
        assert_eq!(
            ctx.tracker.handle(&applied).await.unwrap(),
            NotificationOutcome::Acknowledged { entries: 1 }
        );
        assert_eq!(
            ctx.outbox.get(seq).await.unwrap().unwrap().status,
            OutboxStatus::Pushed
        );
        assert_eq!(
            ctx.tracker.handle(&applied).await.unwrap(),
            NotificationOutcome::Duplicate
        );
    }

    #[tokio::test]
    async fn test_upsert_uses_guarded_write() {
        let ctx = setup().await;
        ctx.store
            .insert(Table::Customers, json!({"_id": "c1", "name": "Local"}))
            .await
            .unwrap();

        let upsert = notification(json!({
            "requestId": "n1",
            "entityName": "CustomersPush",
            "kind": "upsert",
            "records": [{"_id": "c1", "name": "Server"}, {"_id": "c2", "name": "New"}]
        }));
        let outcome = ctx.tracker.handle(&upsert).await.unwrap();
        let NotificationOutcome::Upserted(report) = outcome else {
            panic!("expected upsert outcome, got {:?}", outcome);
        };
        assert_eq!(report.applied, 1);
        assert_eq!(report.deferred, 1);

        let c1 = ctx.store.get(Table::Customers, "c1").await.unwrap().unwrap();
        assert_eq!(c1.document["name"], json!("Local"));
        assert_eq!(ctx.outbox.counts().await.unwrap().pending, 1);

        assert_eq!(
            ctx.tracker.handle(&upsert).await.unwrap(),
            NotificationOutcome::Duplicate
        );
    }

    #[tokio::test]
    async fn test_reload_recorded_only_after_completion() {
        let ctx = setup().await;
        let reload = notification(
            json!({"requestId": "n2", "entityName": "Products", "kind": "reload"}),
        );

        assert_eq!(
            ctx.tracker.handle(&reload).await.unwrap(),
            NotificationOutcome::ReloadRequested(RemoteEntity::Products)
        );
        assert_eq!(
            ctx.tracker.handle(&reload).await.unwrap(),
            NotificationOutcome::ReloadRequested(RemoteEntity::Products)
        );

        assert!(ctx
            .tracker
            .complete_reload("n2", RemoteEntity::Products)
            .await
            .unwrap());
        assert_eq!(
            ctx.tracker.handle(&reload).await.unwrap(),
            NotificationOutcome::Duplicate
        );
    }

    #[tokio::test]
    async fn test_unknown_entity_is_recorded_and_ignored() {
        let ctx = setup().await;
        let unknown = notification(
            json!({"requestId": "n3", "entityName": "Invoices", "kind": "reload"}),
        );
        assert_eq!(
            ctx.tracker.handle(&unknown).await.unwrap(),
            NotificationOutcome::Ignored
        );
        assert_eq!(
            ctx.tracker.handle(&unknown).await.unwrap(),
            NotificationOutcome::Duplicate
        );
    }
}
