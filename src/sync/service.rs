//! Wires the background sync machinery around an [`EntityStore`].

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::connectivity::{spawn_probe, Connectivity};
use super::dispatcher::{Dispatcher, DispatcherConfig};
use super::idempotency::IdempotencyTracker;
use super::listener::NotificationListener;
use super::pull::{PullReconciler, ReconcileReport};
use super::push::{PushConfig, PushPipeline, PushReport};
use super::remote::{PullQuery, RemoteApi};
use super::signal::signal_channels;
use super::status::{StatusReporter, SyncStatus};
use crate::db::{EntityStore, OutboxRepository};
use crate::error::{StoreError, SyncError};
use crate::models::RemoteEntity;

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub push: PushConfig,
    pub dispatcher: DispatcherConfig,
    pub pull_query: PullQuery,
    pub probe_interval: Duration,
    /// No notification listener is started when unset.
    pub notifications_url: Option<String>,
    pub reconnect_delay: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            push: PushConfig::default(),
            dispatcher: DispatcherConfig::default(),
            pull_query: PullQuery::default(),
            probe_interval: Duration::from_secs(30),
            notifications_url: None,
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

pub struct SyncService<R: RemoteApi + ?Sized> {
    store: EntityStore,
    status: StatusReporter,
    connectivity: Connectivity,
    pipeline: PushPipeline<R>,
    reconciler: PullReconciler<R>,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl<R: RemoteApi + ?Sized + 'static> SyncService<R> {
    /// Starts the dispatcher, sweep, connectivity probe and (optionally)
    /// the notification listener. Mutations must go through
    /// [`SyncService::store`] to raise sync signals.
    pub async fn start(
        store: EntityStore,
        remote: Arc<R>,
        settings: SyncSettings,
    ) -> Result<Self, StoreError> {
        let pool = store.pool().clone();
        let device_id = store.device_id().to_string();
        let outbox = OutboxRepository::new(pool.clone());
        let (publisher, receivers) = signal_channels();
        let status = StatusReporter::new(outbox.clone());
        let connectivity = Connectivity::new(true);
        let (shutdown, shutdown_rx) = watch::channel(false);

        status.set_online(true);
        status.refresh().await?;

        let pipeline = PushPipeline::new(outbox.clone(), remote.clone(), settings.push);
        let reconciler = PullReconciler::new(
            pool.clone(),
            remote.clone(),
            device_id.clone(),
            settings.pull_query.clone(),
        );

        let dispatcher = Dispatcher {
            pipeline: pipeline.clone(),
            status: status.clone(),
            connectivity: connectivity.clone(),
            config: settings.dispatcher,
        };
        let mut handles =
            dispatcher.spawn(receivers, publisher.clone(), outbox, shutdown_rx.clone());

        handles.push(spawn_probe(
            remote,
            connectivity.clone(),
            settings.probe_interval,
            shutdown_rx.clone(),
        ));
        handles.push(mirror_connectivity(
            connectivity.clone(),
            status.clone(),
            shutdown_rx.clone(),
        ));

        if let Some(url) = settings.notifications_url {
            let listener = NotificationListener {
                url,
                tracker: IdempotencyTracker::new(pool, device_id),
                reconciler: reconciler.clone(),
                reconnect_delay: settings.reconnect_delay,
            };
            handles.push(listener.spawn(shutdown_rx));
        }

        tracing::info!(tasks = handles.len(), "sync service started");

        Ok(Self {
            store: store.with_signals(publisher),
            status,
            connectivity,
            pipeline,
            reconciler,
            shutdown,
            handles,
        })
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    /// Runs a push pass now. Shares the dispatcher's pass lock, so it waits
    /// for a worker pass on the same entity to finish.
    pub async fn push(&self, entity: RemoteEntity) -> Result<PushReport, SyncError> {
        self.status.pass_started();
        let result = self.pipeline.drain_and_push(entity).await;
        self.status.pass_finished();
        self.status.refresh().await?;
        result
    }

    pub async fn pull(&self, entity: RemoteEntity) -> Result<ReconcileReport, SyncError> {
        self.reconciler.pull(entity).await
    }

    /// Stops every background task. Passes already running finish first.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "sync task ended abnormally");
            }
        }
        tracing::info!("sync service stopped");
    }
}

fn mirror_connectivity(
    connectivity: Connectivity,
    status: StatusReporter,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let mut online = connectivity.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                changed = online.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    status.set_online(*online.borrow_and_update());
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::setup_db;
    use crate::models::{OutboxStatus, Table};
    use crate::sync::testing::ScriptedRemote;
    use serde_json::json;

    fn test_settings() -> SyncSettings {
        SyncSettings {
            dispatcher: DispatcherConfig {
                sweep_interval: Duration::from_secs(3600),
                ..Default::default()
            },
            probe_interval: Duration::from_secs(3600),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_service_pushes_committed_changes() {
        let db = setup_db().await;
        let remote = Arc::new(ScriptedRemote::new());
        let service = SyncService::start(
            EntityStore::new(db.pool.clone(), "device-1"),
            remote.clone(),
            test_settings(),
        )
        .await
        .unwrap();
        let mut status = service.status();

        service
            .store()
            .insert(Table::Orders, json!({"_id": "o1", "total": 10}))
            .await
            .unwrap();

        let outbox = OutboxRepository::new(db.pool.clone());
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let entries = outbox.list(None, 10).await.unwrap();
                if entries.iter().all(|e| e.status == OutboxStatus::Pushed) && !entries.is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let current = *status.borrow_and_update();
                if current.pending == 0 && current.in_progress == 0 {
                    break;
                }
                status.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        let report = service.push(RemoteEntity::Orders).await.unwrap();
        assert_eq!(report.sent, 0);
        assert_eq!(remote.requests().len(), 1);

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_manual_push_never_overlaps_worker_pass() {
        let db = setup_db().await;
        let remote = Arc::new(ScriptedRemote::new());
        let service = SyncService::start(
            EntityStore::new(db.pool.clone(), "device-1"),
            remote.clone(),
            test_settings(),
        )
        .await
        .unwrap();

        for id in ["o1", "o2", "o3"] {
            service
                .store()
                .insert(Table::Orders, json!({"_id": id}))
                .await
                .unwrap();
        }
        service.push(RemoteEntity::Orders).await.unwrap();

        let outbox = OutboxRepository::new(db.pool.clone());
        tokio::time::timeout(Duration::from_secs(5), async {
            while outbox.counts().await.unwrap().pushed < 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let sent: usize = remote
            .requests()
            .iter()
            .map(|(_, request)| request.operations.len())
            .sum();
        assert_eq!(sent, 3);

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_service_reports_offline() {
        let db = setup_db().await;
        let remote = Arc::new(ScriptedRemote::new());
        remote.set_online(false);
        let service = SyncService::start(
            EntityStore::new(db.pool.clone(), "device-1"),
            remote,
            test_settings(),
        )
        .await
        .unwrap();
        let mut status = service.status();

        tokio::time::timeout(Duration::from_secs(5), async {
            while status.borrow_and_update().online {
                status.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
        assert!(!service.connectivity().is_online());

        service.shutdown().await;
    }
}
