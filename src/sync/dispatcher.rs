//! Schedules push passes.
//!
//! One worker task per pushable entity owns that entity's signal receiver,
//! so at most one pass per entity runs at a time. The channel holds a single
//! signal: one that arrives mid-pass waits in the slot and causes exactly
//! one follow-up pass. A sweep task re-signals every entity on a timer and
//! whenever connectivity comes back.

use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::connectivity::Connectivity;
use super::push::PushPipeline;
use super::remote::RemoteApi;
use super::signal::{SignalPublisher, SyncSignal};
use super::status::StatusReporter;
use crate::db::OutboxRepository;
use crate::models::RemoteEntity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Extra wait after a signal so bursts land in the same pass.
    pub coalesce_window: Duration,
    pub sweep_interval: Duration,
    /// Pushed entries older than this are compacted after each sweep.
    pub retention: Option<chrono::Duration>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            coalesce_window: Duration::ZERO,
            sweep_interval: Duration::from_secs(30),
            retention: Some(chrono::Duration::days(7)),
        }
    }
}

pub(crate) struct Dispatcher<R: RemoteApi + ?Sized> {
    pub pipeline: PushPipeline<R>,
    pub status: StatusReporter,
    pub connectivity: Connectivity,
    pub config: DispatcherConfig,
}

impl<R: RemoteApi + ?Sized + 'static> Dispatcher<R> {
    /// Starts one worker per receiver plus the sweep task.
    pub fn spawn(
        self,
        receivers: HashMap<RemoteEntity, mpsc::Receiver<SyncSignal>>,
        publisher: SignalPublisher,
        outbox: OutboxRepository,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles: Vec<JoinHandle<()>> = receivers
            .into_iter()
            .map(|(entity, rx)| {
                let worker = Worker {
                    entity,
                    rx,
                    pipeline: self.pipeline.clone(),
                    status: self.status.clone(),
                    connectivity: self.connectivity.clone(),
                    coalesce_window: self.config.coalesce_window,
                };
                tokio::spawn(worker.run(shutdown.clone()))
            })
            .collect();

        let sweeper = Sweeper {
            publisher,
            outbox,
            connectivity: self.connectivity,
            interval: self.config.sweep_interval,
            retention: self.config.retention,
        };
        handles.push(tokio::spawn(sweeper.run(shutdown)));
        handles
    }
}

struct Worker<R: RemoteApi + ?Sized> {
    entity: RemoteEntity,
    rx: mpsc::Receiver<SyncSignal>,
    pipeline: PushPipeline<R>,
    status: StatusReporter,
    connectivity: Connectivity,
    coalesce_window: Duration,
}

impl<R: RemoteApi + ?Sized> Worker<R> {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let entity = self.entity;
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                signal = self.rx.recv() => {
                    if signal.is_none() {
                        break;
                    }
                }
            }

            if !self.coalesce_window.is_zero() {
                tokio::time::sleep(self.coalesce_window).await;
            }
            // Anything that arrived before the pass starts is covered by it.
            while self.rx.try_recv().is_ok() {}

            if !self.connectivity.is_online() {
                tracing::debug!(%entity, "offline, push pass skipped");
                continue;
            }

            self.status.pass_started();
            let result = self.pipeline.drain_and_push(entity).await;
            self.status.pass_finished();

            match result {
                Ok(report) if report.sent > 0 => {
                    tracing::debug!(%entity, pushed = report.pushed, "push pass complete")
                }
                Ok(_) => {}
                Err(e) if e.is_retryable() => {
                    tracing::warn!(%entity, error = %e, "push pass failed, will retry")
                }
                Err(e) => tracing::error!(%entity, error = %e, "push pass failed"),
            }

            if let Err(e) = self.status.refresh().await {
                tracing::warn!(error = %e, "failed to refresh sync status");
            }
        }
        tracing::debug!(%entity, "push worker stopped");
    }
}

struct Sweeper {
    publisher: SignalPublisher,
    outbox: OutboxRepository,
    connectivity: Connectivity,
    interval: Duration,
    retention: Option<chrono::Duration>,
}

impl Sweeper {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        let mut online = self.connectivity.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
                changed = online.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if !*online.borrow_and_update() {
                        continue;
                    }
                    tracing::info!("back online, sweeping all entities");
                }
            }

            self.publisher.publish_all();

            if let Some(retention) = self.retention {
                match self.outbox.compact(Utc::now() - retention).await {
                    Ok(0) => {}
                    Ok(removed) => tracing::info!(removed, "compacted pushed outbox entries"),
                    Err(e) => tracing::warn!(error = %e, "outbox compaction failed"),
                }
            }
        }
        tracing::debug!("sweep task stopped");
    }
}
