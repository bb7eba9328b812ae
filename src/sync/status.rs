//! Observable sync state for the UI.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

use crate::db::OutboxRepository;
use crate::error::StoreError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    /// Number of push passes currently running.
    pub in_progress: usize,
    pub pending: u64,
    pub quarantined: u64,
    pub online: bool,
}

impl SyncStatus {
    pub fn is_syncing(&self) -> bool {
        self.in_progress > 0
    }
}

#[derive(Clone)]
pub struct StatusReporter {
    tx: Arc<watch::Sender<SyncStatus>>,
    outbox: OutboxRepository,
}

impl StatusReporter {
    pub fn new(outbox: OutboxRepository) -> Self {
        let (tx, _) = watch::channel(SyncStatus::default());
        Self {
            tx: Arc::new(tx),
            outbox,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> SyncStatus {
        *self.tx.borrow()
    }

    pub fn pass_started(&self) {
        self.tx.send_modify(|s| s.in_progress += 1);
    }

    pub fn pass_finished(&self) {
        self.tx
            .send_modify(|s| s.in_progress = s.in_progress.saturating_sub(1));
    }

    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|s| {
            let changed = s.online != online;
            s.online = online;
            changed
        });
    }

    /// Reloads outbox counts.
    pub async fn refresh(&self) -> Result<SyncStatus, StoreError> {
        let counts = self.outbox.counts().await?;
        self.tx.send_if_modified(|s| {
            let changed = s.pending != counts.pending || s.quarantined != counts.quarantined;
            s.pending = counts.pending;
            s.quarantined = counts.quarantined;
            changed
        });
        Ok(self.current())
    }
}
