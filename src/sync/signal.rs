//! Per-entity sync signals.
//!
//! Each pushable remote entity gets one bounded channel of capacity one.
//! A signal that finds the slot occupied is dropped: the queued signal
//! already guarantees another pass, so bursts collapse into a single rerun.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::models::RemoteEntity;

/// "Something changed for this entity."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSignal {
    pub entity: RemoteEntity,
}

/// Cloneable sending side handed to the store and the sweep timer.
#[derive(Debug, Clone)]
pub struct SignalPublisher {
    senders: Arc<HashMap<RemoteEntity, mpsc::Sender<SyncSignal>>>,
}

/// Outcome of a publish, mainly for tests and trace logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Published {
    Queued,
    Coalesced,
    NoListener,
}

impl SignalPublisher {
    pub fn publish(&self, entity: RemoteEntity) -> Published {
        let Some(sender) = self.senders.get(&entity) else {
            return Published::NoListener;
        };
        match sender.try_send(SyncSignal { entity }) {
            Ok(()) => Published::Queued,
            Err(TrySendError::Full(_)) => Published::Coalesced,
            Err(TrySendError::Closed(_)) => {
                tracing::trace!(%entity, "signal receiver closed");
                Published::NoListener
            }
        }
    }

    /// Signals every pushable entity.
    pub fn publish_all(&self) {
        for entity in RemoteEntity::pushable() {
            self.publish(entity);
        }
    }
}

/// Creates one channel per pushable entity.
pub fn signal_channels() -> (SignalPublisher, HashMap<RemoteEntity, mpsc::Receiver<SyncSignal>>) {
    let mut senders = HashMap::new();
    let mut receivers = HashMap::new();
    for entity in RemoteEntity::pushable() {
        let (tx, rx) = mpsc::channel(1);
        senders.insert(entity, tx);
        receivers.insert(entity, rx);
    }
    (
        SignalPublisher {
            senders: Arc::new(senders),
        },
        receivers,
    )
}
