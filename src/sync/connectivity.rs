//! Online/offline awareness.
//!
//! Being offline only lets the dispatcher skip passes that would fail
//! anyway; correctness never depends on it.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::remote::RemoteApi;

#[derive(Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Returns true if the state changed.
    pub fn set(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });
        if changed {
            if online {
                tracing::info!("server reachable, device online");
            } else {
                tracing::warn!("server unreachable, device offline");
            }
        }
        changed
    }
}

/// Polls the server's health endpoint until shutdown.
pub fn spawn_probe<R>(
    remote: Arc<R>,
    connectivity: Connectivity,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    R: RemoteApi + ?Sized + 'static,
{
    tokio::spawn(async move {
        loop {
            let online = remote.health().await;
            connectivity.set(online);

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        tracing::debug!("connectivity probe stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::testing::ScriptedRemote;

    #[test]
    fn test_set_reports_transitions_only() {
        let connectivity = Connectivity::new(true);
        assert!(!connectivity.set(true));
        assert!(connectivity.set(false));
        assert!(!connectivity.is_online());
        assert!(connectivity.set(true));
    }

    #[tokio::test]
    async fn test_probe_tracks_remote_health() {
        let remote = Arc::new(ScriptedRemote::new());
        remote.set_online(false);
        let connectivity = Connectivity::new(true);
        let mut rx = connectivity.subscribe();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = spawn_probe(
            remote.clone(),
            connectivity.clone(),
            Duration::from_millis(10),
            shutdown_rx,
        );

        rx.changed().await.unwrap();
        assert!(!*rx.borrow_and_update());

        remote.set_online(true);
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
