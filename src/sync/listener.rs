//! WebSocket client for server notifications.

use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::idempotency::{IdempotencyTracker, NotificationOutcome, ServerNotification};
use super::pull::PullReconciler;
use super::remote::RemoteApi;
use crate::error::SyncError;

/// Applies one text frame. Reload requests are pulled before the
/// notification is recorded, so a failed pull is retried on redelivery.
pub async fn process_frame<R: RemoteApi + ?Sized>(
    text: &str,
    tracker: &IdempotencyTracker,
    reconciler: &PullReconciler<R>,
) -> Result<NotificationOutcome, SyncError> {
    let notification = ServerNotification::from_json(text)
        .map_err(|e| SyncError::Protocol(format!("bad notification frame: {}", e)))?;

    let outcome = tracker.handle(&notification).await?;
    if let NotificationOutcome::ReloadRequested(entity) = outcome {
        let report = reconciler.pull(entity).await?;
        tracker
            .complete_reload(&notification.request_id, entity)
            .await?;
        tracing::info!(%entity, applied = report.applied, deferred = report.deferred, "reload complete");
    }
    Ok(outcome)
}

pub struct NotificationListener<R: RemoteApi + ?Sized> {
    pub url: String,
    pub tracker: IdempotencyTracker,
    pub reconciler: PullReconciler<R>,
    pub reconnect_delay: Duration,
}

impl<R: RemoteApi + ?Sized + 'static> NotificationListener<R> {
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.session(&mut shutdown).await {
                Ok(()) => tracing::info!("notification stream closed"),
                Err(e) => tracing::warn!(error = %e, "notification stream failed"),
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }
        tracing::debug!("notification listener stopped");
    }

    async fn session(&self, shutdown: &mut watch::Receiver<bool>) -> Result<(), SyncError> {
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| SyncError::transport(e.to_string()))?;
        tracing::info!(url = %self.url, "notification stream connected");

        let (mut sender, mut receiver) = ws_stream.split();

        loop {
            let frame = tokio::select! {
                _ = shutdown.changed() => {
                    let _ = sender.send(Message::Close(None)).await;
                    return Ok(());
                }
                frame = receiver.next() => frame,
            };

            match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = process_frame(text.as_str(), &self.tracker, &self.reconciler).await {
                        tracing::warn!(error = %e, "failed to apply notification");
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    sender
                        .send(Message::Pong(data))
                        .await
                        .map_err(|e| SyncError::transport(e.to_string()))?;
                }
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(SyncError::transport(e.to_string())),
            }
        }
    }
}
