use std::sync::Arc;
use tokio::sync::{broadcast, Notify};

use crate::notify::Notification;

/// Wake `worker` for every notification published on `channel` until the hub closes.
///
/// Payloads are not inspected. A lagged receiver has missed signals, so it wakes the worker
/// as well; the worker always re-reads the whole queue.
pub async fn listen(
    mut rx: broadcast::Receiver<Notification>,
    channel: String,
    worker: Arc<Notify>,
) {
    tracing::info!("[listener] listening on '{}'", channel);
    loop {
        match rx.recv().await {
            Ok(notification) => {
                if notification.channel != channel {
                    continue;
                }
                tracing::trace!(
                    "[listener] notification from pid {}: {}",
                    notification.pid,
                    notification.payload
                );
                worker.notify_one();
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!("[listener] missed {} notifications", missed);
                worker.notify_one();
            }
            Err(broadcast::error::RecvError::Closed) => {
                tracing::info!("[listener] hub closed, stopping");
                break;
            }
        }
    }
}
