//! In-process publish/subscribe for "documents changed" signals.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub const DEFAULT_NOTIFICATION_CHANNEL: &str = "document_events";

const HUB_CAPACITY: usize = 1024;

/// One published change signal. The payload is advisory; consumers re-read the event queue
/// instead of trusting it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub pid: u32,
    pub channel: String,
    pub payload: String,
}

#[derive(Debug, Clone)]
pub struct NotificationHub {
    tx: broadcast::Sender<Notification>,
}

impl Default for NotificationHub {
    fn default() -> Self {
        NotificationHub::new()
    }
}

impl NotificationHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(HUB_CAPACITY);
        NotificationHub { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Returns the number of subscribers reached. Publishing with no subscribers is not an
    /// error.
    pub fn publish(&self, channel: &str, payload: impl Into<String>) -> usize {
        let notification = Notification {
            pid: std::process::id(),
            channel: channel.to_string(),
            payload: payload.into(),
        };
        match self.tx.send(notification) {
            Ok(reached) => reached,
            Err(_) => {
                tracing::trace!("[NotificationHub] no subscribers on '{}'", channel);
                0
            }
        }
    }
}
