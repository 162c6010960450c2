//! Outbound side of the live voice channel.

use converse_types::LiveEvent;
use tokio::sync::mpsc;

/// Destination for events on one live connection. Pushing never blocks.
pub trait LiveSink: Send + Sync {
    fn push(&self, event: LiveEvent);
}

impl LiveSink for mpsc::Sender<LiveEvent> {
    fn push(&self, event: LiveEvent) {
        if let Err(e) = self.try_send(event) {
            tracing::warn!("dropping live event for slow or closed consumer: {}", e);
        }
    }
}
