use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::events::{EventGateway, OccupationEvent, PublishError};

const CHANNEL_CAPACITY: usize = 256;

/// In-process broadcast hub, one channel per name. Serves as the event
/// gateway when no external fan-out service is wired in.
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<OccupationEvent>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a channel. Creates the channel if needed.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<OccupationEvent> {
        let sender = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }
}

impl EventGateway for NotifyHub {
    /// No-op without listeners. A channel whose last listener went away is
    /// dropped here.
    fn publish(&self, channel: &str, event: &OccupationEvent) -> Result<(), PublishError> {
        if self
            .channels
            .remove_if(channel, |_, sender| sender.receiver_count() == 0)
            .is_some()
        {
            return Ok(());
        }
        if let Some(sender) = self.channels.get(channel) {
            // Ignore error: the last listener may drop between the check and the send.
            let _ = sender.send(event.clone());
        }
        Ok(())
    }
}
