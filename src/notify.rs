use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for LISTEN/NOTIFY, keyed by instructor. Floating
/// sessions (no instructor) publish under the nil key.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to one instructor's events. Creates the channel lazily.
    pub fn subscribe(&self, instructor_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(instructor_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Publish an event. No-op when nobody is listening.
    pub fn send(&self, instructor_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&instructor_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop a channel once its instructor is removed.
    pub fn remove(&self, instructor_id: &Ulid) {
        self.channels.remove(instructor_id);
    }
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}
