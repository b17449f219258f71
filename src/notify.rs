use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// A notification delivered to LISTEN subscribers: the subject channel plus
/// the applied event as a JSON payload.
#[derive(Debug, Clone)]
pub struct Notification {
    pub subject_id: Ulid,
    pub payload: String,
}

/// Broadcast hub for LISTEN/NOTIFY per subject.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Notification>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to notifications for a subject. Creates the channel if needed.
    pub fn subscribe(&self, subject_id: Ulid) -> broadcast::Receiver<Notification> {
        let sender = self
            .channels
            .entry(subject_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Publish an applied event. No-op if nobody is listening.
    pub fn send(&self, subject_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&subject_id)
            && let Ok(payload) = serde_json::to_string(event)
        {
            let _ = sender.send(Notification { subject_id, payload });
        }
    }

    /// Remove a channel (e.g. when the subject is deleted).
    pub fn remove(&self, subject_id: &Ulid) {
        self.channels.remove(subject_id);
    }
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}
