use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::BookingNotice;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for booking notices, one channel per resource id.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<BookingNotice>>,
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

    /// Subscribe to notices for a staff member or subject. Creates the channel if needed.
    pub fn subscribe(&self, resource_id: Ulid) -> broadcast::Receiver<BookingNotice> {
        let sender = self
            .channels
            .entry(resource_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send on one resource's channel. No-op if nobody is listening.
    pub fn send(&self, resource_id: Ulid, notice: &BookingNotice) {
        if let Some(sender) = self.channels.get(&resource_id) {
            let _ = sender.send(notice.clone());
        }
    }

    /// Send on the staff member's and the subject's channels.
    pub fn publish(&self, notice: &BookingNotice) {
        self.send(notice.staff_id, notice);
        self.send(notice.subject_id, notice);
    }
}
