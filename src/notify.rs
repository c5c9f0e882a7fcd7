use tokio::sync::broadcast;
use ulid::Ulid;

use crate::directory::CancellationNotifier;

const CHANNEL_CAPACITY: usize = 256;

/// Outbound notice for the delivery collaborator (mail, push, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    BookingsCancelled {
        session_id: Ulid,
        student_ids: Vec<Ulid>,
    },
}

/// Tenant-wide broadcast of cancellation notices.
pub struct NotifyHub {
    feed: broadcast::Sender<Notice>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            feed: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to every notice of the tenant.
    pub fn subscribe_all(&self) -> broadcast::Receiver<Notice> {
        self.feed.subscribe()
    }

    /// Send a notice. No-op if nobody is listening.
    pub fn send(&self, notice: Notice) {
        let _ = self.feed.send(notice);
    }
}

impl CancellationNotifier for NotifyHub {
    fn notify_cancelled_bookings(&self, session_id: Ulid, student_ids: &[Ulid]) {
        if student_ids.is_empty() {
            return;
        }
        self.send(Notice::BookingsCancelled {
            session_id,
            student_ids: student_ids.to_vec(),
        });
    }
}
