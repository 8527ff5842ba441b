//! The priority mailbox backing `Reload`/`Exit`/`Respawn` (spec.md §4.5's
//! "Multiple pending events collapse in priority order").
//!
//! Grounded on the teacher's `ActivityTracker::monitor_activity` shape (a
//! lone controller task driven by a channel plus a `CancellationToken`,
//! `_teacher_ref/server/activitytracker/tracker.rs`), adapted to a
//! depth-1 priority slot instead of a `UnboundedReceiver<EventType>` since a
//! plain channel cannot express "a lower-priority pending event is
//! superseded, not queued".

use std::sync::Mutex;

use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Event {
    Reload,
    Respawn,
    ExitGraceful,
    ExitUngraceful,
}

/// A single pending-event slot. Posting a lower-or-equal priority event while
/// one is already pending is a no-op; posting a higher one replaces it.
pub(crate) struct Mailbox {
    pending: Mutex<Option<Event>>,
    notify: Notify,
}

impl Mailbox {
    pub(crate) fn new() -> Self {
        Self {
            pending: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    pub(crate) fn post(&self, event: Event) {
        let mut pending = self.pending.lock().unwrap();
        let should_replace = match *pending {
            Some(existing) => event > existing,
            None => true,
        };
        if should_replace {
            *pending = Some(event);
            drop(pending);
            self.notify.notify_one();
        }
    }

    /// Waits for and takes the next pending event, clearing the slot.
    pub(crate) async fn recv(&self) -> Event {
        loop {
            if let Some(event) = self.pending.lock().unwrap().take() {
                return event;
            }
            self.notify.notified().await;
        }
    }
}
