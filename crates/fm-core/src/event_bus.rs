use std::sync::{Arc, Mutex};

use crate::events::{Event, EventKind};

/// Fan-out bus for lifecycle events, built on flume channels.
///
/// Every [`subscribe`](EventBus::subscribe) call returns a receiver that sees
/// all events published after it was created. Subscribers whose receiver has
/// been dropped are pruned on the next publish. Cloning is cheap.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<Vec<flume::Sender<Event>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> flume::Receiver<Event> {
        let (tx, rx) = flume::unbounded();
        self.senders().push(tx);
        rx
    }

    /// Stamp `kind` with the current time and deliver it to every subscriber.
    pub fn emit(&self, kind: EventKind) {
        self.publish(Event::now(kind));
    }

    pub fn publish(&self, event: Event) {
        tracing::debug!(event = event.name(), "lifecycle event");
        self.senders().retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.senders().len()
    }

    fn senders(&self) -> std::sync::MutexGuard<'_, Vec<flume::Sender<Event>>> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("event bus lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}
