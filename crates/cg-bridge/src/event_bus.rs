use std::sync::{Arc, Mutex, MutexGuard};

use cg_session::executor::TaskEvent;

/// A task event tagged with the session it belongs to.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub session_id: String,
    pub event: TaskEvent,
}

/// A broadcast-style event bus built on top of flume channels.
///
/// Each call to [`EventBus::subscribe`] creates a receiver that gets every
/// event published after it subscribed. Clones share the same subscribers.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<Vec<flume::Sender<SessionEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn senders(&self) -> MutexGuard<'_, Vec<flume::Sender<SessionEvent>>> {
        self.inner.lock().unwrap_or_else(|e| {
            tracing::warn!("event bus lock was poisoned, recovering");
            e.into_inner()
        })
    }

    pub fn subscribe(&self) -> flume::Receiver<SessionEvent> {
        let (tx, rx) = flume::unbounded();
        self.senders().push(tx);
        rx
    }

    /// Publish to all current subscribers, pruning the ones that went away.
    pub fn publish(&self, event: SessionEvent) {
        self.senders().retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Relay everything sent on the returned sender to the bus, tagged with
    /// `session_id`. The relay ends when the sender is dropped.
    pub fn session_sink(&self, session_id: &str) -> flume::Sender<TaskEvent> {
        let (tx, rx) = flume::unbounded::<TaskEvent>();
        let bus = self.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv_async().await {
                bus.publish(SessionEvent {
                    session_id: session_id.clone(),
                    event,
                });
            }
        });
        tx
    }

    pub fn subscriber_count(&self) -> usize {
        self.senders().len()
    }
}
