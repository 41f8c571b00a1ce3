//! Notification multiplexer - per-topic listener registry.
//!
//! Each `subscribe` creates an independent registration, so any number of
//! listeners can share a topic. Dispatch runs listeners in registration order
//! and outside the registry lock; a failing or panicking listener is logged
//! and never affects its siblings.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::Value;

use crate::bridge::protocol::Notification;

/// Listener callback. Returning `Err` is logged, never propagated.
pub type Listener = dyn Fn(&Value) -> anyhow::Result<()> + Send + Sync;

/// Identifier of a single registration. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct Registration {
    id: ListenerId,
    topic: String,
    callback: Arc<Listener>,
}

/// Handle returned by [`NotificationMux::subscribe`].
///
/// Dropping the handle keeps the registration alive; call
/// [`Subscription::unsubscribe`] to remove it.
pub struct Subscription {
    id: ListenerId,
    topic: String,
    mux: Weak<NotificationMux>,
}

impl Subscription {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Remove this registration only. Returns false if it was already gone.
    pub fn unsubscribe(self) -> bool {
        match self.mux.upgrade() {
            Some(mux) => mux.unsubscribe(self.id),
            None => false,
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .finish()
    }
}

pub struct NotificationMux {
    registry: Mutex<Vec<Registration>>,
    next_id: AtomicU64,
}

impl NotificationMux {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        })
    }

    // Listeners never run under the lock, so poisoning can only come from a
    // panic inside Vec bookkeeping; the data is still consistent.
    fn registry(&self) -> MutexGuard<'_, Vec<Registration>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe<F>(self: &Arc<Self>, topic: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let topic = topic.into();
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.registry().push(Registration {
            id,
            topic: topic.clone(),
            callback: Arc::new(callback),
        });
        tracing::debug!(%topic, listener_id = %id, "Listener subscribed");

        Subscription {
            id,
            topic,
            mux: Arc::downgrade(self),
        }
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut registry = self.registry();
        match registry.iter().position(|r| r.id == id) {
            Some(index) => {
                let removed = registry.remove(index);
                tracing::debug!(topic = %removed.topic, listener_id = %id, "Listener unsubscribed");
                true
            }
            None => false,
        }
    }

    pub fn listener_count(&self, topic: &str) -> usize {
        self.registry().iter().filter(|r| r.topic == topic).count()
    }

    /// Deliver `notification` to every listener on its topic.
    ///
    /// Returns the number of listeners that were invoked.
    pub fn dispatch(&self, notification: &Notification) -> usize {
        let listeners: Vec<(ListenerId, Arc<Listener>)> = self
            .registry()
            .iter()
            .filter(|r| r.topic == notification.topic)
            .map(|r| (r.id, Arc::clone(&r.callback)))
            .collect();

        if listeners.is_empty() {
            tracing::trace!(topic = %notification.topic, "No listeners for notification");
            return 0;
        }

        for (id, callback) in &listeners {
            match catch_unwind(AssertUnwindSafe(|| callback(&notification.data))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(
                        topic = %notification.topic,
                        listener_id = %id,
                        error = %e,
                        "Notification listener failed"
                    );
                }
                Err(_) => {
                    tracing::error!(
                        topic = %notification.topic,
                        listener_id = %id,
                        "Notification listener panicked"
                    );
                }
            }
        }
        listeners.len()
    }
}
