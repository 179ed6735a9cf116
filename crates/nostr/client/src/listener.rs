//! Connection callbacks and the observer registry that fans them out.
//!
//! Callbacks run synchronously on the connection's read task, in wire order.
//! Implementations must not block; hand work off through a channel instead.

use crate::event::Event;
use crate::relay_url::RelayUrl;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Receives everything a relay connection observes. Every method has an empty
/// default so implementors only override what they care about.
#[allow(unused_variables)]
pub trait RelayListener: Send + Sync {
    fn on_connecting(&self, relay: &RelayUrl) {}

    fn on_connected(&self, relay: &RelayUrl) {}

    fn on_disconnected(&self, relay: &RelayUrl) {}

    /// A connect attempt failed, or a send was refused because the relay is
    /// offline and still inside its backoff window.
    fn on_cannot_connect(&self, relay: &RelayUrl, error: &str) {}

    /// `after_eose` is false for stored events and true for live ones.
    fn on_event(&self, relay: &RelayUrl, subscription_id: &str, event: &Event, after_eose: bool) {}

    fn on_eose(&self, relay: &RelayUrl, subscription_id: &str) {}

    fn on_closed(&self, relay: &RelayUrl, subscription_id: &str, message: &str) {}

    fn on_notice(&self, relay: &RelayUrl, message: &str) {}

    fn on_notify(&self, relay: &RelayUrl, message: &str) {}

    fn on_auth(&self, relay: &RelayUrl, challenge: &str) {}

    /// Fired once per connection, on the first accepted AUTH.
    fn on_authed(&self, relay: &RelayUrl) {}

    /// OK for an EVENT this client sent.
    fn on_send_response(&self, relay: &RelayUrl, event_id: &str, success: bool, message: &str) {}

    fn on_count(&self, relay: &RelayUrl, subscription_id: &str, count: u64) {}

    fn on_error(&self, relay: &RelayUrl, error: &str) {}
}

type Entries = Arc<Vec<(u64, Arc<dyn RelayListener>)>>;

#[derive(Default)]
struct RegistryInner {
    next_id: AtomicU64,
    entries: RwLock<Entries>,
}

impl RegistryInner {
    fn remove(&self, id: u64) {
        let mut entries = self.entries.write();
        if entries.iter().any(|(entry_id, _)| *entry_id == id) {
            let next: Vec<_> = entries
                .iter()
                .filter(|(entry_id, _)| *entry_id != id)
                .cloned()
                .collect();
            *entries = Arc::new(next);
        }
    }
}

/// Copy-on-write list of listeners.
///
/// Registration returns a [`ListenerHandle`]; dropping the handle removes the
/// listener. Dispatch iterates a snapshot, so a callback may register or drop
/// listeners without deadlocking.
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    inner: Arc<RegistryInner>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener. It stays registered until the handle is dropped.
    #[must_use = "the listener is removed when the handle is dropped"]
    pub fn register(&self, listener: Arc<dyn RelayListener>) -> ListenerHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.inner.entries.write();
        let mut next = Vec::with_capacity(entries.len() + 1);
        next.extend(entries.iter().cloned());
        next.push((id, listener));
        *entries = Arc::new(next);
        ListenerHandle {
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Entries {
        Arc::clone(&self.inner.entries.read())
    }

    fn each(&self, f: impl Fn(&dyn RelayListener)) {
        for (_, listener) in self.snapshot().iter() {
            f(listener.as_ref());
        }
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.len())
            .finish()
    }
}

/// Keeps a listener registered. Unregisters on drop.
#[derive(Debug)]
pub struct ListenerHandle {
    id: u64,
    registry: Weak<RegistryInner>,
}

impl ListenerHandle {
    /// Unregister now instead of at end of scope.
    pub fn unsubscribe(self) {}
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

impl RelayListener for ListenerRegistry {
    fn on_connecting(&self, relay: &RelayUrl) {
        self.each(|l| l.on_connecting(relay));
    }

    fn on_connected(&self, relay: &RelayUrl) {
        self.each(|l| l.on_connected(relay));
    }

    fn on_disconnected(&self, relay: &RelayUrl) {
        self.each(|l| l.on_disconnected(relay));
    }

    fn on_cannot_connect(&self, relay: &RelayUrl, error: &str) {
        self.each(|l| l.on_cannot_connect(relay, error));
    }

    fn on_event(&self, relay: &RelayUrl, subscription_id: &str, event: &Event, after_eose: bool) {
        self.each(|l| l.on_event(relay, subscription_id, event, after_eose));
    }

    fn on_eose(&self, relay: &RelayUrl, subscription_id: &str) {
        self.each(|l| l.on_eose(relay, subscription_id));
    }

    fn on_closed(&self, relay: &RelayUrl, subscription_id: &str, message: &str) {
        self.each(|l| l.on_closed(relay, subscription_id, message));
    }

    fn on_notice(&self, relay: &RelayUrl, message: &str) {
        self.each(|l| l.on_notice(relay, message));
    }

    fn on_notify(&self, relay: &RelayUrl, message: &str) {
        self.each(|l| l.on_notify(relay, message));
    }

    fn on_auth(&self, relay: &RelayUrl, challenge: &str) {
        self.each(|l| l.on_auth(relay, challenge));
    }

    fn on_authed(&self, relay: &RelayUrl) {
        self.each(|l| l.on_authed(relay));
    }

    fn on_send_response(&self, relay: &RelayUrl, event_id: &str, success: bool, message: &str) {
        self.each(|l| l.on_send_response(relay, event_id, success, message));
    }

    fn on_count(&self, relay: &RelayUrl, subscription_id: &str, count: u64) {
        self.each(|l| l.on_count(relay, subscription_id, count));
    }

    fn on_error(&self, relay: &RelayUrl, error: &str) {
        self.each(|l| l.on_error(relay, error));
    }
}

/// Listener that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl RelayListener for NoopListener {}
