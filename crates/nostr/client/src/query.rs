//! Query-driven subscriptions.
//!
//! Many callers each describe what they want to see through a [`QueryState`].
//! A [`SubscriptionOrchestrator`] folds all of them into one REQ per relay and
//! re-sends it, debounced, whenever any of them changes. The first state opens
//! the subscription and removing the last one closes it.

use crate::message::Filter;
use crate::pool::RelayPool;
use crate::relay_url::RelayUrl;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Something that wants events matching a set of filters.
pub trait QueryState: Send + Sync {
    /// Current filters. May be empty.
    fn filters(&self) -> Vec<Filter>;

    /// Fires whenever [`filters`](Self::filters) may have changed.
    fn changes(&self) -> watch::Receiver<u64>;
}

/// A [`QueryState`] whose filters are set directly.
pub struct MutableQueryState {
    filters: RwLock<Vec<Filter>>,
    version: watch::Sender<u64>,
}

impl MutableQueryState {
    pub fn new(filters: Vec<Filter>) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            filters: RwLock::new(filters),
            version,
        }
    }

    /// Replace the filters and notify watchers.
    pub fn set_filters(&self, filters: Vec<Filter>) {
        *self.filters.write() = filters;
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }
}

impl std::fmt::Debug for MutableQueryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutableQueryState")
            .field("filters", &*self.filters.read())
            .field("version", &*self.version.borrow())
            .finish()
    }
}

impl QueryState for MutableQueryState {
    fn filters(&self) -> Vec<Filter> {
        self.filters.read().clone()
    }

    fn changes(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }
}

/// Union of every state's filters, duplicates removed, in key order.
pub fn coalesce_filters<'a>(states: impl IntoIterator<Item = &'a Arc<dyn QueryState>>) -> Vec<Filter> {
    let mut merged: Vec<Filter> = Vec::new();
    for state in states {
        for filter in state.filters() {
            if !merged.contains(&filter) {
                merged.push(filter);
            }
        }
    }
    merged
}

struct Entry {
    state: Arc<dyn QueryState>,
    task: Option<JoinHandle<()>>,
}

struct OrchestratorInner {
    pool: RelayPool,
    subscription_id: String,
    relays: Vec<RelayUrl>,
    debounce: Duration,
    states: Mutex<BTreeMap<String, Entry>>,
    /// Filters last sent, `None` while closed. Locked before `states`.
    sent: Mutex<Option<Vec<Filter>>>,
}

impl OrchestratorInner {
    /// Holds `sent` from compute through send, so concurrent refreshes apply
    /// in order and the last one sees the newest states.
    fn refresh(&self) {
        let mut sent = self.sent.lock();
        let filters = {
            let states = self.states.lock();
            coalesce_filters(states.values().map(|e| &e.state))
        };
        if filters.is_empty() {
            if sent.take().is_some() {
                debug!("Closing query subscription {}", self.subscription_id);
                self.pool.unsubscribe(&self.subscription_id);
            }
            return;
        }
        if sent.as_ref() == Some(&filters) {
            return;
        }
        debug!(
            "Query subscription {} now has {} filters",
            self.subscription_id,
            filters.len()
        );
        *sent = Some(filters.clone());
        self.pool
            .subscribe_to(&self.subscription_id, filters, &self.relays);
    }
}

impl Drop for OrchestratorInner {
    fn drop(&mut self) {
        for entry in self.states.get_mut().values_mut() {
            if let Some(task) = entry.task.take() {
                task.abort();
            }
        }
    }
}

/// Coalesces many [`QueryState`]s into one pool subscription.
#[derive(Clone)]
pub struct SubscriptionOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl std::fmt::Debug for SubscriptionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionOrchestrator")
            .field("subscription_id", &self.inner.subscription_id)
            .field("relays", &self.inner.relays)
            .field("states", &self.inner.states.lock().len())
            .finish()
    }
}

impl SubscriptionOrchestrator {
    pub fn new(
        pool: RelayPool,
        subscription_id: impl Into<String>,
        relays: Vec<RelayUrl>,
        debounce: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                pool,
                subscription_id: subscription_id.into(),
                relays,
                debounce,
                states: Mutex::new(BTreeMap::new()),
                sent: Mutex::new(None),
            }),
        }
    }

    pub fn subscription_id(&self) -> &str {
        &self.inner.subscription_id
    }

    pub fn len(&self) -> usize {
        self.inner.states.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.states.lock().is_empty()
    }

    /// Filters currently on the wire, `None` while closed.
    pub fn current_filters(&self) -> Option<Vec<Filter>> {
        self.inner.sent.lock().clone()
    }

    /// Register `state` under `key`, replacing and cancelling any previous
    /// state with the same key, and resubscribe.
    ///
    /// Change watching needs a Tokio runtime; without one the state is still
    /// included but only picked up on the next explicit refresh.
    pub fn add(&self, key: impl Into<String>, state: Arc<dyn QueryState>) {
        let key = key.into();
        let changes = state.changes();
        let previous = self.inner.states.lock().insert(
            key.clone(),
            Entry {
                state,
                task: None,
            },
        );
        if let Some(task) = previous.and_then(|e| e.task) {
            task.abort();
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let task = handle.spawn(watch_state(
                    Arc::downgrade(&self.inner),
                    changes,
                    self.inner.debounce,
                ));
                let mut states = self.inner.states.lock();
                match states.get_mut(&key) {
                    Some(entry) if entry.task.is_none() => entry.task = Some(task),
                    _ => task.abort(),
                }
            }
            Err(_) => warn!("No runtime, query state {} will not be watched", key),
        }

        self.inner.refresh();
    }

    /// Drop the state under `key`. Removing the last state closes the
    /// subscription. Returns false if `key` was unknown.
    pub fn remove(&self, key: &str) -> bool {
        let removed = self.inner.states.lock().remove(key);
        let Some(entry) = removed else {
            return false;
        };
        if let Some(task) = entry.task {
            task.abort();
        }
        self.inner.refresh();
        true
    }

    /// Remove every state and close the subscription.
    pub fn clear(&self) {
        let entries: Vec<Entry> = {
            let mut states = self.inner.states.lock();
            std::mem::take(&mut *states).into_values().collect()
        };
        for entry in entries {
            if let Some(task) = entry.task {
                task.abort();
            }
        }
        self.inner.refresh();
    }

    /// Recompute and resend the coalesced filters now.
    pub fn refresh(&self) {
        self.inner.refresh();
    }
}

async fn watch_state(inner: Weak<OrchestratorInner>, mut changes: watch::Receiver<u64>, debounce: Duration) {
    loop {
        if changes.changed().await.is_err() {
            return;
        }
        // Let a burst of changes settle
        let mut closed = false;
        loop {
            match tokio::time::timeout(debounce, changes.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => {
                    closed = true;
                    break;
                }
                Err(_) => break,
            }
        }
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.refresh();
        if closed {
            return;
        }
    }
}
