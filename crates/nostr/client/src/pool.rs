//! Relay pool for managing connections to multiple Nostr relays.
//!
//! The pool owns one [`RelayConnection`] per relay and is the single listener
//! of all of them. Everything a connection reports is
//!
//! - fanned out unchanged to listeners added with
//!   [`RelayPool::register_listener`],
//! - fed to the shared [`HintIndexer`] (events only),
//! - republished as a [`PoolEvent`] on a broadcast channel, with events
//!   deduplicated across relays.

use crate::config::EngineConfig;
use crate::connection::{AuthSigner, ConnectionState, RelayConnection};
use crate::dedup::SeenWindow;
use crate::error::Result;
use crate::event::Event;
use crate::hints::HintIndexer;
use crate::listener::{ListenerHandle, ListenerRegistry, RelayListener};
use crate::message::Filter;
use crate::relay_url::RelayUrl;
use crate::subscription::{SubscriptionTracker, generate_subscription_id};
use crate::transport::{Connector, WebSocketConnector};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

/// Events emitted by the relay pool.
#[derive(Debug, Clone, PartialEq)]
pub enum PoolEvent {
    /// A relay connected
    Connected { relay_url: RelayUrl },
    /// A relay disconnected
    Disconnected { relay_url: RelayUrl },
    /// A connect attempt failed or the relay is backing off
    CannotConnect { relay_url: RelayUrl, error: String },
    /// First copy of an event seen by the pool
    Event {
        relay_url: RelayUrl,
        subscription_id: String,
        event: Event,
        after_eose: bool,
    },
    /// EOSE received for a subscription on a relay
    Eose {
        relay_url: RelayUrl,
        subscription_id: String,
    },
    /// All relays have sent EOSE for a subscription
    AllEose { subscription_id: String },
    /// OK response for a published event
    Ok {
        relay_url: RelayUrl,
        event_id: String,
        success: bool,
        message: String,
    },
    /// Notice from a relay
    Notice { relay_url: RelayUrl, message: String },
    /// Subscription closed by a relay
    Closed {
        relay_url: RelayUrl,
        subscription_id: String,
        message: String,
    },
    /// AUTH challenge from a relay
    Auth { relay_url: RelayUrl, challenge: String },
    /// First accepted AUTH on a connection
    Authed { relay_url: RelayUrl },
    /// COUNT result
    Count {
        relay_url: RelayUrl,
        subscription_id: String,
        count: u64,
    },
    /// Connection error
    Error { relay_url: RelayUrl, error: String },
}

/// State shared between the pool and its connections.
struct PoolShared {
    listeners: ListenerRegistry,
    events_tx: broadcast::Sender<PoolEvent>,
    subscriptions: RwLock<HashMap<String, SubscriptionTracker>>,
    seen: Mutex<SeenWindow<String>>,
    evicted: Arc<AtomicU64>,
    hints: Arc<HintIndexer>,
}

impl PoolShared {
    fn emit(&self, event: PoolEvent) {
        // No receivers is fine
        let _ = self.events_tx.send(event);
    }

    fn index(&self, relay: &RelayUrl, event: &Event) {
        self.hints.add_event(&event.id, relay);
        self.hints.add_key(&event.pubkey, relay);
        if let Some(address) = event.address() {
            self.hints.add_address(address, relay);
        }
    }
}

impl RelayListener for PoolShared {
    fn on_connecting(&self, relay: &RelayUrl) {
        self.listeners.on_connecting(relay);
    }

    fn on_connected(&self, relay: &RelayUrl) {
        self.listeners.on_connected(relay);
        self.emit(PoolEvent::Connected {
            relay_url: relay.clone(),
        });
    }

    fn on_disconnected(&self, relay: &RelayUrl) {
        self.listeners.on_disconnected(relay);
        self.emit(PoolEvent::Disconnected {
            relay_url: relay.clone(),
        });
    }

    fn on_cannot_connect(&self, relay: &RelayUrl, error: &str) {
        self.listeners.on_cannot_connect(relay, error);
        self.emit(PoolEvent::CannotConnect {
            relay_url: relay.clone(),
            error: error.to_string(),
        });
    }

    fn on_event(&self, relay: &RelayUrl, subscription_id: &str, event: &Event, after_eose: bool) {
        self.index(relay, event);
        self.listeners
            .on_event(relay, subscription_id, event, after_eose);
        if self.seen.lock().insert(event.id.clone()) {
            self.emit(PoolEvent::Event {
                relay_url: relay.clone(),
                subscription_id: subscription_id.to_string(),
                event: event.clone(),
                after_eose,
            });
        } else {
            trace!("Duplicate event {} from {}", event.id, relay);
        }
    }

    fn on_eose(&self, relay: &RelayUrl, subscription_id: &str) {
        self.listeners.on_eose(relay, subscription_id);
        let all_eose = self
            .subscriptions
            .write()
            .get_mut(subscription_id)
            .is_some_and(|tracker| tracker.mark_eose(relay));

        self.emit(PoolEvent::Eose {
            relay_url: relay.clone(),
            subscription_id: subscription_id.to_string(),
        });
        if all_eose {
            debug!("All relays sent EOSE for {}", subscription_id);
            self.emit(PoolEvent::AllEose {
                subscription_id: subscription_id.to_string(),
            });
        }
    }

    fn on_closed(&self, relay: &RelayUrl, subscription_id: &str, message: &str) {
        self.listeners.on_closed(relay, subscription_id, message);
        self.emit(PoolEvent::Closed {
            relay_url: relay.clone(),
            subscription_id: subscription_id.to_string(),
            message: message.to_string(),
        });
    }

    fn on_notice(&self, relay: &RelayUrl, message: &str) {
        self.listeners.on_notice(relay, message);
        self.emit(PoolEvent::Notice {
            relay_url: relay.clone(),
            message: message.to_string(),
        });
    }

    fn on_notify(&self, relay: &RelayUrl, message: &str) {
        self.listeners.on_notify(relay, message);
    }

    fn on_auth(&self, relay: &RelayUrl, challenge: &str) {
        self.listeners.on_auth(relay, challenge);
        self.emit(PoolEvent::Auth {
            relay_url: relay.clone(),
            challenge: challenge.to_string(),
        });
    }

    fn on_authed(&self, relay: &RelayUrl) {
        self.listeners.on_authed(relay);
        self.emit(PoolEvent::Authed {
            relay_url: relay.clone(),
        });
    }

    fn on_send_response(&self, relay: &RelayUrl, event_id: &str, success: bool, message: &str) {
        self.listeners
            .on_send_response(relay, event_id, success, message);
        self.emit(PoolEvent::Ok {
            relay_url: relay.clone(),
            event_id: event_id.to_string(),
            success,
            message: message.to_string(),
        });
    }

    fn on_count(&self, relay: &RelayUrl, subscription_id: &str, count: u64) {
        self.listeners.on_count(relay, subscription_id, count);
        self.emit(PoolEvent::Count {
            relay_url: relay.clone(),
            subscription_id: subscription_id.to_string(),
            count,
        });
    }

    fn on_error(&self, relay: &RelayUrl, error: &str) {
        self.listeners.on_error(relay, error);
        self.emit(PoolEvent::Error {
            relay_url: relay.clone(),
            error: error.to_string(),
        });
    }
}

struct PoolInner {
    config: EngineConfig,
    connector: Arc<dyn Connector>,
    signer: Option<Arc<dyn AuthSigner>>,
    connections: RwLock<HashMap<RelayUrl, RelayConnection>>,
    shared: Arc<PoolShared>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        if let Some(handle) = self.maintenance.get_mut().take() {
            handle.abort();
        }
    }
}

/// A pool of Nostr relay connections. Cheap to clone.
#[derive(Clone)]
pub struct RelayPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for RelayPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayPool")
            .field("relays", &self.relay_urls())
            .finish()
    }
}

impl Default for RelayPool {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl RelayPool {
    /// Create a pool that talks WebSocket.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_connector(config, Arc::new(WebSocketConnector), None)
    }

    /// Create a pool over any [`Connector`], optionally answering AUTH
    /// challenges with `signer`.
    pub fn with_connector(
        config: EngineConfig,
        connector: Arc<dyn Connector>,
        signer: Option<Arc<dyn AuthSigner>>,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(config.pool.event_channel_capacity.max(1));
        let evicted = Arc::new(AtomicU64::new(0));
        let evicted_hook = Arc::clone(&evicted);
        let seen = SeenWindow::new(config.pool.dedup_window).with_eviction_hook(move |id| {
            trace!("Event {} left the dedup window", id);
            evicted_hook.fetch_add(1, Ordering::Relaxed);
        });
        let shared = Arc::new(PoolShared {
            listeners: ListenerRegistry::new(),
            events_tx,
            subscriptions: RwLock::new(HashMap::new()),
            seen: Mutex::new(seen),
            evicted,
            hints: Arc::new(HintIndexer::new(config.hints.clone())),
        });
        Self {
            inner: Arc::new(PoolInner {
                config,
                connector,
                signer,
                connections: RwLock::new(HashMap::new()),
                shared,
                maintenance: Mutex::new(None),
            }),
        }
    }

    /// Subscribe to pool events.
    pub fn events(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.shared.events_tx.subscribe()
    }

    /// Receive raw connection callbacks from every relay until the handle is
    /// dropped.
    #[must_use = "the listener is removed when the handle is dropped"]
    pub fn register_listener(&self, listener: Arc<dyn RelayListener>) -> ListenerHandle {
        self.inner.shared.listeners.register(listener)
    }

    /// Relay hints learned from inbound events.
    pub fn hints(&self) -> Arc<HintIndexer> {
        Arc::clone(&self.inner.shared.hints)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Number of event ids that have aged out of the dedup window.
    pub fn dedup_evictions(&self) -> u64 {
        self.inner.shared.evicted.load(Ordering::Relaxed)
    }

    /// Get all relay URLs in the pool, sorted.
    pub fn relay_urls(&self) -> Vec<RelayUrl> {
        let mut urls: Vec<RelayUrl> = self.inner.connections.read().keys().cloned().collect();
        urls.sort();
        urls
    }

    /// Get connection states for all relays.
    pub fn states(&self) -> HashMap<RelayUrl, ConnectionState> {
        self.inner
            .connections
            .read()
            .iter()
            .map(|(url, conn)| (url.clone(), conn.state()))
            .collect()
    }

    /// Check if a relay is connected.
    pub fn is_connected(&self, url: &RelayUrl) -> bool {
        self.relay(url).is_some_and(|conn| conn.is_connected())
    }

    /// Get the number of connected relays.
    pub fn connected_count(&self) -> usize {
        self.inner
            .connections
            .read()
            .values()
            .filter(|conn| conn.is_connected())
            .count()
    }

    /// Connection for `url`, if in the pool.
    pub fn relay(&self, url: &RelayUrl) -> Option<RelayConnection> {
        self.inner.connections.read().get(url).cloned()
    }

    /// Add a relay to the pool. Does not connect.
    pub fn add_relay(&self, url: &str) -> Result<RelayUrl> {
        let url = RelayUrl::parse(url)?;
        self.ensure_relay(&url);
        Ok(url)
    }

    /// Connection for `url`, created on first use.
    pub fn ensure_relay(&self, url: &RelayUrl) -> RelayConnection {
        if let Some(conn) = self.relay(url) {
            return conn;
        }
        let mut conns = self.inner.connections.write();
        conns
            .entry(url.clone())
            .or_insert_with(|| {
                info!("Adding relay to pool: {}", url);
                RelayConnection::new(
                    url.clone(),
                    self.inner.config.relay.clone(),
                    Arc::clone(&self.inner.connector),
                    Arc::clone(&self.inner.shared) as Arc<dyn RelayListener>,
                    self.inner.signer.clone(),
                )
            })
            .clone()
    }

    /// Remove a relay from the pool and close its socket.
    pub fn remove_relay(&self, url: &RelayUrl) {
        let conn = self.inner.connections.write().remove(url);
        let Some(conn) = conn else {
            return;
        };
        info!("Removing relay from pool: {}", url);
        conn.disconnect();

        let completed: Vec<String> = {
            let mut subs = self.inner.shared.subscriptions.write();
            subs.values_mut()
                .filter_map(|tracker| {
                    tracker
                        .remove_relay(url)
                        .then(|| tracker.id().to_string())
                })
                .collect()
        };
        for subscription_id in completed {
            self.inner
                .shared
                .emit(PoolEvent::AllEose { subscription_id });
        }
    }

    /// Connect to a specific relay, adding it if needed.
    pub async fn connect_relay(&self, url: &RelayUrl) -> Result<()> {
        debug!("Connecting to relay: {}", url);
        self.ensure_relay(url).connect().await
    }

    /// Connect to all relays in the pool concurrently.
    pub async fn connect_all(&self) -> Vec<(RelayUrl, Result<()>)> {
        let conns: Vec<RelayConnection> = self.inner.connections.read().values().cloned().collect();
        let results = join_all(conns.iter().map(|conn| conn.connect())).await;
        conns
            .into_iter()
            .map(|conn| conn.url().clone())
            .zip(results)
            .collect()
    }

    /// Add the configured default relays and connect to everything.
    pub async fn connect_default(&self) -> Vec<(RelayUrl, Result<()>)> {
        for url in &self.inner.config.pool.default_relays {
            if let Err(e) = self.add_relay(url) {
                warn!("Skipping default relay {}: {}", url, e);
            }
        }
        self.connect_all().await
    }

    /// Disconnect from all relays.
    pub fn disconnect_all(&self) {
        let conns: Vec<RelayConnection> = self.inner.connections.read().values().cloned().collect();
        for conn in conns {
            conn.disconnect();
        }
    }

    /// Open `subscription_id` with `filters` on `relays`, adding relays as
    /// needed. Reusing an id replaces its filters.
    pub fn subscribe_to(&self, subscription_id: &str, filters: Vec<Filter>, relays: &[RelayUrl]) {
        info!(
            "Subscription {} with {} filters on {} relays",
            subscription_id,
            filters.len(),
            relays.len()
        );
        {
            let mut subs = self.inner.shared.subscriptions.write();
            let tracker = subs
                .entry(subscription_id.to_string())
                .or_insert_with(|| SubscriptionTracker::new(subscription_id, filters.clone()));
            tracker.set_filters(filters.clone());
            for relay in relays {
                tracker.add_relay(relay.clone());
            }
        }
        for relay in relays {
            self.ensure_relay(relay)
                .send_request(subscription_id, filters.clone());
        }
    }

    /// Subscribe with a specific subscription ID on every relay in the pool.
    pub fn subscribe_with_id(&self, subscription_id: &str, filters: Vec<Filter>) {
        let relays = self.relay_urls();
        self.subscribe_to(subscription_id, filters, &relays);
    }

    /// Subscribe on every relay in the pool under a fresh id.
    pub fn subscribe_all(&self, filters: Vec<Filter>) -> String {
        let subscription_id = generate_subscription_id();
        self.subscribe_with_id(&subscription_id, filters);
        subscription_id
    }

    /// Close a subscription on every relay.
    pub fn unsubscribe(&self, subscription_id: &str) {
        info!("Closing subscription {}", subscription_id);
        self.inner
            .shared
            .subscriptions
            .write()
            .remove(subscription_id);
        let conns: Vec<RelayConnection> = self.inner.connections.read().values().cloned().collect();
        for conn in conns {
            conn.close_subscription(subscription_id);
        }
    }

    /// Get active subscription IDs.
    pub fn subscription_ids(&self) -> Vec<String> {
        self.inner
            .shared
            .subscriptions
            .read()
            .keys()
            .cloned()
            .collect()
    }

    /// Whether every relay of a subscription has sent EOSE.
    pub fn all_eose(&self, subscription_id: &str) -> bool {
        self.inner
            .shared
            .subscriptions
            .read()
            .get(subscription_id)
            .is_some_and(SubscriptionTracker::is_complete)
    }

    /// Send a COUNT to `relays`.
    pub fn count(&self, subscription_id: &str, filters: Vec<Filter>, relays: &[RelayUrl]) {
        for relay in relays {
            self.ensure_relay(relay)
                .send_count(subscription_id, filters.clone());
        }
    }

    /// Send an event to `relays`, adding them as needed.
    pub fn send_event(&self, event: &Event, relays: &[RelayUrl]) {
        debug!("Sending event {} to {} relays", event.id, relays.len());
        for relay in relays {
            self.ensure_relay(relay).send_event(event);
        }
    }

    /// Send an event to every relay in the pool.
    pub fn publish(&self, event: &Event) {
        let relays = self.relay_urls();
        self.send_event(event, &relays);
    }

    /// One-shot query: REQ on `relays`, collect until every relay has sent
    /// EOSE (or dropped out) or `wait` elapses, then CLOSE.
    ///
    /// Returns each event once, newest first.
    pub async fn fetch(&self, filters: Vec<Filter>, relays: &[RelayUrl], wait: Duration) -> Vec<Event> {
        if relays.is_empty() || filters.is_empty() {
            return Vec::new();
        }
        let subscription_id = generate_subscription_id();
        let targets: HashSet<RelayUrl> = relays.iter().cloned().collect();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = self.register_listener(Arc::new(FetchListener {
            subscription_id: subscription_id.clone(),
            relays: targets.clone(),
            tx,
        }));

        self.subscribe_to(&subscription_id, filters, relays);

        let mut events: HashMap<String, Event> = HashMap::new();
        let mut done: HashSet<RelayUrl> = HashSet::new();
        let collect = async {
            while let Some(signal) = rx.recv().await {
                match signal {
                    FetchSignal::Event(event) => {
                        events.entry(event.id.clone()).or_insert(event);
                    }
                    FetchSignal::Done(relay) => {
                        done.insert(relay);
                        if done.len() >= targets.len() {
                            break;
                        }
                    }
                }
            }
        };
        if tokio::time::timeout(wait, collect).await.is_err() {
            debug!("Fetch {} timed out after {:?}", subscription_id, wait);
        }
        self.unsubscribe(&subscription_id);

        let mut events: Vec<Event> = events.into_values().collect();
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        events
    }

    /// Periodically reconnect relays that dropped while subscriptions were
    /// still wanted. Replaces a running maintenance task.
    pub fn start_maintenance(&self) {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.pool.maintenance_interval();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let conns: Vec<RelayConnection> = inner.connections.read().values().cloned().collect();
                drop(inner);
                for conn in conns {
                    if conn.reconnect_if_wanted() {
                        debug!("Maintenance reconnecting {}", conn.url());
                    }
                }
            }
        });
        if let Some(old) = self.inner.maintenance.lock().replace(handle) {
            old.abort();
        }
    }

    /// Stop maintenance, close every socket and forget all relays and
    /// subscriptions.
    pub fn shutdown(&self) {
        info!("Shutting down relay pool");
        if let Some(handle) = self.inner.maintenance.lock().take() {
            handle.abort();
        }
        self.disconnect_all();
        self.inner.connections.write().clear();
        self.inner.shared.subscriptions.write().clear();
        self.inner.shared.seen.lock().clear();
    }
}

enum FetchSignal {
    Event(Event),
    Done(RelayUrl),
}

struct FetchListener {
    subscription_id: String,
    relays: HashSet<RelayUrl>,
    tx: mpsc::UnboundedSender<FetchSignal>,
}

impl FetchListener {
    fn done(&self, relay: &RelayUrl) {
        if self.relays.contains(relay) {
            let _ = self.tx.send(FetchSignal::Done(relay.clone()));
        }
    }
}

impl RelayListener for FetchListener {
    fn on_event(&self, relay: &RelayUrl, subscription_id: &str, event: &Event, _after_eose: bool) {
        if subscription_id == self.subscription_id && self.relays.contains(relay) {
            let _ = self.tx.send(FetchSignal::Event(event.clone()));
        }
    }

    fn on_eose(&self, relay: &RelayUrl, subscription_id: &str) {
        if subscription_id == self.subscription_id {
            self.done(relay);
        }
    }

    fn on_closed(&self, relay: &RelayUrl, subscription_id: &str, _message: &str) {
        if subscription_id == self.subscription_id {
            self.done(relay);
        }
    }

    fn on_cannot_connect(&self, relay: &RelayUrl, _error: &str) {
        self.done(relay);
    }

    fn on_disconnected(&self, relay: &RelayUrl) {
        self.done(relay);
    }
}
