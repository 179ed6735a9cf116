//! Single relay connection.
//!
//! One socket, one read task, one [`SubscriptionRegistry`]. Everything the
//! relay sends is decoded on the read task and handed to the
//! [`RelayListener`] in arrival order.
//!
//! State machine:
//!
//! ```text
//! Disconnected -> Connecting -> Ready -> Disconnecting -> Disconnected
//!                     |           |
//!                     +-----------+--> Disconnected   (socket failure)
//! ```
//!
//! Reconnects are demand driven: sending while disconnected starts a connect
//! only once the backoff window since the last failure has passed. The pool's
//! maintenance loop does the same for relays that still have wanted
//! subscriptions.

use crate::backoff::ReconnectBackoff;
use crate::config::RelayConfig;
use crate::error::{ClientError, Result};
use crate::event::Event;
use crate::listener::RelayListener;
use crate::message::{ClientMessage, Filter, RelayMessage};
use crate::relay_url::RelayUrl;
use crate::stats::{RelayStats, RelayStatsSnapshot};
use crate::subscription::{ReqPlan, ReqSubStatus, SubscriptionRegistry};
use crate::transport::{Connector, SocketEvent, is_local_close};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket
    Disconnected,
    /// Socket open in progress
    Connecting,
    /// Socket open, frames flow
    Ready,
    /// Local teardown in progress
    Disconnecting,
}

/// Signs NIP-42 AUTH events. Without a signer, AUTH challenges are reported
/// to the listener and otherwise ignored.
pub trait AuthSigner: Send + Sync {
    /// Build a signed kind 22242 event answering `challenge`, or `None` to
    /// decline.
    fn sign_auth(&self, relay: &RelayUrl, challenge: &str) -> Option<Event>;
}

const AUTH_REQUIRED: &str = "auth-required";

enum Replay {
    Event(String),
    Req(String),
}

#[derive(Default)]
struct AuthState {
    answered: HashSet<String>,
    pending: HashSet<String>,
    authed: bool,
    /// Recently sent EVENT frames by id, kept so an auth-required rejection
    /// can be resent after AUTH succeeds.
    sent: VecDeque<(String, String)>,
    replay: Vec<Replay>,
}

impl AuthState {
    fn reset(&mut self) {
        self.answered.clear();
        self.pending.clear();
        self.authed = false;
        self.sent.clear();
        self.replay.clear();
    }
}

struct Outgoing {
    event_id: Option<String>,
    frame: String,
}

struct Inner {
    url: RelayUrl,
    config: RelayConfig,
    connector: Arc<dyn Connector>,
    listener: Arc<dyn RelayListener>,
    signer: Option<Arc<dyn AuthSigner>>,
    state: RwLock<ConnectionState>,
    /// Single-flight guard for `connect`
    connecting: AtomicBool,
    /// Set by `connect`, cleared by `disconnect`
    auto_reconnect: AtomicBool,
    /// Bumped for every socket so a stale read task cannot tear down its
    /// successor
    generation: AtomicU64,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
    backoff: Mutex<ReconnectBackoff>,
    last_attempt: Mutex<Option<Instant>>,
    next_retry_at: Mutex<Option<Instant>>,
    registry: Mutex<SubscriptionRegistry>,
    after_eose: Mutex<HashMap<String, bool>>,
    offline: Mutex<VecDeque<Outgoing>>,
    auth: Mutex<AuthState>,
    stats: RelayStats,
}

/// Relay connection. Cheap to clone; clones share the socket.
#[derive(Clone)]
pub struct RelayConnection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RelayConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConnection")
            .field("url", &self.inner.url)
            .field("state", &self.state())
            .finish()
    }
}

/// Clears the single-flight flag on every exit path of `connect`.
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RelayConnection {
    /// Create a connection (does not connect yet)
    pub fn new(
        url: RelayUrl,
        config: RelayConfig,
        connector: Arc<dyn Connector>,
        listener: Arc<dyn RelayListener>,
        signer: Option<Arc<dyn AuthSigner>>,
    ) -> Self {
        let backoff = ReconnectBackoff::new(config.backoff_floor(), config.backoff_cap());
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(SubscriptionRegistry::new(url.clone())),
                url,
                config,
                connector,
                listener,
                signer,
                state: RwLock::new(ConnectionState::Disconnected),
                connecting: AtomicBool::new(false),
                auto_reconnect: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                outbound: Mutex::new(None),
                recv_task: Mutex::new(None),
                backoff: Mutex::new(backoff),
                last_attempt: Mutex::new(None),
                next_retry_at: Mutex::new(None),
                after_eose: Mutex::new(HashMap::new()),
                offline: Mutex::new(VecDeque::new()),
                auth: Mutex::new(AuthState::default()),
                stats: RelayStats::new(),
            }),
        }
    }

    pub fn url(&self) -> &RelayUrl {
        &self.inner.url
    }

    /// Get current connection state
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read()
    }

    /// Check if connected
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    pub fn is_authed(&self) -> bool {
        self.inner.auth.lock().authed
    }

    pub fn stats(&self) -> RelayStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Delay that will follow the next failed attempt.
    pub fn retry_delay(&self) -> Duration {
        self.inner.backoff.lock().peek()
    }

    /// Earliest time a demand-driven reconnect is allowed.
    pub fn next_retry_at(&self) -> Option<Instant> {
        *self.inner.next_retry_at.lock()
    }

    pub fn last_attempt(&self) -> Option<Instant> {
        *self.inner.last_attempt.lock()
    }

    pub fn subscription_status(&self, subscription_id: &str) -> Option<ReqSubStatus> {
        self.inner.registry.lock().status(subscription_id)
    }

    /// Subscription ids the registry still holds state for.
    pub fn subscription_count(&self) -> usize {
        self.inner.registry.lock().len()
    }

    pub fn subscription_filters(&self, subscription_id: &str) -> Option<Vec<Filter>> {
        self.inner
            .registry
            .lock()
            .filters(subscription_id)
            .map(<[Filter]>::to_vec)
    }

    /// Whether EOSE has been seen for `subscription_id` on the current socket.
    pub fn after_eose(&self, subscription_id: &str) -> bool {
        self.inner
            .after_eose
            .lock()
            .get(subscription_id)
            .copied()
            .unwrap_or(false)
    }

    /// Frames waiting for the socket to open.
    pub fn queued_messages(&self) -> usize {
        self.inner.offline.lock().len()
    }

    /// Whether the caller still has subscriptions on this relay.
    pub fn has_wanted_subscriptions(&self) -> bool {
        self.inner.registry.lock().has_wanted()
    }

    /// Open the socket.
    ///
    /// Returns immediately if another `connect` is already in flight or the
    /// socket is already up.
    pub async fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        if inner
            .connecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Connect to {} already in flight", inner.url);
            return Ok(());
        }
        let _guard = FlightGuard(&inner.connecting);

        if self.is_connected() {
            return Ok(());
        }

        inner.auto_reconnect.store(true, Ordering::Release);
        let generation = inner.generation.load(Ordering::Acquire);
        *inner.state.write() = ConnectionState::Connecting;
        *inner.last_attempt.lock() = Some(Instant::now());
        inner.stats.record_attempt();
        inner.listener.on_connecting(&inner.url);

        info!("Connecting to relay: {}", inner.url);
        let connect_start = Instant::now();

        let socket = match timeout(
            inner.config.connect_timeout(),
            inner.connector.connect(&inner.url),
        )
        .await
        {
            Ok(Ok(socket)) => socket,
            Ok(Err(e)) => {
                self.connect_failed(generation, &e.to_string());
                return Err(e);
            }
            Err(_) => {
                let e = ClientError::Timeout(format!(
                    "Connection timeout after {:?}",
                    inner.config.connect_timeout()
                ));
                self.connect_failed(generation, &e.to_string());
                return Err(e);
            }
        };

        if inner.generation.load(Ordering::Acquire) != generation {
            debug!("Connection to {} was cancelled while opening", inner.url);
            return Ok(());
        }

        let socket_generation = inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        inner.backoff.lock().reset();
        *inner.next_retry_at.lock() = None;
        inner.auth.lock().reset();
        inner.stats.record_success();

        let resubscribe = {
            let mut registry = inner.registry.lock();
            *inner.outbound.lock() = Some(socket.outbound);
            *inner.state.write() = ConnectionState::Ready;
            registry.to_resubscribe()
        };

        let conn = self.clone();
        let mut inbound = socket.inbound;
        let handle = tokio::spawn(async move {
            while let Some(event) = inbound.recv().await {
                match event {
                    SocketEvent::Text(text) => conn.handle_text(&text),
                    SocketEvent::Closed { code, reason } => {
                        conn.socket_ended(socket_generation, code, &reason, false);
                        return;
                    }
                    SocketEvent::Failure(error) => {
                        conn.socket_ended(socket_generation, 1006, &error, true);
                        return;
                    }
                }
            }
            conn.socket_ended(socket_generation, 1006, "socket closed", false);
        });
        if let Some(old) = inner.recv_task.lock().replace(handle) {
            old.abort();
        }

        info!(
            "Connected to relay: {} (took {:?})",
            inner.url,
            connect_start.elapsed()
        );
        inner.listener.on_connected(&inner.url);

        if !resubscribe.is_empty() {
            debug!(
                "Resubscribing {} subscriptions on {}",
                resubscribe.len(),
                inner.url
            );
            for (id, filters) in resubscribe {
                self.send_request(&id, filters);
            }
        }
        self.flush_offline();

        Ok(())
    }

    fn connect_failed(&self, generation: u64, error: &str) {
        let inner = &self.inner;
        if inner.generation.load(Ordering::Acquire) == generation {
            *inner.state.write() = ConnectionState::Disconnected;
        }
        inner.stats.record_failure(error);
        let delay = self.schedule_retry();
        warn!(
            "Failed to connect to {}: {} (next attempt in {:?})",
            inner.url, error, delay
        );
        inner.listener.on_cannot_connect(&inner.url, error);
    }

    /// Push the next allowed attempt out by the current backoff step.
    fn schedule_retry(&self) -> Duration {
        let delay = self.inner.backoff.lock().next_delay();
        *self.inner.next_retry_at.lock() = Instant::now().checked_add(delay);
        delay
    }

    /// Whether a demand-driven reconnect is allowed now.
    pub fn retry_due(&self) -> bool {
        self.next_retry_at()
            .is_none_or(|at| Instant::now() >= at)
    }

    /// Start a background connect if the backoff window allows it. Returns
    /// false when the relay is still backing off.
    pub fn connect_if_due(&self) -> bool {
        if self.is_connected() || self.inner.connecting.load(Ordering::Acquire) {
            return true;
        }
        if !self.retry_due() {
            debug!(
                "Not reconnecting to {} yet, backing off for {:?}",
                self.inner.url,
                self.retry_delay()
            );
            return false;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime to reconnect {} on", self.inner.url);
            return false;
        };
        let conn = self.clone();
        runtime.spawn(async move {
            let _ = conn.connect().await;
        });
        true
    }

    /// Reconnect a relay that dropped while subscriptions were still wanted.
    /// Relays closed through [`disconnect`](Self::disconnect) stay closed.
    pub fn reconnect_if_wanted(&self) -> bool {
        if self.state() != ConnectionState::Disconnected
            || !self.inner.auto_reconnect.load(Ordering::Acquire)
            || !self.has_wanted_subscriptions()
        {
            return false;
        }
        self.connect_if_due()
    }

    /// Close the socket. Idempotent.
    ///
    /// Subscription filters are kept so a later connect resubscribes, but
    /// EOSE flags and the backoff are reset.
    pub fn disconnect(&self) {
        let inner = &self.inner;
        inner.auto_reconnect.store(false, Ordering::Release);
        inner.generation.fetch_add(1, Ordering::AcqRel);

        let was_open = {
            let mut state = inner.state.write();
            let was_open = *state != ConnectionState::Disconnected;
            if was_open {
                *state = ConnectionState::Disconnecting;
            }
            was_open
        };
        if was_open {
            info!("Disconnecting from relay: {}", inner.url);
        }

        self.tear_down();
        inner.backoff.lock().reset();
        *inner.next_retry_at.lock() = None;

        if was_open {
            info!("Disconnected from relay: {}", inner.url);
            inner.listener.on_disconnected(&inner.url);
        }
    }

    fn tear_down(&self) {
        let inner = &self.inner;
        if let Some(handle) = inner.recv_task.lock().take() {
            handle.abort();
        }
        {
            let mut registry = inner.registry.lock();
            inner.outbound.lock().take();
            *inner.state.write() = ConnectionState::Disconnected;
            registry.disconnected_all();
        }
        inner.after_eose.lock().clear();
        inner.auth.lock().reset();
    }

    fn socket_ended(&self, generation: u64, code: u16, reason: &str, failure: bool) {
        let inner = &self.inner;
        if inner.generation.load(Ordering::Acquire) != generation {
            return;
        }
        let local = self.state() == ConnectionState::Disconnecting || is_local_close(reason);

        if local {
            debug!("Socket to {} closed locally ({} {})", inner.url, code, reason);
        } else if failure {
            warn!("WebSocket error from {}: {}", inner.url, reason);
            inner.stats.record_failure(reason);
        } else {
            info!("Relay {} closed connection ({} {})", inner.url, code, reason);
        }

        {
            // Not our socket anymore
            inner.generation.fetch_add(1, Ordering::AcqRel);
            inner.recv_task.lock().take();
        }
        self.tear_down();
        if !local {
            self.schedule_retry();
        }

        if failure && !local {
            inner.listener.on_error(&inner.url, reason);
        }
        inner.listener.on_disconnected(&inner.url);
    }

    fn write_frame(&self, frame: String) -> bool {
        let outbound = self.inner.outbound.lock();
        let Some(tx) = outbound.as_ref() else {
            return false;
        };
        let len = frame.len();
        debug!("-> {}: {}", self.inner.url, frame);
        if tx.send(frame).is_ok() {
            self.inner.stats.record_sent(len);
            true
        } else {
            false
        }
    }

    fn write_message(&self, message: &ClientMessage) -> bool {
        match message.to_json() {
            Ok(frame) => self.write_frame(frame),
            Err(e) => {
                warn!("Failed to encode message for {}: {}", self.inner.url, e);
                false
            }
        }
    }

    fn write_req(&self, registry: &mut SubscriptionRegistry, id: &str, filters: Vec<Filter>) {
        let message = ClientMessage::Req {
            subscription_id: id.to_string(),
            filters: filters.clone(),
        };
        let opened = registry.on_open_req(id, filters);
        debug_assert!(opened.is_ok(), "REQ {} reissued while pending", id);
        if opened.is_err() {
            return;
        }
        self.inner.after_eose.lock().insert(id.to_string(), false);
        self.write_message(&message);
    }

    fn write_close(&self, registry: &mut SubscriptionRegistry, id: &str) {
        let was_open = registry.status(id).is_some_and(ReqSubStatus::is_open);
        registry.on_close_req(id);
        self.inner.after_eose.lock().remove(id);
        if was_open {
            self.write_message(&ClientMessage::Close {
                subscription_id: id.to_string(),
            });
        }
    }

    /// Open or update a REQ.
    ///
    /// Offline, the filters are remembered and a reconnect is attempted if
    /// the backoff allows. Online, the registry decides whether to send now,
    /// replace a live REQ, or wait for the pending one to reach EOSE.
    pub fn send_request(&self, subscription_id: &str, filters: Vec<Filter>) {
        if filters.is_empty() {
            return;
        }
        let connected = {
            let mut registry = self.inner.registry.lock();
            if self.is_connected() {
                match registry.plan(subscription_id, &filters) {
                    ReqPlan::Send => self.write_req(&mut registry, subscription_id, filters),
                    ReqPlan::Replace => {
                        self.write_close(&mut registry, subscription_id);
                        self.write_req(&mut registry, subscription_id, filters);
                    }
                    ReqPlan::Unchanged | ReqPlan::Deferred => {}
                }
                true
            } else {
                registry.remember(subscription_id, filters);
                false
            }
        };
        if !connected && !self.connect_if_due() {
            self.inner
                .listener
                .on_cannot_connect(&self.inner.url, "relay offline, waiting to reconnect");
        }
    }

    /// Send a COUNT. Offline it is queued until the socket opens.
    pub fn send_count(&self, subscription_id: &str, filters: Vec<Filter>) {
        if filters.is_empty() {
            return;
        }
        let message = ClientMessage::Count {
            subscription_id: subscription_id.to_string(),
            filters,
        };
        let frame = match message.to_json() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to encode COUNT for {}: {}", self.inner.url, e);
                return;
            }
        };
        if !self.write_frame(frame.clone()) {
            self.enqueue_offline(Outgoing {
                event_id: None,
                frame,
            });
            self.connect_if_due();
        }
    }

    /// Stop a subscription and forget its filters.
    pub fn close_subscription(&self, subscription_id: &str) {
        let mut registry = self.inner.registry.lock();
        if self.is_connected() {
            self.write_close(&mut registry, subscription_id);
        } else {
            registry.connecting(subscription_id);
            self.inner.after_eose.lock().remove(subscription_id);
        }
    }

    /// Publish an event.
    ///
    /// Offline, the frame is queued and a reconnect is attempted; if the relay
    /// is still backing off the listener gets `on_cannot_connect` right away.
    pub fn send_event(&self, event: &Event) {
        let frame = match ClientMessage::Event(event.clone()).to_json() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to encode event for {}: {}", self.inner.url, e);
                return;
            }
        };
        if self.write_frame(frame.clone()) {
            self.remember_sent(&event.id, frame);
            return;
        }

        self.enqueue_offline(Outgoing {
            event_id: Some(event.id.clone()),
            frame,
        });
        if !self.connect_if_due() {
            self.inner
                .listener
                .on_cannot_connect(&self.inner.url, "relay offline, waiting to reconnect");
        }
    }

    fn enqueue_offline(&self, outgoing: Outgoing) {
        let max = self.inner.config.max_queued_messages;
        let mut offline = self.inner.offline.lock();
        if max == 0 {
            return;
        }
        while offline.len() >= max {
            offline.pop_front();
            warn!("Offline queue for {} full, dropping oldest", self.inner.url);
        }
        offline.push_back(outgoing);
    }

    fn flush_offline(&self) {
        let queued: Vec<Outgoing> = self.inner.offline.lock().drain(..).collect();
        if queued.is_empty() {
            return;
        }
        debug!("Flushing {} queued frames to {}", queued.len(), self.inner.url);
        for (i, outgoing) in queued.iter().enumerate() {
            if !self.write_frame(outgoing.frame.clone()) {
                let mut offline = self.inner.offline.lock();
                for rest in queued.into_iter().skip(i).rev() {
                    offline.push_front(rest);
                }
                return;
            }
            if let Some(id) = &outgoing.event_id {
                self.remember_sent(id, outgoing.frame.clone());
            }
        }
    }

    fn remember_sent(&self, event_id: &str, frame: String) {
        let max = self.inner.config.max_queued_messages.max(1);
        let mut auth = self.inner.auth.lock();
        while auth.sent.len() >= max {
            auth.sent.pop_front();
        }
        auth.sent.push_back((event_id.to_string(), frame));
    }

    fn handle_text(&self, text: &str) {
        let inner = &self.inner;
        inner.stats.record_received(text.len());
        let message = match RelayMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                inner.stats.record_malformed();
                warn!("Dropping malformed frame from {}: {}", inner.url, e);
                return;
            }
        };
        debug!("<- {}: {}", inner.url, text);

        match message {
            RelayMessage::Event {
                subscription_id,
                event,
            } => {
                inner.registry.lock().on_new_event(&subscription_id);
                let after_eose = self.after_eose(&subscription_id);
                inner
                    .listener
                    .on_event(&inner.url, &subscription_id, &event, after_eose);
            }
            RelayMessage::Eose { subscription_id } => {
                if let Some(seen) = inner.after_eose.lock().get_mut(&subscription_id) {
                    *seen = true;
                }
                {
                    let mut registry = inner.registry.lock();
                    if let Some(filters) = registry.on_eose(&subscription_id)
                        && self.is_connected()
                    {
                        debug!(
                            "Sending parked filters for {} on {}",
                            subscription_id, inner.url
                        );
                        self.write_close(&mut registry, &subscription_id);
                        self.write_req(&mut registry, &subscription_id, filters);
                    }
                }
                inner.listener.on_eose(&inner.url, &subscription_id);
            }
            RelayMessage::Closed {
                subscription_id,
                message,
            } => {
                inner.registry.lock().on_closed(&subscription_id);
                inner.after_eose.lock().remove(&subscription_id);
                inner.stats.record_rejection();
                if message.starts_with(AUTH_REQUIRED) && inner.signer.is_some() {
                    let mut auth = inner.auth.lock();
                    if !auth.authed {
                        debug!(
                            "REQ {} on {} needs auth, will resend",
                            subscription_id, inner.url
                        );
                        auth.replay.push(Replay::Req(subscription_id.clone()));
                    }
                }
                warn!(
                    "Subscription {} closed by {}: {}",
                    subscription_id, inner.url, message
                );
                inner
                    .listener
                    .on_closed(&inner.url, &subscription_id, &message);
            }
            RelayMessage::Notice { message } => {
                warn!("Notice from {}: {}", inner.url, message);
                inner.listener.on_notice(&inner.url, &message);
            }
            RelayMessage::Notify { message } => {
                info!("Notification from {}: {}", inner.url, message);
                inner.listener.on_notify(&inner.url, &message);
            }
            RelayMessage::Auth { challenge } => {
                inner.listener.on_auth(&inner.url, &challenge);
                self.answer_auth(&challenge);
            }
            RelayMessage::Count {
                subscription_id,
                count,
            } => {
                inner.after_eose.lock().remove(&subscription_id);
                inner
                    .listener
                    .on_count(&inner.url, &subscription_id, count);
            }
            RelayMessage::Ok {
                event_id,
                success,
                message,
            } => self.handle_ok(&event_id, success, &message),
        }
    }

    fn answer_auth(&self, challenge: &str) {
        let inner = &self.inner;
        let Some(signer) = inner.signer.as_ref() else {
            debug!("No signer to answer AUTH from {}", inner.url);
            return;
        };
        if !inner.auth.lock().answered.insert(challenge.to_string()) {
            debug!("Already answered AUTH challenge from {}", inner.url);
            return;
        }
        let Some(event) = signer.sign_auth(&inner.url, challenge) else {
            debug!("Signer declined AUTH for {}", inner.url);
            return;
        };
        info!("Authenticating to {}", inner.url);
        inner.auth.lock().pending.insert(event.id.clone());
        self.write_message(&ClientMessage::Auth(event));
    }

    fn handle_ok(&self, event_id: &str, success: bool, message: &str) {
        let inner = &self.inner;

        let auth_answer = {
            let mut auth = inner.auth.lock();
            if auth.pending.remove(event_id) {
                if success {
                    let first = !auth.authed;
                    auth.authed = true;
                    Some((first, std::mem::take(&mut auth.replay)))
                } else {
                    Some((false, Vec::new()))
                }
            } else {
                None
            }
        };

        if let Some((first, replay)) = auth_answer {
            if !success {
                warn!("AUTH rejected by {}: {}", inner.url, message);
                inner.stats.record_rejection();
                return;
            }
            info!("Authenticated to {}", inner.url);
            if first {
                inner.listener.on_authed(&inner.url);
            }
            self.replay(replay);
            return;
        }

        let sent_frame = {
            let mut auth = inner.auth.lock();
            let position = auth.sent.iter().position(|(id, _)| id == event_id);
            position
                .and_then(|i| auth.sent.remove(i))
                .map(|(_, frame)| frame)
        };

        if !success {
            inner.stats.record_rejection();
            if message.starts_with(AUTH_REQUIRED)
                && inner.signer.is_some()
                && let Some(frame) = sent_frame
            {
                let mut auth = inner.auth.lock();
                if !auth.authed {
                    debug!("Event {} on {} needs auth, will resend", event_id, inner.url);
                    auth.replay.push(Replay::Event(frame));
                    return;
                }
            }
            warn!("Event {} rejected by {}: {}", event_id, inner.url, message);
        }
        inner
            .listener
            .on_send_response(&inner.url, event_id, success, message);
    }

    fn replay(&self, replay: Vec<Replay>) {
        for item in replay {
            match item {
                Replay::Event(frame) => {
                    self.write_frame(frame);
                }
                Replay::Req(id) => {
                    let filters = self.subscription_filters(&id);
                    if let Some(filters) = filters {
                        self.send_request(&id, filters);
                    }
                }
            }
        }
    }
}
