//! Publish one event to a set of relays and track each relay's answer.
//!
//! A [`BroadcastEvent`] is an immutable snapshot: every new per-relay result
//! produces a new value through [`BroadcastEvent::with_result`], and the
//! aggregate [`BroadcastStatus`] is recomputed from the result map each time.

use crate::event::Event;
use crate::listener::RelayListener;
use crate::pool::RelayPool;
use crate::relay_url::RelayUrl;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};
use uuid::Uuid;

/// One relay's answer to a broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayResult {
    /// Relay answered OK true
    Success,
    /// Relay refused, or the socket failed before it answered
    Error {
        /// Uppercase prefix of the OK message, e.g. `BLOCKED`
        code: String,
        /// Rest of the message
        message: String,
    },
    /// No answer before the deadline
    Timeout,
    /// Sent, waiting for an answer
    Pending,
    /// A retry is in flight for this relay
    Retrying,
}

impl RelayResult {
    /// Success, Error and Timeout are final for a tracking id.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RelayResult::Success | RelayResult::Error { .. } | RelayResult::Timeout
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RelayResult::Success)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, RelayResult::Error { .. } | RelayResult::Timeout)
    }

    /// Error result from an OK message, see [`parse_ok_message`].
    pub fn from_ok_message(message: &str) -> Self {
        let (code, message) = parse_ok_message(message);
        RelayResult::Error { code, message }
    }
}

/// Aggregate state of a broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BroadcastStatus {
    /// Some relay has not answered
    InProgress,
    /// Every relay accepted
    Success,
    /// Some relays accepted
    Partial,
    /// No relay accepted
    Failed,
}

/// Split a relay's OK message into an uppercase code and a reason.
///
/// `"blocked: pubkey not allowed"` gives `("BLOCKED", "pubkey not allowed")`.
/// A message without a colon gets the code `ERROR`.
pub fn parse_ok_message(message: &str) -> (String, String) {
    match message.split_once(':') {
        Some((code, reason)) if !code.trim().is_empty() => {
            (code.trim().to_uppercase(), reason.trim().to_string())
        }
        Some((_, reason)) => ("ERROR".to_string(), reason.trim().to_string()),
        None => ("ERROR".to_string(), message.trim().to_string()),
    }
}

/// Status as a pure function of targets and results.
///
/// Only terminal results for target relays count. With no targets at all the
/// broadcast can never succeed, so it is `Failed`.
pub fn compute_status(targets: &[RelayUrl], results: &HashMap<RelayUrl, RelayResult>) -> BroadcastStatus {
    if targets.is_empty() {
        return BroadcastStatus::Failed;
    }
    let terminal: Vec<&RelayResult> = targets
        .iter()
        .filter_map(|relay| results.get(relay))
        .filter(|result| result.is_terminal())
        .collect();
    if terminal.len() < targets.len() {
        return BroadcastStatus::InProgress;
    }
    let successes = terminal.iter().filter(|r| r.is_success()).count();
    if successes == terminal.len() {
        BroadcastStatus::Success
    } else if successes == 0 {
        BroadcastStatus::Failed
    } else {
        BroadcastStatus::Partial
    }
}

/// One broadcast: an event, its target relays and what each relay said.
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastEvent {
    /// Tracking id
    pub id: String,
    /// Human readable name, e.g. for a retry
    pub label: String,
    /// The event being published
    pub event: Event,
    /// Target relays in request order, no duplicates
    pub targets: Vec<RelayUrl>,
    /// Unix seconds
    pub started_at: u64,
    /// Latest answer per target relay
    pub results: HashMap<RelayUrl, RelayResult>,
    /// Derived from `results`, see [`compute_status`]
    pub status: BroadcastStatus,
}

impl BroadcastEvent {
    /// All targets start `Pending`.
    pub fn new(id: impl Into<String>, label: impl Into<String>, event: Event, relays: &[RelayUrl]) -> Self {
        let mut targets: Vec<RelayUrl> = Vec::with_capacity(relays.len());
        for relay in relays {
            if !targets.contains(relay) {
                targets.push(relay.clone());
            }
        }
        let results: HashMap<RelayUrl, RelayResult> = targets
            .iter()
            .map(|relay| (relay.clone(), RelayResult::Pending))
            .collect();
        let status = compute_status(&targets, &results);
        Self {
            id: id.into(),
            label: label.into(),
            event,
            targets,
            started_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            results,
            status,
        }
    }

    /// Copy with `result` recorded for `relay`.
    ///
    /// Unchanged if `relay` is not a target or already has a terminal result:
    /// the first answer wins.
    pub fn with_result(&self, relay: &RelayUrl, result: RelayResult) -> Self {
        if !self.targets.contains(relay) {
            return self.clone();
        }
        if self.results.get(relay).is_some_and(RelayResult::is_terminal) {
            return self.clone();
        }
        let mut next = self.clone();
        next.results.insert(relay.clone(), result);
        next.status = compute_status(&next.targets, &next.results);
        next
    }

    /// Copy with every given failed relay marked `Retrying`.
    pub fn with_retrying(&self, relays: &[RelayUrl]) -> Self {
        let mut next = self.clone();
        for relay in relays {
            if next.results.get(relay).is_some_and(RelayResult::is_failure) {
                next.results.insert(relay.clone(), RelayResult::Retrying);
            }
        }
        next.status = compute_status(&next.targets, &next.results);
        next
    }

    /// Fold the outcome of a retry back in: relays that failed here take the
    /// retry's terminal result.
    pub fn merged_with(&self, retry: &BroadcastEvent) -> Self {
        let mut next = self.clone();
        for (relay, result) in &retry.results {
            let replace = next
                .results
                .get(relay)
                .is_some_and(|r| !r.is_success());
            if replace && result.is_terminal() {
                next.results.insert(relay.clone(), result.clone());
            }
        }
        next.status = compute_status(&next.targets, &next.results);
        next
    }

    /// Recompute the status from the result map.
    pub fn compute_status(&self) -> BroadcastStatus {
        compute_status(&self.targets, &self.results)
    }

    pub fn result(&self, relay: &RelayUrl) -> Option<&RelayResult> {
        self.results.get(relay)
    }

    pub fn is_complete(&self) -> bool {
        self.status != BroadcastStatus::InProgress
    }

    pub fn success_count(&self) -> usize {
        self.results.values().filter(|r| r.is_success()).count()
    }

    pub fn failure_count(&self) -> usize {
        self.results.values().filter(|r| r.is_failure()).count()
    }

    pub fn pending_count(&self) -> usize {
        self.results.values().filter(|r| !r.is_terminal()).count()
    }

    /// Relays that answered with an error or timed out, in target order.
    pub fn failed_relays(&self) -> Vec<RelayUrl> {
        self.targets
            .iter()
            .filter(|relay| self.results.get(*relay).is_some_and(RelayResult::is_failure))
            .cloned()
            .collect()
    }

    pub fn successful_relays(&self) -> Vec<RelayUrl> {
        self.targets
            .iter()
            .filter(|relay| self.results.get(*relay).is_some_and(RelayResult::is_success))
            .cloned()
            .collect()
    }
}

/// Outcome of [`BroadcastTracker::track`].
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastResult {
    /// Final snapshot
    pub broadcast: BroadcastEvent,
    /// True if at least one relay accepted the event
    pub is_success: bool,
}

impl BroadcastResult {
    fn from_broadcast(broadcast: BroadcastEvent) -> Self {
        let is_success = broadcast.success_count() > 0;
        Self {
            broadcast,
            is_success,
        }
    }
}

/// Listener attached for the duration of one `track` call.
struct TrackListener {
    event_id: String,
    relays: HashSet<RelayUrl>,
    tx: mpsc::UnboundedSender<(RelayUrl, RelayResult)>,
}

impl TrackListener {
    fn report(&self, relay: &RelayUrl, result: RelayResult) {
        if !self.relays.contains(relay) {
            return;
        }
        if self.tx.send((relay.clone(), result)).is_err() {
            debug!("Broadcast for {} already finished, ignoring {}", self.event_id, relay);
        }
    }
}

impl RelayListener for TrackListener {
    fn on_send_response(&self, relay: &RelayUrl, event_id: &str, success: bool, message: &str) {
        if event_id != self.event_id {
            return;
        }
        let result = if success {
            RelayResult::Success
        } else {
            RelayResult::from_ok_message(message)
        };
        self.report(relay, result);
    }

    fn on_cannot_connect(&self, relay: &RelayUrl, error: &str) {
        self.report(
            relay,
            RelayResult::Error {
                code: "CONNECTION".to_string(),
                message: error.to_string(),
            },
        );
    }

    fn on_disconnected(&self, relay: &RelayUrl) {
        self.report(
            relay,
            RelayResult::Error {
                code: "DISCONNECTED".to_string(),
                message: "relay disconnected".to_string(),
            },
        );
    }
}

struct TrackerInner {
    pool: RelayPool,
    default_timeout_secs: u64,
    active: RwLock<Arc<Vec<BroadcastEvent>>>,
    completed_tx: broadcast::Sender<BroadcastEvent>,
    /// Event id -> relays with a retry in flight
    retrying: Mutex<HashMap<String, HashSet<RelayUrl>>>,
}

impl TrackerInner {
    fn push_active(&self, broadcast: BroadcastEvent) {
        let mut active = self.active.write();
        let mut next: Vec<BroadcastEvent> = active
            .iter()
            .filter(|b| b.id != broadcast.id)
            .cloned()
            .collect();
        next.push(broadcast);
        *active = Arc::new(next);
    }

    fn replace_active(&self, broadcast: &BroadcastEvent) {
        let mut active = self.active.write();
        let next: Vec<BroadcastEvent> = active
            .iter()
            .map(|b| {
                if b.id == broadcast.id {
                    broadcast.clone()
                } else {
                    b.clone()
                }
            })
            .collect();
        *active = Arc::new(next);
    }

    fn remove_active(&self, id: &str) {
        let mut active = self.active.write();
        if active.iter().any(|b| b.id == id) {
            let next: Vec<BroadcastEvent> = active.iter().filter(|b| b.id != id).cloned().collect();
            *active = Arc::new(next);
        }
    }

    fn release_retrying(&self, event_id: &str, relays: &[RelayUrl]) {
        let mut retrying = self.retrying.lock();
        if let Some(in_flight) = retrying.get_mut(event_id) {
            for relay in relays {
                in_flight.remove(relay);
            }
            if in_flight.is_empty() {
                retrying.remove(event_id);
            }
        }
    }
}

/// Drops an entry from the active list, and releases the relays a retry
/// claimed, when the owning future finishes or is dropped.
struct ActiveGuard {
    inner: Arc<TrackerInner>,
    id: String,
    /// Event id and the relays claimed in `retrying`
    claimed: Option<(String, Vec<RelayUrl>)>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.inner.remove_active(&self.id);
        if let Some((event_id, relays)) = self.claimed.take() {
            self.inner.release_retrying(&event_id, &relays);
        }
    }
}

/// Publishes events through a [`RelayPool`] and tracks acknowledgements.
///
/// Any number of `track` calls may run at once; each owns its own tracking id
/// and listener.
#[derive(Clone)]
pub struct BroadcastTracker {
    inner: Arc<TrackerInner>,
}

impl std::fmt::Debug for BroadcastTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastTracker")
            .field("active", &self.inner.active.read().len())
            .finish()
    }
}

impl BroadcastTracker {
    /// Tracker using the pool's broadcast settings.
    pub fn new(pool: RelayPool) -> Self {
        let config = pool.config().broadcast.clone();
        let (completed_tx, _) = broadcast::channel(config.completed_channel_capacity.max(1));
        Self {
            inner: Arc::new(TrackerInner {
                pool,
                default_timeout_secs: config.timeout_secs,
                active: RwLock::new(Arc::new(Vec::new())),
                completed_tx,
                retrying: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Broadcasts still collecting results.
    pub fn active(&self) -> Arc<Vec<BroadcastEvent>> {
        Arc::clone(&self.inner.active.read())
    }

    /// Finished broadcasts, in completion order.
    pub fn completed(&self) -> broadcast::Receiver<BroadcastEvent> {
        self.inner.completed_tx.subscribe()
    }

    /// Publish `event` to `relays` and wait up to `timeout_secs` for every
    /// relay to answer. Relays still silent at the deadline are marked
    /// `Timeout`.
    pub async fn track(&self, event: &Event, relays: &[RelayUrl], timeout_secs: u64) -> BroadcastResult {
        let id = Uuid::new_v4().to_string();
        let label = format!("Event {}", short_id(&event.id));
        self.run(id, label, event, relays, timeout_secs).await
    }

    /// [`track`](Self::track) with the configured timeout.
    pub async fn track_default(&self, event: &Event, relays: &[RelayUrl]) -> BroadcastResult {
        self.track(event, relays, self.inner.default_timeout_secs)
            .await
    }

    /// Track the event again on the relays that failed in `original`, or only
    /// on `specific_relay` if given.
    ///
    /// Relays that already succeeded or have a retry in flight are skipped. If
    /// nothing is left, `original` is returned unchanged and nothing is sent.
    pub async fn retry(
        &self,
        original: &BroadcastEvent,
        event: &Event,
        specific_relay: Option<&RelayUrl>,
    ) -> BroadcastResult {
        let requested: Vec<RelayUrl> = match specific_relay {
            Some(relay) => vec![relay.clone()],
            None => original.failed_relays(),
        };

        let candidates: Vec<RelayUrl> = {
            let mut retrying = self.inner.retrying.lock();
            let in_flight = retrying.entry(event.id.clone()).or_default();
            let candidates: Vec<RelayUrl> = requested
                .into_iter()
                .filter(|relay| original.targets.contains(relay))
                .filter(|relay| !original.result(relay).is_some_and(RelayResult::is_success))
                .filter(|relay| !in_flight.contains(relay))
                .collect();
            in_flight.extend(candidates.iter().cloned());
            if in_flight.is_empty() {
                retrying.remove(&event.id);
            }
            candidates
        };

        if candidates.is_empty() {
            debug!("Nothing to retry for broadcast {}", original.id);
            return BroadcastResult::from_broadcast(original.clone());
        }

        info!(
            "Retrying broadcast {} on {} relays",
            original.id,
            candidates.len()
        );
        let guard = ActiveGuard {
            inner: Arc::clone(&self.inner),
            id: original.id.clone(),
            claimed: Some((event.id.clone(), candidates.clone())),
        };
        self.inner.push_active(original.with_retrying(&candidates));

        let id = format!("{}-retry-{}", original.id, short_id(&Uuid::new_v4().to_string()));
        let label = format!("Retry: {}", original.label);
        let result = self
            .run(id, label, event, &candidates, self.inner.default_timeout_secs)
            .await;
        drop(guard);
        result
    }

    async fn run(
        &self,
        id: String,
        label: String,
        event: &Event,
        relays: &[RelayUrl],
        timeout_secs: u64,
    ) -> BroadcastResult {
        let mut broadcast = BroadcastEvent::new(id, label, event.clone(), relays);
        if broadcast.targets.is_empty() {
            debug!("Broadcast {} has no target relays", broadcast.id);
            let _ = self.inner.completed_tx.send(broadcast.clone());
            return BroadcastResult::from_broadcast(broadcast);
        }

        self.inner.push_active(broadcast.clone());
        let guard = ActiveGuard {
            inner: Arc::clone(&self.inner),
            id: broadcast.id.clone(),
            claimed: None,
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = self.inner.pool.register_listener(Arc::new(TrackListener {
            event_id: event.id.clone(),
            relays: broadcast.targets.iter().cloned().collect(),
            tx,
        }));

        // Listener is attached before anything goes out.
        self.inner.pool.send_event(event, &broadcast.targets);

        let collect = async {
            while let Some((relay, result)) = rx.recv().await {
                let next = broadcast.with_result(&relay, result);
                if next != broadcast {
                    broadcast = next;
                    self.inner.replace_active(&broadcast);
                }
                if broadcast.is_complete() {
                    break;
                }
            }
        };
        let timed_out = tokio::time::timeout(Duration::from_secs(timeout_secs), collect)
            .await
            .is_err();
        drop(handle);

        if timed_out {
            let silent: Vec<RelayUrl> = broadcast
                .targets
                .iter()
                .filter(|relay| !broadcast.results.get(*relay).is_some_and(RelayResult::is_terminal))
                .cloned()
                .collect();
            debug!(
                "Broadcast {} timed out waiting for {} relays",
                broadcast.id,
                silent.len()
            );
            for relay in &silent {
                broadcast = broadcast.with_result(relay, RelayResult::Timeout);
            }
        }

        drop(guard);
        info!(
            "Broadcast {} finished {:?}: {} ok, {} failed",
            broadcast.id,
            broadcast.status,
            broadcast.success_count(),
            broadcast.failure_count()
        );
        let _ = self.inner.completed_tx.send(broadcast.clone());
        BroadcastResult::from_broadcast(broadcast)
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
