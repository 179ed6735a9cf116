//! Subscription state for Nostr relay connections.
//!
//! [`SubscriptionRegistry`] is the per-connection REQ state table. A relay may
//! answer one subscription id with several EOSEs in a row, and nothing on the
//! wire says which REQ an EOSE belongs to. The registry therefore refuses to
//! open a REQ for an id whose previous REQ is still open; new filters for a
//! pending id are parked and sent once the relay reaches EOSE.
//!
//! [`SubscriptionTracker`] tracks one logical subscription across the relays
//! of a pool, for the pool-wide "all relays sent EOSE" signal.

use crate::error::{ClientError, Result};
use crate::message::Filter;
use crate::relay_url::RelayUrl;
use std::collections::{HashMap, HashSet};
use tracing::{debug, error};
use uuid::Uuid;

/// Fresh random subscription id, 16 hex characters.
pub fn generate_subscription_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

/// Wire state of one REQ on one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReqSubStatus {
    /// REQ written, nothing back yet
    Sent,
    /// At least one stored event received, no EOSE yet
    QueryingPast,
    /// EOSE received, now streaming new events
    Live,
    /// CLOSED received; filters are kept for a resend
    Closed,
}

impl ReqSubStatus {
    /// Whether a relay response may still refer to the current REQ.
    pub fn is_open(self) -> bool {
        !matches!(self, ReqSubStatus::Closed)
    }
}

/// What a connection should do with a requested filter set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReqPlan {
    /// Write a REQ now.
    Send,
    /// The relay is live on these exact filters; CLOSE first, then REQ.
    Replace,
    /// Same filters are already open; nothing to write.
    Unchanged,
    /// Previous REQ has not reached EOSE; filters parked until it does.
    Deferred,
}

#[derive(Debug, Clone, Default)]
struct SubState {
    status: Option<ReqSubStatus>,
    filters: Option<Vec<Filter>>,
    queued: Option<Vec<Filter>>,
}

/// Per-connection REQ state table keyed by subscription id.
#[derive(Debug)]
pub struct SubscriptionRegistry {
    relay_url: RelayUrl,
    subs: HashMap<String, SubState>,
}

impl SubscriptionRegistry {
    pub fn new(relay_url: RelayUrl) -> Self {
        Self {
            relay_url,
            subs: HashMap::new(),
        }
    }

    /// Current status, `None` when never sent or cleared by a reconnect.
    pub fn status(&self, id: &str) -> Option<ReqSubStatus> {
        self.subs.get(id).and_then(|s| s.status)
    }

    /// Filters last sent for `id`, kept across disconnects.
    pub fn filters(&self, id: &str) -> Option<&[Filter]> {
        self.subs.get(id).and_then(|s| s.filters.as_deref())
    }

    /// Filters parked behind a pending REQ.
    pub fn queued(&self, id: &str) -> Option<&[Filter]> {
        self.subs.get(id).and_then(|s| s.queued.as_deref())
    }

    /// Decide how to issue `filters` for `id` without breaking the one open
    /// REQ per id rule. Parks the filters when the answer is
    /// [`ReqPlan::Deferred`].
    pub fn plan(&mut self, id: &str, filters: &[Filter]) -> ReqPlan {
        let Some(state) = self.subs.get_mut(id) else {
            return ReqPlan::Send;
        };
        let same = state.filters.as_deref() == Some(filters);
        match state.status {
            None | Some(ReqSubStatus::Closed) => ReqPlan::Send,
            Some(ReqSubStatus::Live) if same => ReqPlan::Unchanged,
            Some(ReqSubStatus::Live) => ReqPlan::Replace,
            Some(ReqSubStatus::Sent | ReqSubStatus::QueryingPast) => {
                if same {
                    state.queued = None;
                    ReqPlan::Unchanged
                } else {
                    debug!(
                        "Deferring REQ {} on {} until EOSE",
                        id, self.relay_url
                    );
                    state.queued = Some(filters.to_vec());
                    ReqPlan::Deferred
                }
            }
        }
    }

    /// Store filters to send once the socket is up. Only valid while no REQ
    /// is on the wire.
    pub fn remember(&mut self, id: &str, filters: Vec<Filter>) {
        let state = self.subs.entry(id.to_string()).or_default();
        state.status = None;
        state.filters = Some(filters);
        state.queued = None;
    }

    /// A REQ for `id` is being written. Fails if the previous REQ for the
    /// same id has not been closed.
    pub fn on_open_req(&mut self, id: &str, filters: Vec<Filter>) -> Result<()> {
        let state = self.subs.entry(id.to_string()).or_default();
        if let Some(status) = state.status
            && status.is_open()
        {
            error!(
                "REQ {} reissued on {} while {:?}",
                id, self.relay_url, status
            );
            return Err(ClientError::ReqStillPending {
                relay_url: self.relay_url.to_string(),
                subscription_id: id.to_string(),
            });
        }
        debug!("REQ {} on {}: Sent", id, self.relay_url);
        state.status = Some(ReqSubStatus::Sent);
        state.filters = Some(filters);
        state.queued = None;
        Ok(())
    }

    /// An EVENT arrived for `id`.
    pub fn on_new_event(&mut self, id: &str) {
        if let Some(state) = self.subs.get_mut(id)
            && state.status == Some(ReqSubStatus::Sent)
        {
            state.status = Some(ReqSubStatus::QueryingPast);
        }
    }

    /// EOSE arrived for `id`. Returns filters that were parked behind the
    /// REQ, which the caller should now issue.
    pub fn on_eose(&mut self, id: &str) -> Option<Vec<Filter>> {
        let state = self.subs.get_mut(id)?;
        if state.status.is_some_and(ReqSubStatus::is_open) {
            debug!("REQ {} on {}: Live", id, self.relay_url);
            state.status = Some(ReqSubStatus::Live);
        }
        state.queued.take()
    }

    /// The relay sent CLOSED. Filters stay for a later resend.
    pub fn on_closed(&mut self, id: &str) {
        if let Some(state) = self.subs.get_mut(id) {
            debug!("REQ {} on {}: Closed by relay", id, self.relay_url);
            state.status = Some(ReqSubStatus::Closed);
            state.queued = None;
        }
    }

    /// A CLOSE is being written. The subscription is no longer wanted, so the
    /// whole entry goes.
    pub fn on_close_req(&mut self, id: &str) {
        if self.subs.remove(id).is_some() {
            debug!("REQ {} on {}: Closed", id, self.relay_url);
        }
    }

    /// Forget everything about `id`.
    pub fn connecting(&mut self, id: &str) {
        self.subs.remove(id);
    }

    /// Socket went away: the relay no longer knows about `id`, but the
    /// filters are kept so the REQ can be resent after reconnecting.
    pub fn disconnected(&mut self, id: &str) {
        if let Some(state) = self.subs.get_mut(id) {
            state.status = None;
            if let Some(queued) = state.queued.take() {
                state.filters = Some(queued);
            }
        }
    }

    /// [`disconnected`](Self::disconnected) for every id.
    pub fn disconnected_all(&mut self) {
        let ids: Vec<String> = self.subs.keys().cloned().collect();
        for id in ids {
            self.disconnected(&id);
        }
        self.subs.retain(|_, state| state.filters.is_some());
    }

    /// Subscriptions that have filters but no REQ on the wire, in id order.
    pub fn to_resubscribe(&self) -> Vec<(String, Vec<Filter>)> {
        let mut out: Vec<(String, Vec<Filter>)> = self
            .subs
            .iter()
            .filter(|(_, state)| state.status.is_none())
            .filter_map(|(id, state)| state.filters.clone().map(|f| (id.clone(), f)))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Whether the caller still wants `id` (has filters and no CLOSE).
    pub fn is_wanted(&self, id: &str) -> bool {
        self.subs.get(id).is_some_and(|s| s.filters.is_some())
    }

    /// Whether any subscription is wanted.
    pub fn has_wanted(&self) -> bool {
        self.subs.values().any(|s| s.filters.is_some())
    }

    /// Number of ids with any state.
    pub fn len(&self) -> usize {
        self.subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    /// Ids with an open REQ on the wire.
    pub fn open_ids(&self) -> Vec<String> {
        self.subs
            .iter()
            .filter(|(_, s)| s.status.is_some_and(ReqSubStatus::is_open))
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// Collects filters for a REQ, one call per filter.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionBuilder {
    filters: Vec<Filter>,
}

impl SubscriptionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn kinds(self, kinds: Vec<u16>) -> Self {
        self.filter(Filter::new().kinds(kinds))
    }

    pub fn authors(self, authors: Vec<String>) -> Self {
        self.filter(Filter::new().authors(authors))
    }

    pub fn ids(self, ids: Vec<String>) -> Self {
        self.filter(Filter::new().ids(ids))
    }

    /// Replies and reactions to an event.
    pub fn thread(self, root_id: String) -> Self {
        self.filter(Filter::new().kinds(vec![1, 7]).tag('e', vec![root_id]))
    }

    /// Exact duplicates are dropped, first occurrence kept.
    pub fn build(self) -> Vec<Filter> {
        let mut out: Vec<Filter> = Vec::with_capacity(self.filters.len());
        for filter in self.filters {
            if !out.contains(&filter) {
                out.push(filter);
            }
        }
        out
    }
}

/// One pool subscription across its relays, for the "every relay sent EOSE"
/// signal.
#[derive(Debug, Clone)]
pub struct SubscriptionTracker {
    id: String,
    filters: Vec<Filter>,
    waiting: HashSet<RelayUrl>,
    done: HashSet<RelayUrl>,
}

impl SubscriptionTracker {
    pub fn new(id: impl Into<String>, filters: Vec<Filter>) -> Self {
        Self {
            id: id.into(),
            filters,
            waiting: HashSet::new(),
            done: HashSet::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    /// Swap in new filters. Every relay owes a fresh EOSE afterwards, so the
    /// subscription is complete again only once they all answer the new REQ.
    /// Returns false if the filters were unchanged.
    pub fn set_filters(&mut self, filters: Vec<Filter>) -> bool {
        if self.filters == filters {
            return false;
        }
        self.filters = filters;
        self.waiting.extend(self.done.drain());
        true
    }

    pub fn add_relay(&mut self, relay_url: RelayUrl) {
        if !self.done.contains(&relay_url) {
            self.waiting.insert(relay_url);
        }
    }

    /// Returns true if dropping the relay left every remaining relay done.
    pub fn remove_relay(&mut self, relay_url: &RelayUrl) -> bool {
        let was_complete = self.is_complete();
        let was_waiting = self.waiting.remove(relay_url);
        self.done.remove(relay_url);
        was_waiting && !was_complete && self.is_complete()
    }

    /// Returns true if this EOSE completed the set.
    pub fn mark_eose(&mut self, relay_url: &RelayUrl) -> bool {
        if !self.waiting.remove(relay_url) {
            return false;
        }
        self.done.insert(relay_url.clone());
        self.waiting.is_empty()
    }

    /// At least one relay, and all of them have sent EOSE.
    pub fn is_complete(&self) -> bool {
        self.waiting.is_empty() && !self.done.is_empty()
    }

    pub fn has_relay(&self, relay_url: &RelayUrl) -> bool {
        self.waiting.contains(relay_url) || self.done.contains(relay_url)
    }

    pub fn relay_count(&self) -> usize {
        self.waiting.len() + self.done.len()
    }
}
