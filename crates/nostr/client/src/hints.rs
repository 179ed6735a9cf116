//! Probabilistic index of which relays likely hold an event, address or key.
//!
//! One [`BloomFilter`] per category is shared by every relay. Each relay
//! inserts under its own seed ([`RelayUrl::hash_code`]), so asking "does relay
//! R have id X" is a bloom test of `X` under R's seed. Lookups walk every
//! relay ever recorded and test each one.
//!
//! The index is append-only. False positives grow with fill; false negatives
//! never happen for an `(id, relay)` pair that was added.

use crate::bloom::BloomFilter;
use crate::config::HintConfig;
use crate::relay_url::RelayUrl;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Which of the three filters an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HintCategory {
    Event,
    Address,
    Key,
}

/// Relay hint index.
#[derive(Debug)]
pub struct HintIndexer {
    events: BloomFilter,
    addresses: BloomFilter,
    keys: BloomFilter,
    /// Every relay seen in any category, copy-on-write so lookups iterate a
    /// snapshot without holding the lock.
    relays: RwLock<Arc<Vec<RelayUrl>>>,
    known: RwLock<HashSet<RelayUrl>>,
}

impl Default for HintIndexer {
    fn default() -> Self {
        Self::new(HintConfig::default())
    }
}

impl HintIndexer {
    /// Create an index sized by `config`.
    pub fn new(config: HintConfig) -> Self {
        debug!(
            "Creating hint index: events={} addresses={} keys={} rounds={}",
            config.expected_events,
            config.expected_addresses,
            config.expected_keys,
            config.hash_rounds
        );
        Self {
            events: BloomFilter::with_capacity(config.expected_events, config.hash_rounds),
            addresses: BloomFilter::with_capacity(config.expected_addresses, config.hash_rounds),
            keys: BloomFilter::with_capacity(config.expected_keys, config.hash_rounds),
            relays: RwLock::new(Arc::new(Vec::new())),
            known: RwLock::new(HashSet::new()),
        }
    }

    fn filter(&self, category: HintCategory) -> &BloomFilter {
        match category {
            HintCategory::Event => &self.events,
            HintCategory::Address => &self.addresses,
            HintCategory::Key => &self.keys,
        }
    }

    fn remember(&self, relay: &RelayUrl) {
        if self.known.read().contains(relay) {
            return;
        }
        let mut known = self.known.write();
        if known.insert(relay.clone()) {
            let mut relays = self.relays.write();
            let mut next = Vec::with_capacity(relays.len() + 1);
            next.extend(relays.iter().cloned());
            next.push(relay.clone());
            *relays = Arc::new(next);
        }
    }

    /// Record that `relay` holds `id` in `category`.
    pub fn add(&self, category: HintCategory, id: impl AsRef<[u8]>, relay: &RelayUrl) {
        self.remember(relay);
        self.filter(category).insert(id.as_ref(), relay.hash_code());
    }

    /// Relays that may hold `id` in `category`.
    pub fn hints(&self, category: HintCategory, id: impl AsRef<[u8]>) -> HashSet<RelayUrl> {
        let id = id.as_ref();
        let filter = self.filter(category);
        let relays = Arc::clone(&self.relays.read());
        relays
            .iter()
            .filter(|relay| filter.contains(id, relay.hash_code()))
            .cloned()
            .collect()
    }

    pub fn add_event(&self, id: impl AsRef<[u8]>, relay: &RelayUrl) {
        self.add(HintCategory::Event, id, relay);
    }

    pub fn add_address(&self, id: impl AsRef<[u8]>, relay: &RelayUrl) {
        self.add(HintCategory::Address, id, relay);
    }

    pub fn add_key(&self, id: impl AsRef<[u8]>, relay: &RelayUrl) {
        self.add(HintCategory::Key, id, relay);
    }

    pub fn hints_for_event(&self, id: impl AsRef<[u8]>) -> HashSet<RelayUrl> {
        self.hints(HintCategory::Event, id)
    }

    pub fn hints_for_address(&self, id: impl AsRef<[u8]>) -> HashSet<RelayUrl> {
        self.hints(HintCategory::Address, id)
    }

    pub fn hints_for_key(&self, id: impl AsRef<[u8]>) -> HashSet<RelayUrl> {
        self.hints(HintCategory::Key, id)
    }

    /// Every relay recorded in any category.
    pub fn known_relays(&self) -> Arc<Vec<RelayUrl>> {
        Arc::clone(&self.relays.read())
    }
}
