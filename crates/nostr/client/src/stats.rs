//! Per-relay counters.

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters for one relay connection. Cheap to update from any task.
#[derive(Debug, Default)]
pub struct RelayStats {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    messages_sent: AtomicU64,
    bytes_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_received: AtomicU64,
    rejections: AtomicU64,
    malformed: AtomicU64,
    last_error: RwLock<Option<String>>,
}

/// Point-in-time copy of [`RelayStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStatsSnapshot {
    /// Connect attempts
    pub attempts: u64,
    /// Attempts that opened a socket
    pub successes: u64,
    /// Attempts that failed or timed out
    pub failures: u64,
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub messages_received: u64,
    pub bytes_received: u64,
    /// CLOSED frames and refused OKs
    pub rejections: u64,
    /// Frames that did not parse
    pub malformed: u64,
    /// Most recent connect or socket error
    pub last_error: Option<String>,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self, error: impl Into<String>) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        *self.last_error.write() = Some(error.into());
    }

    pub fn record_sent(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// OK(false) or CLOSED from the relay.
    pub fn record_rejection(&self) {
        self.rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            last_error: self.last_error.read().clone(),
        }
    }
}
