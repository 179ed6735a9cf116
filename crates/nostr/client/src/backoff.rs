//! Reconnect backoff for a single relay connection.

use std::time::Duration;

/// Doubling backoff between a floor and a cap.
///
/// Deterministic: a relay that keeps failing waits `floor, 2*floor, 4*floor,
/// ...` up to `cap`. Each connection owns its own instance, so a burst of
/// relays failing together does not share or amplify state.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    floor: Duration,
    cap: Duration,
    current: Duration,
}

impl ReconnectBackoff {
    /// Creates a backoff starting at `floor`.
    ///
    /// # Examples
    ///
    /// ```
    /// use nostr_engine::backoff::ReconnectBackoff;
    /// use std::time::Duration;
    ///
    /// let mut backoff = ReconnectBackoff::new(Duration::from_millis(500), Duration::from_secs(2));
    /// assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    /// assert_eq!(backoff.next_delay(), Duration::from_millis(1000));
    /// assert_eq!(backoff.next_delay(), Duration::from_millis(2000));
    /// assert_eq!(backoff.next_delay(), Duration::from_millis(2000));
    /// ```
    #[must_use]
    pub fn new(floor: Duration, cap: Duration) -> Self {
        let cap = cap.max(floor);
        Self {
            floor,
            cap,
            current: floor,
        }
    }

    /// Return the delay to wait before the next attempt and advance.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.cap);
        delay
    }

    /// Delay the next call to [`next_delay`](Self::next_delay) will return.
    pub fn peek(&self) -> Duration {
        self.current
    }

    /// Back to the floor.
    pub fn reset(&mut self) {
        self.current = self.floor;
    }

    pub fn floor(&self) -> Duration {
        self.floor
    }

    pub fn cap(&self) -> Duration {
        self.cap
    }
}
