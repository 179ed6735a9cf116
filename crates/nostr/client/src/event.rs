//! Signed Nostr event as carried on the wire.
//!
//! The engine never inspects signatures or content; it only needs the id, the
//! author and, for addressable kinds, the `d` tag to build hint keys.

use serde::{Deserialize, Serialize};

/// A signed Nostr event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// 32-bytes lowercase hex-encoded sha256 of the serialized event data
    pub id: String,
    /// 32-bytes lowercase hex-encoded public key of the event creator
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind (integer between 0 and 65535)
    pub kind: u16,
    /// Array of arrays of strings (tags)
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
    /// 64-bytes lowercase hex signature
    pub sig: String,
}

impl Event {
    /// Replaceable kinds: 0, 3 and 10000..20000.
    pub fn is_replaceable(&self) -> bool {
        self.kind == 0 || self.kind == 3 || (10_000..20_000).contains(&self.kind)
    }

    /// Addressable (parameterized replaceable) kinds: 30000..40000.
    pub fn is_addressable(&self) -> bool {
        (30_000..40_000).contains(&self.kind)
    }

    /// First value of the `d` tag, if any.
    pub fn d_tag(&self) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.first().map(String::as_str) == Some("d"))
            .and_then(|tag| tag.get(1))
            .map(String::as_str)
    }

    /// Address id `<kind>:<pubkey>:<d-tag>` for replaceable and addressable
    /// events. Replaceable kinds use an empty `d` value.
    pub fn address(&self) -> Option<String> {
        if self.is_addressable() {
            Some(format!(
                "{}:{}:{}",
                self.kind,
                self.pubkey,
                self.d_tag().unwrap_or("")
            ))
        } else if self.is_replaceable() {
            Some(format!("{}:{}:", self.kind, self.pubkey))
        } else {
            None
        }
    }
}
