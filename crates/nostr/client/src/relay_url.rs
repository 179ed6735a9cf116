//! Canonical relay addresses.
//!
//! Every place that compares, hashes or stores a relay goes through
//! [`RelayUrl`], so two spellings of the same relay always collapse to one
//! key: `WSS://Relay.Example.com:443/` and `relay.example.com` are the same
//! relay.

use crate::error::{ClientError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;
use std::str::FromStr;
use std::sync::Arc;
use url::Url;

/// A canonicalized `ws://` or `wss://` relay address.
///
/// Canonical form: lowercase scheme and host, default port dropped, fragment
/// dropped, no trailing slash. A missing scheme defaults to `wss://`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RelayUrl(Arc<str>);

impl RelayUrl {
    /// Parse and canonicalize a relay address.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ClientError::InvalidUrl("empty relay url".to_string()));
        }

        let with_scheme = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("wss://{}", trimmed)
        };

        let mut url = Url::parse(&with_scheme)?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(ClientError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                url.scheme()
            )));
        }
        if url.host_str().is_none_or(str::is_empty) {
            return Err(ClientError::InvalidUrl(format!("missing host: {}", trimmed)));
        }
        url.set_fragment(None);

        let mut canonical = url.to_string();
        while canonical.ends_with('/') {
            canonical.pop();
        }

        Ok(Self(Arc::from(canonical)))
    }

    /// Canonical string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Host part of the address.
    pub fn host(&self) -> &str {
        let rest = self
            .0
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.0);
        let end = rest.find(['/', '?', ':']).unwrap_or(rest.len());
        &rest[..end]
    }

    /// Stable 32-bit hash of the canonical form.
    ///
    /// Used as the per-relay bloom filter seed, so it must not change across
    /// process restarts or toolchain versions.
    pub fn hash_code(&self) -> u32 {
        murmur3::murmur3_32(&mut Cursor::new(self.0.as_bytes()), 0).unwrap_or(0)
    }
}

impl fmt::Display for RelayUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for RelayUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RelayUrl({})", self.0)
    }
}

impl FromStr for RelayUrl {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RelayUrl {
    type Error = ClientError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl TryFrom<&str> for RelayUrl {
    type Error = ClientError;

    fn try_from(value: &str) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<RelayUrl> for String {
    fn from(url: RelayUrl) -> Self {
        url.0.to_string()
    }
}

impl AsRef<str> for RelayUrl {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
