//! Engine configuration.
//!
//! Stored as camelCase JSON. Every field has a default, so a partial file (or
//! `{}`) is a valid configuration.

use crate::error::{ClientError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Applied to every relay connection
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    /// Bloom filter sizing for relay hints
    #[serde(default)]
    pub hints: HintConfig,
}

impl EngineConfig {
    /// Parse from JSON text.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the engine misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.relay.backoff_floor_ms == 0 {
            return Err(ClientError::Config(
                "relay.backoffFloorMs must be greater than zero".to_string(),
            ));
        }
        if self.relay.backoff_cap_ms < self.relay.backoff_floor_ms {
            return Err(ClientError::Config(
                "relay.backoffCapMs must not be below relay.backoffFloorMs".to_string(),
            ));
        }
        if self.pool.maintenance_interval_ms == 0 {
            return Err(ClientError::Config(
                "pool.maintenanceIntervalMs must be greater than zero".to_string(),
            ));
        }
        if self.hints.hash_rounds == 0 {
            return Err(ClientError::Config(
                "hints.hashRounds must be greater than zero".to_string(),
            ));
        }
        if self.pool.event_channel_capacity == 0 || self.broadcast.completed_channel_capacity == 0
        {
            return Err(ClientError::Config(
                "channel capacities must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    /// Socket open timeout
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// First reconnect delay; the delay resets here after every successful connect
    #[serde(default = "default_backoff_floor_ms")]
    pub backoff_floor_ms: u64,

    /// Upper bound for the doubling reconnect delay
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// Outbound frames kept while disconnected; oldest dropped first
    #[serde(default = "default_max_queued")]
    pub max_queued_messages: usize,
}

impl RelayConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn backoff_floor(&self) -> Duration {
        Duration::from_millis(self.backoff_floor_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            backoff_floor_ms: default_backoff_floor_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            max_queued_messages: default_max_queued(),
        }
    }
}

/// Relay pool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    /// Capacity of the `PoolEvent` broadcast channel
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Number of recent event ids remembered for cross-relay dedup
    #[serde(default = "default_dedup_window")]
    pub dedup_window: usize,

    /// How often the maintenance task retries relays that still have wanted
    /// subscriptions
    #[serde(default = "default_maintenance_interval_ms")]
    pub maintenance_interval_ms: u64,

    /// Relays added by `connect_default`
    #[serde(default)]
    pub default_relays: Vec<String>,
}

impl PoolConfig {
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms.max(1))
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            event_channel_capacity: default_event_channel_capacity(),
            dedup_window: default_dedup_window(),
            maintenance_interval_ms: default_maintenance_interval_ms(),
            default_relays: Vec::new(),
        }
    }
}

/// Broadcast tracking settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastConfig {
    /// Timeout used by `track_default`
    #[serde(default = "default_broadcast_timeout_secs")]
    pub timeout_secs: u64,

    /// Capacity of the completed-broadcast channel
    #[serde(default = "default_completed_capacity")]
    pub completed_channel_capacity: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_broadcast_timeout_secs(),
            completed_channel_capacity: default_completed_capacity(),
        }
    }
}

/// Hint index sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HintConfig {
    /// Expected (event id, relay) pairs
    #[serde(default = "default_expected_events")]
    pub expected_events: usize,
    /// Expected (address, relay) pairs
    #[serde(default = "default_expected_addresses")]
    pub expected_addresses: usize,
    /// Expected (pubkey, relay) pairs
    #[serde(default = "default_expected_keys")]
    pub expected_keys: usize,
    /// Hash functions per insert
    #[serde(default = "default_hash_rounds")]
    pub hash_rounds: usize,
}

impl Default for HintConfig {
    fn default() -> Self {
        Self {
            expected_events: default_expected_events(),
            expected_addresses: default_expected_addresses(),
            expected_keys: default_expected_keys(),
            hash_rounds: default_hash_rounds(),
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_backoff_floor_ms() -> u64 {
    500
}

fn default_backoff_cap_ms() -> u64 {
    300_000
}

fn default_max_queued() -> usize {
    1000
}

fn default_event_channel_capacity() -> usize {
    1000
}

fn default_dedup_window() -> usize {
    10_000
}

fn default_maintenance_interval_ms() -> u64 {
    5_000
}

fn default_broadcast_timeout_secs() -> u64 {
    5
}

fn default_completed_capacity() -> usize {
    64
}

fn default_expected_events() -> usize {
    10_000_000
}

fn default_expected_addresses() -> usize {
    2_000_000
}

fn default_expected_keys() -> usize {
    10_000_000
}

fn default_hash_rounds() -> usize {
    5
}

/// Load configuration from a JSON file.
pub fn load_config(path: impl AsRef<Path>) -> Result<EngineConfig> {
    let content = fs::read_to_string(path.as_ref())?;
    EngineConfig::from_json_str(&content)
}

/// Write configuration as pretty JSON, creating parent directories.
pub fn save_config(path: impl AsRef<Path>, config: &EngineConfig) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(config)?;
    fs::write(path, content)?;
    Ok(())
}
