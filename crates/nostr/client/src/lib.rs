//! Relay connection engine for Nostr clients.
//!
//! This crate provides:
//! - WebSocket connections to relays with reconnect backoff and AUTH replay
//! - The NIP-01 wire codec (plus COUNT)
//! - Per-relay subscription state that never reissues an ambiguous REQ
//! - A relay pool that merges and deduplicates events across relays
//! - Broadcast tracking with per-relay results and scoped retry
//! - A bloom-filter backed index of which relays hold which ids
//! - Query-driven subscriptions that coalesce many interests into one REQ
//!
//! # Example
//!
//! ```rust,no_run
//! use nostr_engine::{BroadcastTracker, EngineConfig, Filter, PoolEvent, RelayPool};
//!
//! #[tokio::main]
//! async fn main() {
//!     let pool = RelayPool::new(EngineConfig::default());
//!     let mut events = pool.events();
//!
//!     let damus = pool.add_relay("wss://relay.damus.io").unwrap();
//!     let nos = pool.add_relay("nos.lol").unwrap();
//!     pool.connect_all().await;
//!     pool.start_maintenance();
//!
//!     // Kind 1 text notes
//!     let filter = Filter::new().kinds(vec![1]).limit(10);
//!     pool.subscribe_to("feed", vec![filter], &[damus.clone(), nos.clone()]);
//!
//!     while let Ok(event) = events.recv().await {
//!         match event {
//!             PoolEvent::Event { event, .. } => println!("Received event: {}", event.id),
//!             PoolEvent::AllEose { subscription_id } => {
//!                 println!("Got all stored events for {}", subscription_id);
//!                 break;
//!             }
//!             _ => {}
//!         }
//!     }
//!
//!     let tracker = BroadcastTracker::new(pool.clone());
//!     # let signed = nostr_engine::Event {
//!     #     id: String::new(), pubkey: String::new(), created_at: 0, kind: 1,
//!     #     tags: vec![], content: String::new(), sig: String::new(),
//!     # };
//!     let result = tracker.track(&signed, &[damus, nos], 5).await;
//!     println!("{:?} ({} ok)", result.broadcast.status, result.broadcast.success_count());
//!
//!     pool.shutdown();
//! }
//! ```

pub mod backoff;
pub mod bloom;
pub mod broadcast;
pub mod config;
pub mod connection;
pub mod dedup;
pub mod error;
pub mod event;
pub mod hints;
pub mod listener;
pub mod message;
pub mod pool;
pub mod query;
pub mod relay_url;
pub mod stats;
pub mod subscription;
pub mod transport;

// Re-export main types
pub use backoff::ReconnectBackoff;
pub use bloom::BloomFilter;
pub use broadcast::{
    BroadcastEvent, BroadcastResult, BroadcastStatus, BroadcastTracker, RelayResult,
    parse_ok_message,
};
pub use config::{
    BroadcastConfig, EngineConfig, HintConfig, PoolConfig, RelayConfig, load_config, save_config,
};
pub use connection::{AuthSigner, ConnectionState, RelayConnection};
pub use dedup::SeenWindow;
pub use error::{ClientError, Result};
pub use event::Event;
pub use hints::{HintCategory, HintIndexer};
pub use listener::{ListenerHandle, ListenerRegistry, NoopListener, RelayListener};
pub use message::{ClientMessage, Filter, MessageError, RelayMessage};
pub use pool::{PoolEvent, RelayPool};
pub use query::{MutableQueryState, QueryState, SubscriptionOrchestrator};
pub use relay_url::RelayUrl;
pub use stats::{RelayStats, RelayStatsSnapshot};
pub use subscription::{
    ReqPlan, ReqSubStatus, SubscriptionBuilder, SubscriptionRegistry, SubscriptionTracker,
    generate_subscription_id,
};
pub use transport::{Connector, Socket, SocketEvent, WebSocketConnector};

/// Well-known public relays.
pub const DEFAULT_RELAYS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.nostr.band",
    "wss://nostr.wine",
];

/// Create a pool whose `connect_default` uses [`DEFAULT_RELAYS`].
pub fn default_pool() -> RelayPool {
    let mut config = EngineConfig::default();
    config.pool.default_relays = DEFAULT_RELAYS.iter().map(|s| s.to_string()).collect();
    RelayPool::new(config)
}
