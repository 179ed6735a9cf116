//! Integration tests for the relay engine
//!
//! These drive the real pool, connections, broadcast tracker and query
//! orchestrator against an in-memory connector that records what the client
//! writes and lets each test play the relay side.

pub mod broadcast;
pub mod config;
pub mod pool;

use async_trait::async_trait;
use nostr_engine::{
    AuthSigner, ClientError, ClientMessage, Connector, EngineConfig, Event, HintConfig,
    RelayListener, RelayMessage, RelayUrl, Result, Socket, SocketEvent,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tokio::time::{Duration, timeout};

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

pub fn url(s: &str) -> RelayUrl {
    RelayUrl::parse(s).unwrap()
}

/// Engine config with a small hint index.
pub fn test_config() -> EngineConfig {
    init_tracing();
    EngineConfig {
        hints: HintConfig {
            expected_events: 10_000,
            expected_addresses: 1_000,
            expected_keys: 10_000,
            hash_rounds: 5,
        },
        ..Default::default()
    }
}

pub fn note(id: &str, created_at: u64) -> Event {
    Event {
        id: id.to_string(),
        pubkey: "a".repeat(64),
        created_at,
        kind: 1,
        tags: vec![],
        content: format!("note {}", id),
        sig: "b".repeat(128),
    }
}

/// What the relay side sees from the client, across reconnects.
enum Wire {
    Frame(String),
    SocketClosed,
}

/// The relay side of the in-memory sockets to one URL.
pub struct MockRelay {
    url: RelayUrl,
    connects: AtomicUsize,
    inbound: Mutex<Option<mpsc::UnboundedSender<SocketEvent>>>,
    wire_tx: mpsc::UnboundedSender<Wire>,
    wire_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Wire>>,
}

impl MockRelay {
    fn new(url: RelayUrl) -> Self {
        let (wire_tx, wire_rx) = mpsc::unbounded_channel();
        Self {
            url,
            connects: AtomicUsize::new(0),
            inbound: Mutex::new(None),
            wire_tx,
            wire_rx: tokio::sync::Mutex::new(wire_rx),
        }
    }

    pub fn url(&self) -> &RelayUrl {
        &self.url
    }

    /// Sockets opened to this relay so far.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Play a frame from the relay.
    pub fn send(&self, message: RelayMessage) {
        self.send_raw(&message.to_json());
    }

    pub fn send_raw(&self, frame: &str) {
        let inbound = self.inbound.lock();
        let tx = inbound.as_ref().expect("relay has no open socket");
        tx.send(SocketEvent::Text(frame.to_string()))
            .expect("client read task is gone");
    }

    /// Relay closes the socket.
    pub fn close(&self, code: u16, reason: &str) {
        if let Some(tx) = self.inbound.lock().take() {
            let _ = tx.send(SocketEvent::Closed {
                code,
                reason: reason.to_string(),
            });
        }
    }

    /// Socket breaks.
    pub fn fail(&self, error: &str) {
        if let Some(tx) = self.inbound.lock().take() {
            let _ = tx.send(SocketEvent::Failure(error.to_string()));
        }
    }

    /// Next frame the client wrote, parsed.
    pub async fn next_message(&self) -> ClientMessage {
        let frame = self.next_frame().await;
        ClientMessage::from_json(&frame).unwrap()
    }

    /// Next frame the client wrote on any socket.
    pub async fn next_frame(&self) -> String {
        let mut wire = self.wire_rx.lock().await;
        timeout(Duration::from_secs(5), async {
            loop {
                match wire.recv().await {
                    Some(Wire::Frame(frame)) => return frame,
                    Some(Wire::SocketClosed) => continue,
                    None => panic!("wire to {} is gone", self.url),
                }
            }
        })
        .await
        .expect("timed out waiting for a client frame")
    }

    /// Assert the client writes nothing for `within`.
    pub async fn expect_silence(&self, within: Duration) {
        let mut wire = self.wire_rx.lock().await;
        let frame = timeout(within, async {
            loop {
                match wire.recv().await {
                    Some(Wire::Frame(frame)) => return frame,
                    Some(Wire::SocketClosed) => continue,
                    None => std::future::pending::<()>().await,
                }
            }
        })
        .await;
        if let Ok(frame) = frame {
            panic!("unexpected frame to {}: {}", self.url, frame);
        }
    }

    /// Wait until the client drops a socket, skipping frames written before.
    pub async fn wait_closed(&self) {
        let mut wire = self.wire_rx.lock().await;
        timeout(Duration::from_secs(5), async {
            loop {
                if let Some(Wire::SocketClosed) | None = wire.recv().await {
                    return;
                }
            }
        })
        .await
        .expect("client kept the socket open");
    }
}

/// In-memory [`Connector`]: every relay accepts unless refused.
#[derive(Default)]
pub struct MockConnector {
    relays: Mutex<HashMap<RelayUrl, Arc<MockRelay>>>,
    refused: Mutex<HashSet<RelayUrl>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Handle to the relay side of `url`, created on first use.
    pub fn relay(&self, url: &RelayUrl) -> Arc<MockRelay> {
        Arc::clone(
            self.relays
                .lock()
                .entry(url.clone())
                .or_insert_with(|| Arc::new(MockRelay::new(url.clone()))),
        )
    }

    pub fn refuse(&self, url: &RelayUrl) {
        self.refused.lock().insert(url.clone());
    }

    pub fn accept(&self, url: &RelayUrl) {
        self.refused.lock().remove(url);
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &RelayUrl) -> Result<Socket> {
        let relay = self.relay(url);
        relay.connects.fetch_add(1, Ordering::SeqCst);
        if self.refused.lock().contains(url) {
            return Err(ClientError::Connection(format!("{} refused", url)));
        }
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let wire = relay.wire_tx.clone();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let _ = wire.send(Wire::Frame(frame));
            }
            let _ = wire.send(Wire::SocketClosed);
        });
        *relay.inbound.lock() = Some(in_tx);
        Ok(Socket::new(out_tx, in_rx))
    }
}

/// Listener that logs every callback as a short string.
///
/// Entries look like `event:<sub>:<id>:<after_eose>`; see the impl for the
/// rest.
pub struct Recorder {
    log: Mutex<Vec<String>>,
    tx: mpsc::UnboundedSender<String>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            log: Mutex::new(Vec::new()),
            tx,
            rx: tokio::sync::Mutex::new(rx),
        })
    }

    fn push(&self, entry: String) {
        self.log.lock().push(entry.clone());
        let _ = self.tx.send(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.log
            .lock()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }

    /// Consume callbacks until one equal to `entry` arrives.
    pub async fn wait_for(&self, entry: &str) {
        let mut rx = self.rx.lock().await;
        timeout(Duration::from_secs(5), async {
            while let Some(next) = rx.recv().await {
                if next == entry {
                    return;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no {} callback, saw {:?}", entry, self.entries()));
    }
}

impl RelayListener for Recorder {
    fn on_connecting(&self, _relay: &RelayUrl) {
        self.push("connecting".to_string());
    }

    fn on_connected(&self, _relay: &RelayUrl) {
        self.push("connected".to_string());
    }

    fn on_disconnected(&self, _relay: &RelayUrl) {
        self.push("disconnected".to_string());
    }

    fn on_cannot_connect(&self, _relay: &RelayUrl, _error: &str) {
        self.push("cannot_connect".to_string());
    }

    fn on_event(&self, _relay: &RelayUrl, subscription_id: &str, event: &Event, after_eose: bool) {
        self.push(format!("event:{}:{}:{}", subscription_id, event.id, after_eose));
    }

    fn on_eose(&self, _relay: &RelayUrl, subscription_id: &str) {
        self.push(format!("eose:{}", subscription_id));
    }

    fn on_closed(&self, _relay: &RelayUrl, subscription_id: &str, message: &str) {
        self.push(format!("closed:{}:{}", subscription_id, message));
    }

    fn on_notice(&self, _relay: &RelayUrl, message: &str) {
        self.push(format!("notice:{}", message));
    }

    fn on_notify(&self, _relay: &RelayUrl, message: &str) {
        self.push(format!("notify:{}", message));
    }

    fn on_auth(&self, _relay: &RelayUrl, challenge: &str) {
        self.push(format!("auth:{}", challenge));
    }

    fn on_authed(&self, _relay: &RelayUrl) {
        self.push("authed".to_string());
    }

    fn on_send_response(&self, _relay: &RelayUrl, event_id: &str, success: bool, message: &str) {
        self.push(format!("ok:{}:{}:{}", event_id, success, message));
    }

    fn on_count(&self, _relay: &RelayUrl, subscription_id: &str, count: u64) {
        self.push(format!("count:{}:{}", subscription_id, count));
    }

    fn on_error(&self, _relay: &RelayUrl, error: &str) {
        self.push(format!("error:{}", error));
    }
}

/// Answers every challenge with an event whose id is `auth-<challenge>`.
pub struct TestSigner;

impl AuthSigner for TestSigner {
    fn sign_auth(&self, relay: &RelayUrl, challenge: &str) -> Option<Event> {
        Some(Event {
            id: format!("auth-{}", challenge),
            pubkey: "a".repeat(64),
            created_at: 1_700_000_000,
            kind: 22242,
            tags: vec![
                vec!["relay".to_string(), relay.to_string()],
                vec!["challenge".to_string(), challenge.to_string()],
            ],
            content: String::new(),
            sig: "b".repeat(128),
        })
    }
}
