//! Configuration file tests

use super::*;
use nostr_engine::{BroadcastTracker, RelayPool, RelayResult, load_config, save_config};

const CONFIG: &str = r#"{
    "relay": { "backoffFloorMs": 200, "backoffCapMs": 1000 },
    "pool": { "defaultRelays": ["wss://a.test", "b.test/"] },
    "broadcast": { "timeoutSecs": 2 },
    "hints": { "expectedEvents": 1000, "expectedAddresses": 100, "expectedKeys": 1000 }
}"#;

fn load(dir: &tempfile::TempDir) -> EngineConfig {
    init_tracing();
    let path = dir.path().join("engine.json");
    std::fs::write(&path, CONFIG).unwrap();
    load_config(&path).unwrap()
}

#[tokio::test]
async fn test_default_relays_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = load(&dir);
    let connector = MockConnector::new();
    let pool = RelayPool::with_connector(config, Arc::clone(&connector) as Arc<dyn Connector>, None);

    let results = pool.connect_default().await;
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|(_, r)| r.is_ok()));
    assert_eq!(
        pool.relay_urls(),
        vec![url("wss://a.test"), url("wss://b.test")]
    );
}

#[tokio::test(start_paused = true)]
async fn test_backoff_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = load(&dir);
    let connector = MockConnector::new();
    let pool = RelayPool::with_connector(config, Arc::clone(&connector) as Arc<dyn Connector>, None);
    let a = pool.add_relay("wss://a.test").unwrap();
    connector.refuse(&a);

    let conn = pool.relay(&a).unwrap();
    let mut delays = Vec::new();
    for _ in 0..4 {
        assert!(conn.connect().await.is_err());
        delays.push(conn.retry_delay().as_millis());
    }
    assert_eq!(delays, vec![400, 800, 1000, 1000]);
}

#[tokio::test(start_paused = true)]
async fn test_broadcast_timeout_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = load(&dir);
    let connector = MockConnector::new();
    let pool = RelayPool::with_connector(config, Arc::clone(&connector) as Arc<dyn Connector>, None);
    let a = pool.add_relay("wss://a.test").unwrap();
    pool.connect_all().await;
    let tracker = BroadcastTracker::new(pool);

    let started = tokio::time::Instant::now();
    let result = tracker.track_default(&note("e1", 1), &[a.clone()]).await;

    assert_eq!(started.elapsed(), Duration::from_secs(2));
    assert_eq!(result.broadcast.result(&a), Some(&RelayResult::Timeout));
}

#[test]
fn test_saved_config_loads_back() {
    let dir = tempfile::tempdir().unwrap();
    let config = load(&dir);
    let path = dir.path().join("nested").join("copy.json");

    save_config(&path, &config).unwrap();
    assert_eq!(load_config(&path).unwrap(), config);
}
