//! Broadcast tracking tests

use super::*;
use nostr_engine::{
    BroadcastEvent, BroadcastResult, BroadcastStatus, BroadcastTracker, RelayPool, RelayResult,
};
use pretty_assertions::assert_eq;
use tokio::task::JoinHandle;

struct Setup {
    connector: Arc<MockConnector>,
    pool: RelayPool,
    tracker: BroadcastTracker,
}

async fn setup(relays: &[&str]) -> (Setup, Vec<RelayUrl>) {
    let connector = MockConnector::new();
    let pool = RelayPool::with_connector(
        test_config(),
        Arc::clone(&connector) as Arc<dyn Connector>,
        None,
    );
    let urls: Vec<RelayUrl> = relays.iter().map(|r| pool.add_relay(r).unwrap()).collect();
    pool.connect_all().await;
    let tracker = BroadcastTracker::new(pool.clone());
    (
        Setup {
            connector,
            pool,
            tracker,
        },
        urls,
    )
}

fn spawn_track(
    tracker: &BroadcastTracker,
    event: &Event,
    relays: &[RelayUrl],
    timeout_secs: u64,
) -> JoinHandle<BroadcastResult> {
    let tracker = tracker.clone();
    let event = event.clone();
    let relays = relays.to_vec();
    tokio::spawn(async move { tracker.track(&event, &relays, timeout_secs).await })
}

fn ok(event_id: &str, success: bool, message: &str) -> RelayMessage {
    RelayMessage::Ok {
        event_id: event_id.to_string(),
        success,
        message: message.to_string(),
    }
}

#[tokio::test]
async fn test_all_relays_accept() {
    let (s, urls) = setup(&["wss://a.test", "wss://b.test"]).await;
    let mut completed = s.tracker.completed();
    let event = note("e1", 1);

    let handle = spawn_track(&s.tracker, &event, &urls, 5);
    for url in &urls {
        let relay = s.connector.relay(url);
        assert_eq!(relay.next_message().await, ClientMessage::Event(event.clone()));
        relay.send(ok("e1", true, ""));
    }

    let result = handle.await.unwrap();
    assert!(result.is_success);
    assert_eq!(result.broadcast.status, BroadcastStatus::Success);
    assert_eq!(result.broadcast.success_count(), 2);
    assert_eq!(result.broadcast.label, "Event e1");
    assert!(s.tracker.active().is_empty());
    assert_eq!(completed.recv().await.unwrap(), result.broadcast);
}

#[tokio::test]
async fn test_partial_with_parsed_error() {
    let (s, urls) = setup(&["wss://a.test", "wss://b.test"]).await;
    let event = note("e1", 1);

    let handle = spawn_track(&s.tracker, &event, &urls, 5);
    let relay_a = s.connector.relay(&urls[0]);
    let relay_b = s.connector.relay(&urls[1]);
    relay_a.next_message().await;
    relay_b.next_message().await;
    relay_a.send(ok("e1", true, "duplicate: already have it"));
    relay_b.send(ok("e1", false, "blocked: pubkey not allowed"));

    let result = handle.await.unwrap();
    assert!(result.is_success);
    assert_eq!(result.broadcast.status, BroadcastStatus::Partial);
    assert_eq!(result.broadcast.result(&urls[0]), Some(&RelayResult::Success));
    assert_eq!(
        result.broadcast.result(&urls[1]),
        Some(&RelayResult::Error {
            code: "BLOCKED".to_string(),
            message: "pubkey not allowed".to_string(),
        })
    );
    assert_eq!(result.broadcast.failed_relays(), vec![urls[1].clone()]);
}

#[tokio::test(start_paused = true)]
async fn test_silent_relay_times_out() {
    let (s, urls) = setup(&["wss://a.test", "wss://b.test"]).await;
    let event = note("e1", 1);

    let handle = spawn_track(&s.tracker, &event, &urls, 5);
    let relay_a = s.connector.relay(&urls[0]);
    relay_a.next_message().await;
    s.connector.relay(&urls[1]).next_message().await;
    relay_a.send(ok("e1", true, ""));

    let result = handle.await.unwrap();
    assert_eq!(result.broadcast.result(&urls[1]), Some(&RelayResult::Timeout));
    assert_eq!(result.broadcast.status, BroadcastStatus::Partial);
    assert_eq!(result.broadcast.pending_count(), 0);
    assert!(result.is_success);
}

#[tokio::test(start_paused = true)]
async fn test_nobody_answers() {
    let (s, urls) = setup(&["wss://a.test", "wss://b.test"]).await;
    let result = s.tracker.track(&note("e1", 1), &urls, 3).await;

    assert!(!result.is_success);
    assert_eq!(result.broadcast.status, BroadcastStatus::Failed);
    for url in &urls {
        assert_eq!(result.broadcast.result(url), Some(&RelayResult::Timeout));
    }
}

#[tokio::test]
async fn test_unreachable_relay_is_an_error() {
    let (s, urls) = setup(&["wss://a.test"]).await;
    let down = url("wss://down.test");
    s.connector.refuse(&down);
    let event = note("e1", 1);

    let targets = vec![urls[0].clone(), down.clone()];
    let handle = spawn_track(&s.tracker, &event, &targets, 30);
    let relay_a = s.connector.relay(&urls[0]);
    relay_a.next_message().await;
    relay_a.send(ok("e1", true, ""));

    let result = timeout(Duration::from_secs(5), handle)
        .await
        .expect("tracker waited for the unreachable relay")
        .unwrap();
    assert!(matches!(
        result.broadcast.result(&down),
        Some(RelayResult::Error { code, .. }) if code == "CONNECTION"
    ));
    assert_eq!(result.broadcast.status, BroadcastStatus::Partial);
}

#[tokio::test]
async fn test_disconnect_mid_broadcast() {
    let (s, urls) = setup(&["wss://a.test"]).await;
    let event = note("e1", 1);

    let handle = spawn_track(&s.tracker, &event, &urls, 30);
    let relay = s.connector.relay(&urls[0]);
    relay.next_message().await;
    relay.fail("connection reset");

    let result = handle.await.unwrap();
    assert!(matches!(
        result.broadcast.result(&urls[0]),
        Some(RelayResult::Error { code, .. }) if code == "DISCONNECTED"
    ));
    assert_eq!(result.broadcast.status, BroadcastStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_second_answer_from_relay_ignored() {
    let (s, urls) = setup(&["wss://a.test", "wss://b.test"]).await;
    let event = note("e1", 1);

    let handle = spawn_track(&s.tracker, &event, &urls, 5);
    let relay_a = s.connector.relay(&urls[0]);
    relay_a.next_message().await;
    relay_a.send(ok("e1", false, "error: try later"));
    relay_a.send(ok("e1", true, ""));

    let result = handle.await.unwrap();
    assert_eq!(result.broadcast.success_count(), 0);
    assert_eq!(result.broadcast.failure_count(), 2);
    assert!(matches!(
        result.broadcast.result(&urls[0]),
        Some(RelayResult::Error { .. })
    ));
}

#[tokio::test]
async fn test_empty_target_set_fails_without_sending() {
    let (s, urls) = setup(&["wss://a.test"]).await;
    let result = s.tracker.track(&note("e1", 1), &[], 5).await;

    assert!(!result.is_success);
    assert_eq!(result.broadcast.status, BroadcastStatus::Failed);
    s.connector
        .relay(&urls[0])
        .expect_silence(Duration::from_millis(50))
        .await;
}

#[tokio::test]
async fn test_active_while_in_flight() {
    let (s, urls) = setup(&["wss://a.test"]).await;
    let event = note("e1", 1);

    let handle = spawn_track(&s.tracker, &event, &urls, 30);
    let relay = s.connector.relay(&urls[0]);
    relay.next_message().await;

    let active = s.tracker.active();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].status, BroadcastStatus::InProgress);
    assert_eq!(active[0].result(&urls[0]), Some(&RelayResult::Pending));

    relay.send(ok("e1", true, ""));
    handle.await.unwrap();
    assert!(s.tracker.active().is_empty());
}

#[tokio::test]
async fn test_concurrent_tracks_are_independent() {
    let (s, urls) = setup(&["wss://a.test"]).await;
    let first = spawn_track(&s.tracker, &note("e1", 1), &urls, 30);
    let second = spawn_track(&s.tracker, &note("e2", 2), &urls, 30);

    let relay = s.connector.relay(&urls[0]);
    relay.next_message().await;
    relay.next_message().await;
    relay.send(ok("e2", false, "invalid: bad signature"));
    relay.send(ok("e1", true, ""));

    let first = first.await.unwrap();
    let second = second.await.unwrap();
    assert_ne!(first.broadcast.id, second.broadcast.id);
    assert_eq!(first.broadcast.status, BroadcastStatus::Success);
    assert_eq!(second.broadcast.status, BroadcastStatus::Failed);
}

fn mixed_original(event: &Event, urls: &[RelayUrl]) -> BroadcastEvent {
    BroadcastEvent::new("orig", "Event e1", event.clone(), urls)
        .with_result(&urls[0], RelayResult::Success)
        .with_result(
            &urls[1],
            RelayResult::Error {
                code: "ERROR".to_string(),
                message: "oops".to_string(),
            },
        )
        .with_result(&urls[2], RelayResult::Timeout)
}

#[tokio::test]
async fn test_retry_only_failed_relays() {
    let (s, urls) = setup(&["wss://a.test", "wss://b.test", "wss://c.test"]).await;
    let event = note("e1", 1);
    let original = mixed_original(&event, &urls);
    assert_eq!(original.status, BroadcastStatus::Partial);

    let retry = {
        let tracker = s.tracker.clone();
        let original = original.clone();
        let event = event.clone();
        tokio::spawn(async move { tracker.retry(&original, &event, None).await })
    };
    for url in &urls[1..] {
        let relay = s.connector.relay(url);
        assert_eq!(relay.next_message().await, ClientMessage::Event(event.clone()));
        relay.send(ok("e1", true, ""));
    }

    let result = retry.await.unwrap();
    assert_eq!(result.broadcast.targets, urls[1..].to_vec());
    assert_eq!(result.broadcast.label, "Retry: Event e1");
    assert!(result.broadcast.id.starts_with("orig-retry-"));
    assert_eq!(result.broadcast.status, BroadcastStatus::Success);
    s.connector
        .relay(&urls[0])
        .expect_silence(Duration::from_millis(50))
        .await;

    let merged = original.merged_with(&result.broadcast);
    assert_eq!(merged.status, BroadcastStatus::Success);
}

#[tokio::test]
async fn test_retry_specific_relay() {
    let (s, urls) = setup(&["wss://a.test", "wss://b.test", "wss://c.test"]).await;
    let event = note("e1", 1);
    let original = mixed_original(&event, &urls);

    let retry = {
        let tracker = s.tracker.clone();
        let original = original.clone();
        let event = event.clone();
        let target = urls[1].clone();
        tokio::spawn(async move { tracker.retry(&original, &event, Some(&target)).await })
    };
    let relay_b = s.connector.relay(&urls[1]);
    relay_b.next_message().await;
    relay_b.send(ok("e1", true, ""));

    let result = retry.await.unwrap();
    assert_eq!(result.broadcast.targets, vec![urls[1].clone()]);
    s.connector
        .relay(&urls[2])
        .expect_silence(Duration::from_millis(50))
        .await;
}

#[tokio::test]
async fn test_retry_with_nothing_failed_returns_original() {
    let (s, urls) = setup(&["wss://a.test"]).await;
    let event = note("e1", 1);
    let original =
        BroadcastEvent::new("orig", "Event e1", event.clone(), &urls).with_result(&urls[0], RelayResult::Success);

    let result = s.tracker.retry(&original, &event, None).await;
    assert_eq!(result.broadcast, original);
    assert!(result.is_success);

    // A relay that already succeeded is never retried, even when named
    let result = s.tracker.retry(&original, &event, Some(&urls[0])).await;
    assert_eq!(result.broadcast, original);
    s.connector
        .relay(&urls[0])
        .expect_silence(Duration::from_millis(50))
        .await;
    assert_eq!(s.pool.connected_count(), 1);
}

fn spawn_retry(tracker: &BroadcastTracker, original: &BroadcastEvent, event: &Event) -> JoinHandle<BroadcastResult> {
    let tracker = tracker.clone();
    let original = original.clone();
    let event = event.clone();
    tokio::spawn(async move { tracker.retry(&original, &event, None).await })
}

#[tokio::test]
async fn test_aborted_retry_releases_relays() {
    let (s, urls) = setup(&["wss://a.test", "wss://b.test", "wss://c.test"]).await;
    let event = note("e1", 1);
    let original = mixed_original(&event, &urls);

    let first = spawn_retry(&s.tracker, &original, &event);
    for url in &urls[1..] {
        s.connector.relay(url).next_message().await;
    }
    // The original marked Retrying plus the retry itself
    assert_eq!(s.tracker.active().len(), 2);

    first.abort();
    assert!(first.await.unwrap_err().is_cancelled());
    assert!(s.tracker.active().is_empty());

    let second = spawn_retry(&s.tracker, &original, &event);
    for url in &urls[1..] {
        let relay = s.connector.relay(url);
        assert_eq!(relay.next_message().await, ClientMessage::Event(event.clone()));
        relay.send(ok("e1", true, ""));
    }
    let result = second.await.unwrap();
    assert_eq!(result.broadcast.targets, urls[1..].to_vec());
    assert_eq!(result.broadcast.status, BroadcastStatus::Success);
    assert!(s.tracker.active().is_empty());
}

#[tokio::test]
async fn test_dropped_track_leaves_nothing_active() {
    let (s, urls) = setup(&["wss://a.test"]).await;
    let handle = spawn_track(&s.tracker, &note("e1", 1), &urls, 30);
    s.connector.relay(&urls[0]).next_message().await;
    assert_eq!(s.tracker.active().len(), 1);

    handle.abort();
    let _ = handle.await;
    assert!(s.tracker.active().is_empty());
}
