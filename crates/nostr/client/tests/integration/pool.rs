//! Relay pool integration tests

use super::*;
use nostr_engine::{ConnectionState, Filter, PoolEvent, RelayPool};
use tokio::sync::broadcast;

fn pool_with(connector: &Arc<MockConnector>) -> RelayPool {
    RelayPool::with_connector(
        test_config(),
        Arc::clone(connector) as Arc<dyn Connector>,
        None,
    )
}

/// Skip pool events until one matches.
async fn next_matching(
    events: &mut broadcast::Receiver<PoolEvent>,
    pred: impl Fn(&PoolEvent) -> bool,
) -> PoolEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for pool event")
}

fn req_id(message: ClientMessage) -> String {
    match message {
        ClientMessage::Req {
            subscription_id, ..
        } => subscription_id,
        other => panic!("expected REQ, got {:?}", other),
    }
}

#[tokio::test]
async fn test_events_deduplicated_across_relays() {
    let connector = MockConnector::new();
    let pool = pool_with(&connector);
    let mut events = pool.events();
    let a = pool.add_relay("wss://a.test").unwrap();
    let b = pool.add_relay("wss://b.test").unwrap();
    pool.connect_all().await;
    assert_eq!(pool.connected_count(), 2);

    pool.subscribe_to("feed", vec![Filter::new().kinds(vec![1])], &[a.clone(), b.clone()]);
    let relay_a = connector.relay(&a);
    let relay_b = connector.relay(&b);
    relay_a.next_message().await;
    relay_b.next_message().await;

    let shared = note("shared", 10);
    relay_a.send(RelayMessage::Event {
        subscription_id: "feed".to_string(),
        event: shared.clone(),
    });
    relay_b.send(RelayMessage::Event {
        subscription_id: "feed".to_string(),
        event: shared.clone(),
    });
    relay_a.send(RelayMessage::Eose {
        subscription_id: "feed".to_string(),
    });

    match next_matching(&mut events, |e| matches!(e, PoolEvent::Event { .. })).await {
        PoolEvent::Event {
            subscription_id,
            event,
            after_eose,
            ..
        } => {
            assert_eq!(subscription_id, "feed");
            assert_eq!(event, shared);
            assert!(!after_eose);
        }
        other => panic!("expected an event, got {:?}", other),
    }
    next_matching(&mut events, |e| matches!(e, PoolEvent::Eose { .. })).await;
    assert!(!pool.all_eose("feed"));

    relay_b.send(RelayMessage::Eose {
        subscription_id: "feed".to_string(),
    });
    let done = next_matching(&mut events, |e| {
        matches!(e, PoolEvent::AllEose { .. } | PoolEvent::Event { .. })
    })
    .await;
    assert_eq!(
        done,
        PoolEvent::AllEose {
            subscription_id: "feed".to_string()
        }
    );
    assert!(pool.all_eose("feed"));
}

#[tokio::test]
async fn test_inbound_events_feed_hints() {
    let connector = MockConnector::new();
    let pool = pool_with(&connector);
    let mut events = pool.events();
    let a = pool.add_relay("wss://a.test").unwrap();
    pool.connect_all().await;

    pool.subscribe_to("feed", vec![Filter::new()], &[a.clone()]);
    let relay = connector.relay(&a);
    relay.next_message().await;

    let mut article = note("article", 1);
    article.kind = 30023;
    article.tags = vec![vec!["d".to_string(), "slug".to_string()]];
    relay.send(RelayMessage::Event {
        subscription_id: "feed".to_string(),
        event: article.clone(),
    });
    next_matching(&mut events, |e| matches!(e, PoolEvent::Event { .. })).await;

    let hints = pool.hints();
    assert!(hints.hints_for_event("article").contains(&a));
    assert!(hints.hints_for_key(&article.pubkey).contains(&a));
    let address = article.address().unwrap();
    assert!(hints.hints_for_address(&address).contains(&a));
}

#[tokio::test]
async fn test_fetch_collects_until_all_eose() {
    let connector = MockConnector::new();
    let pool = pool_with(&connector);
    let a = pool.add_relay("wss://a.test").unwrap();
    let b = pool.add_relay("wss://b.test").unwrap();
    pool.connect_all().await;

    let fetching = {
        let pool = pool.clone();
        let relays = vec![a.clone(), b.clone()];
        tokio::spawn(async move {
            pool.fetch(
                vec![Filter::new().kinds(vec![1])],
                &relays,
                Duration::from_secs(10),
            )
            .await
        })
    };

    let relay_a = connector.relay(&a);
    let relay_b = connector.relay(&b);
    let sub_a = req_id(relay_a.next_message().await);
    let sub_b = req_id(relay_b.next_message().await);
    assert_eq!(sub_a, sub_b);

    for (relay, ids) in [(&relay_a, ["n1", "n2"]), (&relay_b, ["n2", "n3"])] {
        for (i, id) in ids.iter().enumerate() {
            relay.send(RelayMessage::Event {
                subscription_id: sub_a.clone(),
                event: note(id, 100 + i as u64 * 10 + id.len() as u64),
            });
        }
        relay.send(RelayMessage::Eose {
            subscription_id: sub_a.clone(),
        });
    }

    let fetched = fetching.await.unwrap();
    let ids: Vec<&str> = fetched.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids.len(), 3);
    assert!(fetched.windows(2).all(|w| w[0].created_at >= w[1].created_at));

    assert_eq!(
        relay_a.next_message().await,
        ClientMessage::Close {
            subscription_id: sub_a.clone()
        }
    );
    assert_eq!(
        relay_b.next_message().await,
        ClientMessage::Close {
            subscription_id: sub_a
        }
    );
    assert!(pool.subscription_ids().is_empty());
}

#[tokio::test]
async fn test_fetch_does_not_wait_for_refused_relay() {
    let connector = MockConnector::new();
    let pool = pool_with(&connector);
    let a = pool.add_relay("wss://a.test").unwrap();
    let down = url("wss://down.test");
    connector.refuse(&down);
    pool.connect_relay(&a).await.unwrap();

    let fetching = {
        let pool = pool.clone();
        let relays = vec![a.clone(), down.clone()];
        tokio::spawn(async move {
            pool.fetch(vec![Filter::new()], &relays, Duration::from_secs(30))
                .await
        })
    };

    let relay_a = connector.relay(&a);
    let sub = req_id(relay_a.next_message().await);
    relay_a.send(RelayMessage::Event {
        subscription_id: sub.clone(),
        event: note("only", 1),
    });
    relay_a.send(RelayMessage::Eose {
        subscription_id: sub,
    });

    let fetched = timeout(Duration::from_secs(5), fetching)
        .await
        .expect("fetch waited for the refused relay")
        .unwrap();
    assert_eq!(fetched, vec![note("only", 1)]);
}

#[tokio::test]
async fn test_removing_last_pending_relay_completes_subscription() {
    let connector = MockConnector::new();
    let pool = pool_with(&connector);
    let mut events = pool.events();
    let a = pool.add_relay("wss://a.test").unwrap();
    let b = pool.add_relay("wss://b.test").unwrap();
    pool.connect_all().await;

    pool.subscribe_to("feed", vec![Filter::new()], &[a.clone(), b.clone()]);
    let relay_a = connector.relay(&a);
    relay_a.next_message().await;
    relay_a.send(RelayMessage::Eose {
        subscription_id: "feed".to_string(),
    });
    next_matching(&mut events, |e| matches!(e, PoolEvent::Eose { .. })).await;

    pool.remove_relay(&b);
    next_matching(&mut events, |e| matches!(e, PoolEvent::AllEose { .. })).await;
    assert_eq!(pool.relay_urls(), vec![a]);
}

#[tokio::test]
async fn test_unsubscribe_closes_everywhere() {
    let connector = MockConnector::new();
    let pool = pool_with(&connector);
    let a = pool.add_relay("wss://a.test").unwrap();
    let b = pool.add_relay("wss://b.test").unwrap();
    pool.connect_all().await;

    let id = pool.subscribe_all(vec![Filter::new().kinds(vec![1])]);
    assert_eq!(pool.subscription_ids(), vec![id.clone()]);
    for relay in [connector.relay(&a), connector.relay(&b)] {
        assert_eq!(req_id(relay.next_message().await), id);
    }

    pool.unsubscribe(&id);
    for relay in [connector.relay(&a), connector.relay(&b)] {
        assert_eq!(
            relay.next_message().await,
            ClientMessage::Close {
                subscription_id: id.clone()
            }
        );
    }
    assert!(pool.subscription_ids().is_empty());
}

#[tokio::test]
async fn test_publish_and_ok() {
    let connector = MockConnector::new();
    let pool = pool_with(&connector);
    let mut events = pool.events();
    let a = pool.add_relay("wss://a.test").unwrap();
    pool.connect_all().await;

    let event = note("pub", 1);
    pool.publish(&event);
    let relay = connector.relay(&a);
    assert_eq!(relay.next_message().await, ClientMessage::Event(event));

    relay.send(RelayMessage::Ok {
        event_id: "pub".to_string(),
        success: true,
        message: String::new(),
    });
    let ok = next_matching(&mut events, |e| matches!(e, PoolEvent::Ok { .. })).await;
    assert_eq!(
        ok,
        PoolEvent::Ok {
            relay_url: a,
            event_id: "pub".to_string(),
            success: true,
            message: String::new(),
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_maintenance_reconnects_wanted_relays_only() {
    let connector = MockConnector::new();
    let pool = pool_with(&connector);
    let mut events = pool.events();
    let a = pool.add_relay("wss://a.test").unwrap();
    let b = pool.add_relay("wss://b.test").unwrap();
    pool.connect_all().await;
    pool.start_maintenance();

    pool.subscribe_to("feed", vec![Filter::new()], &[a.clone()]);
    let relay_a = connector.relay(&a);
    let relay_b = connector.relay(&b);
    relay_a.next_message().await;

    // Relay a goes away on its own, b is closed by us
    relay_a.close(1001, "going away");
    next_matching(&mut events, |e| {
        matches!(e, PoolEvent::Disconnected { relay_url } if *relay_url == a)
    })
    .await;
    pool.relay(&b).unwrap().disconnect();

    tokio::time::advance(Duration::from_secs(6)).await;
    next_matching(&mut events, |e| {
        matches!(e, PoolEvent::Connected { relay_url } if *relay_url == a)
    })
    .await;
    assert_eq!(req_id(relay_a.next_message().await), "feed");

    tokio::time::advance(Duration::from_secs(30)).await;
    assert_eq!(relay_a.connects(), 2);
    assert_eq!(relay_b.connects(), 1);
    assert_eq!(
        pool.states().get(&b),
        Some(&ConnectionState::Disconnected)
    );
}

#[tokio::test]
async fn test_shutdown_forgets_everything() {
    let connector = MockConnector::new();
    let pool = pool_with(&connector);
    let a = pool.add_relay("wss://a.test").unwrap();
    pool.connect_all().await;
    pool.subscribe_to("feed", vec![Filter::new()], &[a.clone()]);

    pool.shutdown();
    connector.relay(&a).wait_closed().await;

    assert!(pool.relay_urls().is_empty());
    assert!(pool.subscription_ids().is_empty());
    assert_eq!(pool.connected_count(), 0);
}
