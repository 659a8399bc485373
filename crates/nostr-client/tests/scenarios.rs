//! End-to-end scenarios against in-process mock relays.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use mock_relay::{MockRelay, MockRelayConfig};
use nostr_client::{
    ClientError, ConnectionState, EventBus, Relay, RelayPool, Subscription, SubscriptionState,
    generate_subscription_id,
};
use nostr_core::event::{Event, EventTemplate, KIND_CLIENT_AUTH, Tag};
use nostr_core::keys::Keys;
use nostr_core::Filter;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

/// RUST_LOG-driven logging for debugging failing scenarios.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn fake_event(id: &str, pubkey: &str, kind: u64, content: &str) -> Event {
    Event {
        id: id.to_string(),
        pubkey: pubkey.to_string(),
        created_at: 1700000000,
        kind,
        tags: vec![],
        content: content.to_string(),
        sig: "0".repeat(128),
    }
}

fn signed_event(keys: &Keys, kind: u64, content: &str) -> Event {
    EventTemplate {
        created_at: 1700000000,
        kind,
        tags: vec![],
        content: content.to_string(),
    }
    .sign(keys)
    .expect("signing in tests")
}

async fn connected_relay(mock: &MockRelay) -> Arc<Relay> {
    init_tracing();
    let relay = Arc::new(Relay::new(&mock.url()).unwrap());
    relay.connect().await.unwrap();
    relay
}

#[tokio::test]
async fn subscribe_receives_seeded_events_then_eose() {
    let mock = MockRelay::start_default().await.unwrap();
    mock.seed_event(fake_event(&"a".repeat(64), &"1".repeat(64), 1, "First"));
    mock.seed_event(fake_event(&"b".repeat(64), &"1".repeat(64), 1, "Second"));

    let relay = connected_relay(&mock).await;
    let sub = Arc::new(Subscription::new(
        generate_subscription_id(),
        vec![Filter::new().kinds([1])],
        Arc::downgrade(&relay),
    ));
    let (tx, mut rx) = mpsc::unbounded_channel::<Option<String>>();
    let event_tx = tx.clone();
    sub.on_event(Box::new(move |event| {
        let _ = event_tx.send(Some(event.id.clone()));
    }));
    sub.on_eose(Box::new(move || {
        let _ = tx.send(None);
    }));
    relay.attach_subscription(Arc::clone(&sub)).await.unwrap();

    let mut ids = Vec::new();
    loop {
        match timeout(WAIT, rx.recv()).await.expect("eose never arrived") {
            Some(Some(id)) => ids.push(id),
            Some(None) => break,
            None => panic!("channel closed early"),
        }
    }
    assert_eq!(ids, vec!["a".repeat(64), "b".repeat(64)]);
    assert_eq!(sub.event_count(), 2);
    assert_eq!(sub.state(), SubscriptionState::EoseReceived);
    assert!(sub.time_to_first_event().is_some());

    relay.disconnect().await.unwrap();
}

#[tokio::test]
async fn publish_is_captured_and_confirmed() {
    let mock = MockRelay::start_default().await.unwrap();
    let relay = connected_relay(&mock).await;

    let event = fake_event(&"c".repeat(64), &"2".repeat(64), 1, "hello relay");
    let confirmation = relay.publish(&event).await.unwrap();
    assert_eq!(confirmation.event_id, event.id);
    assert!(confirmation.accepted);

    assert_eq!(mock.published_count(), 1);
    assert_eq!(mock.published_events()[0], event);
    let captured = mock.await_publish(WAIT).await.unwrap();
    assert_eq!(captured.id, event.id);

    relay.disconnect().await.unwrap();
}

#[tokio::test]
async fn query_filters_by_author_and_kind() {
    let mock = MockRelay::start_default().await.unwrap();
    mock.seed_event(fake_event(&"d".repeat(64), &"2".repeat(64), 0, "profile"));
    mock.seed_event(fake_event(&"e".repeat(64), &"1".repeat(64), 1, "note one"));
    mock.seed_event(fake_event(&"f".repeat(64), &"1".repeat(64), 1, "note two"));

    let relay = connected_relay(&mock).await;
    let events = relay
        .query_sync(vec![Filter::new().authors(["2222"]).kinds([0])])
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, 0);
    assert_eq!(events[0].pubkey, "2".repeat(64));

    relay.disconnect().await.unwrap();
}

#[tokio::test]
async fn signature_validation_rejects_bogus_sig() {
    let mock = MockRelay::start(MockRelayConfig {
        validate_signatures: true,
        ..MockRelayConfig::default()
    })
    .await
    .unwrap();
    let relay = connected_relay(&mock).await;

    let bogus = fake_event(&"9".repeat(64), &"8".repeat(64), 1, "forged");
    let confirmation = relay.publish(&bogus).await.unwrap();
    assert!(!confirmation.accepted);
    assert!(confirmation.message.starts_with("invalid: signature"));
    assert_eq!(mock.published_count(), 0);

    let keys = Keys::generate();
    let genuine = signed_event(&keys, 1, "properly signed");
    let confirmation = relay.publish(&genuine).await.unwrap();
    assert!(confirmation.accepted);
    assert_eq!(mock.published_count(), 1);

    relay.disconnect().await.unwrap();
}

#[tokio::test]
async fn pool_query_deduplicates_across_relays() {
    let mock_a = MockRelay::start_default().await.unwrap();
    let mock_b = MockRelay::start_default().await.unwrap();
    let shared = fake_event(&"ab".repeat(32), &"1".repeat(64), 1, "on both");
    mock_a.seed_event(shared.clone());
    mock_b.seed_event(shared.clone());
    // One extra event only relay B has.
    mock_b.seed_event(fake_event(&"cd".repeat(32), &"1".repeat(64), 1, "only b"));

    let pool = RelayPool::new();
    pool.add_relay(&mock_a.url()).await.unwrap();
    pool.add_relay(&mock_b.url()).await.unwrap();
    pool.connect_all().await.unwrap();

    let events = pool
        .query(vec![Filter::new().ids(["abab"])])
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].id, shared.id);

    let all = pool.query(vec![Filter::new().kinds([1])]).await.unwrap();
    assert_eq!(all.len(), 2);

    pool.disconnect_all().await;
}

#[tokio::test]
async fn bus_wildcard_routes_matching_topics_only() {
    let bus = EventBus::new();
    let hits = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&hits);
    bus.subscribe("event::kind::*", move |topic, _payload| {
        sink.lock().unwrap().push(topic.to_string());
    });

    bus.emit("event::kind::1", "a");
    bus.emit("event::kind::7", "b");
    bus.emit("event::author::abc", "c");

    let hits = hits.lock().unwrap();
    assert_eq!(*hits, vec!["event::kind::1", "event::kind::7"]);
}

#[tokio::test]
async fn nip11_served_on_websocket_port() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mock = MockRelay::start_default().await.unwrap();
    let mut stream = tokio::net::TcpStream::connect(mock.local_addr())
        .await
        .unwrap();
    let request = format!(
        "GET / HTTP/1.1\r\nHost: {}\r\nAccept: application/nostr+json\r\nConnection: close\r\n\r\n",
        mock.local_addr()
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    timeout(WAIT, stream.read_to_string(&mut response))
        .await
        .expect("no NIP-11 response")
        .unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.contains("application/nostr+json"));
    assert!(response.contains("MockRelay"));

    // The same port still accepts WebSocket clients afterwards.
    let relay = connected_relay(&mock).await;
    assert!(relay.is_connected().await);
    relay.disconnect().await.unwrap();
}

#[tokio::test]
async fn publish_times_out_on_slow_relay() {
    let mock = MockRelay::start(MockRelayConfig {
        response_delay: Some(Duration::from_millis(500)),
        ..MockRelayConfig::default()
    })
    .await
    .unwrap();
    let relay = connected_relay(&mock).await;

    let event = fake_event(&"1".repeat(64), &"2".repeat(64), 1, "slow");
    let result = relay
        .publish_with_timeout(&event, Duration::from_millis(50))
        .await;
    assert!(matches!(result, Err(ClientError::Timeout(_))));

    relay.disconnect().await.unwrap();
}

#[tokio::test]
async fn pending_publish_cancelled_on_disconnect() {
    let mock = MockRelay::start(MockRelayConfig {
        response_delay: Some(Duration::from_secs(5)),
        ..MockRelayConfig::default()
    })
    .await
    .unwrap();
    let relay = connected_relay(&mock).await;

    let publisher = Arc::clone(&relay);
    let pending = tokio::spawn(async move {
        let event = fake_event(&"3".repeat(64), &"4".repeat(64), 1, "doomed");
        publisher.publish_with_timeout(&event, WAIT).await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    relay.disconnect().await.unwrap();

    let result = timeout(WAIT, pending).await.unwrap().unwrap();
    assert!(matches!(result, Err(ClientError::Cancelled(_))));
    assert_eq!(relay.state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn auth_challenge_is_answered_by_installed_signer() {
    let mock = MockRelay::start(MockRelayConfig {
        auth_challenge: Some("challenge-xyz".to_string()),
        ..MockRelayConfig::default()
    })
    .await
    .unwrap();

    let keys = Arc::new(Keys::generate());
    let relay = Relay::new(&mock.url()).unwrap();
    let signer_keys = Arc::clone(&keys);
    relay.set_auth_handler(Arc::new(move |template| {
        template
            .sign(&signer_keys)
            .map_err(nostr_client::ClientError::from)
    }));
    relay.connect().await.unwrap();

    let auth = mock.await_auth_response(WAIT).await.expect("no AUTH reply");
    assert_eq!(auth.kind, KIND_CLIENT_AUTH);
    assert_eq!(auth.pubkey, keys.public_key_hex());
    assert!(auth.verify().unwrap());
    let challenge_tag = auth
        .tags
        .iter()
        .find(|t| t.key() == Some("challenge"))
        .and_then(Tag::value);
    assert_eq!(challenge_tag, Some("challenge-xyz"));
    assert!(auth.tag_value("relay").unwrap().starts_with("ws://"));

    relay.disconnect().await.unwrap();
}

#[tokio::test]
async fn fan_in_subscription_sees_all_relays_and_live_publishes() {
    let mock_a = MockRelay::start_default().await.unwrap();
    let mock_b = MockRelay::start_default().await.unwrap();
    mock_a.seed_event(fake_event(&"a1".repeat(32), &"1".repeat(64), 1, "stored a"));
    mock_b.seed_event(fake_event(&"b1".repeat(32), &"1".repeat(64), 1, "stored b"));

    let pool = RelayPool::new();
    pool.add_relay(&mock_a.url()).await.unwrap();
    pool.add_relay(&mock_b.url()).await.unwrap();
    pool.connect_all().await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel::<(String, String)>();
    let eose_seen = Arc::new(Mutex::new(0usize));
    let eose_counter = Arc::clone(&eose_seen);
    let multi = pool
        .subscribe_multi(
            vec![Filter::new().kinds([1])],
            Arc::new(move |url, event| {
                let _ = tx.send((url.to_string(), event.id.clone()));
            }),
            Arc::new(move |_url| {
                *eose_counter.lock().unwrap() += 1;
            }),
        )
        .await
        .unwrap();
    assert_eq!(multi.relay_count(), 2);

    let mut stored = Vec::new();
    for _ in 0..2 {
        let (_, id) = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        stored.push(id);
    }
    stored.sort();
    assert_eq!(stored, vec!["a1".repeat(32), "b1".repeat(32)]);

    // A publish on relay A reaches the live subscription.
    let direct = connected_relay(&mock_a).await;
    let live = fake_event(&"c1".repeat(32), &"2".repeat(64), 1, "live");
    direct.publish(&live).await.unwrap();
    let (url, id) = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(id, live.id);
    assert!(url.contains(&mock_a.local_addr().port().to_string()));

    assert_eq!(*eose_seen.lock().unwrap(), 2);

    multi.close().await;
    assert_eq!(multi.relay_count(), 0);
    direct.disconnect().await.unwrap();
    pool.disconnect_all().await;
}

#[tokio::test]
async fn limit_zero_gets_immediate_eose_then_live_events() {
    let mock = MockRelay::start_default().await.unwrap();
    mock.seed_event(fake_event(&"a".repeat(64), &"1".repeat(64), 1, "stored"));

    let relay = connected_relay(&mock).await;
    let sub = Arc::new(Subscription::new(
        generate_subscription_id(),
        vec![Filter::new().kinds([1]).limit(0)],
        Arc::downgrade(&relay),
    ));
    let (tx, mut rx) = mpsc::unbounded_channel::<Option<String>>();
    let event_tx = tx.clone();
    sub.on_event(Box::new(move |event| {
        let _ = event_tx.send(Some(event.id.clone()));
    }));
    sub.on_eose(Box::new(move || {
        let _ = tx.send(None);
    }));
    relay.attach_subscription(Arc::clone(&sub)).await.unwrap();

    // EOSE arrives first: the stored event is withheld entirely.
    let first = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(first, None);
    assert_eq!(sub.event_count(), 0);
    assert_eq!(sub.state(), SubscriptionState::EoseReceived);

    // The subscription stays live for publishes after the EOSE.
    let publisher = connected_relay(&mock).await;
    let live = fake_event(&"b".repeat(64), &"2".repeat(64), 1, "live");
    publisher.publish(&live).await.unwrap();
    let next = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(next, Some(live.id));
    assert_eq!(sub.event_count(), 1);

    publisher.disconnect().await.unwrap();
    relay.disconnect().await.unwrap();
}

#[tokio::test]
async fn query_returns_partial_results_without_eose() {
    let mock = MockRelay::start(MockRelayConfig {
        auto_eose: false,
        ..MockRelayConfig::default()
    })
    .await
    .unwrap();
    mock.seed_event(fake_event(&"5".repeat(64), &"1".repeat(64), 1, "stranded"));

    let relay = connected_relay(&mock).await;
    let events = relay
        .query_with_timeout(vec![Filter::new().kinds([1])], Duration::from_millis(300))
        .await
        .unwrap();
    assert_eq!(events.len(), 1);

    relay.disconnect().await.unwrap();
}

#[tokio::test]
async fn per_req_cap_limits_results() {
    let mock = MockRelay::start(MockRelayConfig {
        max_events_per_req: Some(2),
        ..MockRelayConfig::default()
    })
    .await
    .unwrap();
    for i in 0..5 {
        mock.seed_event(fake_event(
            &format!("{i}").repeat(64),
            &"1".repeat(64),
            1,
            "capped",
        ));
    }

    let relay = connected_relay(&mock).await;
    let events = relay
        .query_sync(vec![Filter::new().kinds([1])])
        .await
        .unwrap();
    assert_eq!(events.len(), 2);

    // A filter limit below the cap wins.
    let events = relay
        .query_sync(vec![Filter::new().kinds([1]).limit(1)])
        .await
        .unwrap();
    assert_eq!(events.len(), 1);

    relay.disconnect().await.unwrap();
}
