use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use super::backoff::{Backoff, RetryPolicy};
use super::gateway::{PublishFailure, PublishGateway, PublishStatus, QueuePolicy, log_failures};
use super::registry::{Listener, SubscriptionRegistry};
use super::supervisor::{ConnectStatus, ConnectionState};
use super::BrokerClient;
use crate::message::{Headers, Message};
use crate::transport::memory::RawCall;
use crate::transport::{Endpoint, MemoryBroker};
use crate::utils::error::ClientError;

const WAIT: Duration = Duration::from_secs(5);

fn endpoint() -> Endpoint {
    Endpoint::new("broker.test", 61610).with_credentials("aaa", "111")
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        init_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(100),
        factor: 2.0,
        jitter: 0.0,
        max_retries: None,
        reset_threshold: Duration::from_secs(60),
    }
}

fn client_for(broker: &MemoryBroker) -> BrokerClient {
    BrokerClient::builder(endpoint(), broker.clone())
        .retry_policy(fast_retry())
        .build()
}

fn recording_client(
    broker: &MemoryBroker,
    queue: QueuePolicy,
) -> (BrokerClient, Arc<Mutex<Vec<PublishFailure>>>) {
    let failures = Arc::new(Mutex::new(Vec::new()));
    let sink = failures.clone();
    let client = BrokerClient::builder(endpoint(), broker.clone())
        .retry_policy(fast_retry())
        .queue_policy(queue)
        .on_failure(move |f| sink.lock().unwrap().push(f))
        .build();
    (client, failures)
}

fn channel_listener() -> (Listener, mpsc::UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let listener = Listener::new(move |m: &Message| {
        let _ = tx.send(m.clone());
    });
    (listener, rx)
}

fn noop_listener() -> Listener {
    Listener::new(|_| {})
}

async fn wait_for_state(client: &BrokerClient, target: ConnectionState) {
    let mut rx = client.state_changes();
    let reached = timeout(WAIT, rx.wait_for(|s| *s == target)).await;
    assert!(
        matches!(reached, Ok(Ok(_))),
        "state {:?} not reached, still {:?}",
        target,
        client.state()
    );
}

/// Takes the broker down and waits until the client noticed.
async fn knock_out(broker: &MemoryBroker, client: &BrokerClient) {
    broker.set_available(false);
    broker.drop_connections("broker restarted");
    wait_for_state(client, ConnectionState::Reconnecting).await;
}

async fn bring_back(broker: &MemoryBroker, client: &BrokerClient) {
    broker.set_available(true);
    timeout(WAIT, client.wait_connected())
        .await
        .expect("reconnect timed out")
        .expect("reconnect failed");
}

#[test]
fn test_backoff_delays_double_and_cap() {
    let policy = RetryPolicy {
        init_delay: Duration::from_millis(100),
        max_delay: Duration::from_millis(1000),
        jitter: 0.0,
        ..RetryPolicy::default()
    };
    let mut backoff = Backoff::new(policy);
    let delays: Vec<u64> = (0..6)
        .map(|_| backoff.next_delay().unwrap().as_millis() as u64)
        .collect();
    assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);

    backoff.reset();
    assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
}

#[test]
fn test_backoff_budget_exhausts() {
    let mut backoff = Backoff::new(RetryPolicy {
        max_retries: Some(2),
        jitter: 0.0,
        ..RetryPolicy::default()
    });
    assert!(backoff.next_delay().is_some());
    assert!(backoff.next_delay().is_some());
    assert_eq!(backoff.next_delay(), None);
    assert_eq!(backoff.retries(), 2);
}

#[test]
fn test_backoff_jitter_stays_below_base() {
    let policy = RetryPolicy {
        init_delay: Duration::from_millis(1000),
        jitter: 0.5,
        ..RetryPolicy::default()
    };
    for _ in 0..50 {
        let mut backoff = Backoff::new(policy.clone());
        let delay = backoff.next_delay().unwrap();
        assert!(delay <= Duration::from_millis(1000));
        assert!(delay > Duration::from_millis(500));
    }
}

#[test]
fn test_backoff_ignores_non_finite_jitter() {
    for jitter in [f64::NAN, f64::INFINITY] {
        let mut backoff = Backoff::new(RetryPolicy {
            jitter,
            ..RetryPolicy::default()
        });
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
    }
}

#[tokio::test(start_paused = true)]
async fn test_connect_reaches_connected() {
    let broker = MemoryBroker::new();
    let client = client_for(&broker);
    assert_eq!(client.state(), ConnectionState::Disconnected);

    assert_eq!(client.connect().await, Ok(ConnectStatus::Connected));
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(broker.open_connections(), 1);

    // already supervising: no second connection
    assert_eq!(client.connect().await, Ok(ConnectStatus::Connected));
    assert_eq!(broker.connect_attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_connect_retries_in_background() {
    let broker = MemoryBroker::new();
    broker.fail_next_connects(3);
    let client = client_for(&broker);

    assert_eq!(client.connect().await, Ok(ConnectStatus::Retrying));
    timeout(WAIT, client.wait_connected()).await.unwrap().unwrap();
    assert_eq!(broker.connect_attempts(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_finite_budget_ends_disconnected() {
    let broker = MemoryBroker::new();
    broker.set_available(false);
    let client = BrokerClient::builder(endpoint(), broker.clone())
        .retry_policy(RetryPolicy {
            max_retries: Some(2),
            ..fast_retry()
        })
        .build();

    assert_eq!(client.connect().await, Ok(ConnectStatus::Retrying));
    let result = timeout(WAIT, client.wait_connected()).await.unwrap();
    assert!(matches!(result, Err(ClientError::Connect(_))));
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(broker.connect_attempts(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_zero_retries_fails_connect() {
    let broker = MemoryBroker::new();
    broker.set_available(false);
    let client = BrokerClient::builder(endpoint(), broker.clone())
        .retry_policy(RetryPolicy {
            max_retries: Some(0),
            ..fast_retry()
        })
        .build();

    assert!(matches!(client.connect().await, Err(ClientError::Connect(_))));

    // supervision can be started again once the broker is back
    broker.set_available(true);
    assert_eq!(client.connect().await, Ok(ConnectStatus::Connected));
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_while_disconnected_is_replayed_once() {
    let broker = MemoryBroker::new();
    let client = client_for(&broker);

    let token = client.subscribe("prices", noop_listener()).await.unwrap();
    assert!(broker.subscribes().is_empty());

    client.connect().await.unwrap();
    assert_eq!(broker.subscribes(), vec![("prices".to_string(), token)]);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_replays_in_registration_order() {
    let broker = MemoryBroker::new();
    let client = client_for(&broker);
    client.connect().await.unwrap();

    let a = client.subscribe("a", noop_listener()).await.unwrap();
    let b = client.subscribe("b", noop_listener()).await.unwrap();
    knock_out(&broker, &client).await;
    let c = client.subscribe("c", noop_listener()).await.unwrap();

    broker.clear_calls();
    bring_back(&broker, &client).await;

    assert_eq!(
        broker.subscribes(),
        vec![
            ("a".to_string(), a),
            ("b".to_string(), b),
            ("c".to_string(), c),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_subscribe_is_idempotent() {
    let broker = MemoryBroker::new();
    let client = client_for(&broker);
    client.connect().await.unwrap();

    let listener = noop_listener();
    let first = client.subscribe("prices", listener.clone()).await.unwrap();
    let second = client.subscribe("prices", listener.clone()).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(broker.subscribes().len(), 1);

    let other = client.subscribe("prices", noop_listener()).await.unwrap();
    assert_ne!(first, other);
    let other_topic = client.subscribe("volumes", listener).await.unwrap();
    assert_ne!(first, other_topic);
    assert_eq!(broker.subscribes().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_unknown_token() {
    let broker = MemoryBroker::new();
    let client = client_for(&broker);
    client.connect().await.unwrap();
    client.subscribe("prices", noop_listener()).await.unwrap();
    let before = broker.calls();

    let unknown = super::SubscriptionToken::new();
    assert_eq!(
        client.unsubscribe(unknown).await,
        Err(ClientError::NotFound(unknown))
    );
    assert_eq!(broker.calls(), before);
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_connected_and_disconnected() {
    let broker = MemoryBroker::new();
    let client = client_for(&broker);
    client.connect().await.unwrap();

    let live = client.subscribe("live", noop_listener()).await.unwrap();
    client.unsubscribe(live).await.unwrap();
    assert!(broker.calls().contains(&RawCall::Unsubscribe { token: live }));

    let parked = client.subscribe("parked", noop_listener()).await.unwrap();
    knock_out(&broker, &client).await;
    client.unsubscribe(parked).await.unwrap();
    assert!(!broker.calls().contains(&RawCall::Unsubscribe { token: parked }));

    // removed entries are not replayed
    broker.clear_calls();
    bring_back(&broker, &client).await;
    assert!(broker.subscribes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_messages_reach_listener_in_order() {
    let broker = MemoryBroker::new();
    let client = client_for(&broker);
    client.connect().await.unwrap();

    let (listener, mut rx) = channel_listener();
    client.subscribe("prices", listener).await.unwrap();

    for i in 0..3 {
        broker.inject("prices", Message::text(format!("tick {i}")));
    }
    for i in 0..3 {
        let received = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(received, Message::text(format!("tick {i}")));
    }
}

#[tokio::test(start_paused = true)]
async fn test_panicking_listener_does_not_stop_delivery() {
    let broker = MemoryBroker::new();
    let client = client_for(&broker);
    client.connect().await.unwrap();

    client
        .subscribe("boom", Listener::new(|_| panic!("listener failure")))
        .await
        .unwrap();
    let (listener, mut rx) = channel_listener();
    client.subscribe("ok", listener).await.unwrap();

    broker.inject("boom", Message::text("1"));
    broker.inject("ok", Message::text("2"));

    let received = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(received, Message::text("2"));
    assert_eq!(client.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_publish_connected_is_delivered() {
    let broker = MemoryBroker::new();
    let client = client_for(&broker);
    client.connect().await.unwrap();

    let mut headers = Headers::new();
    headers.insert("amq-msg-type".to_string(), "text".to_string());
    let status = client
        .publish("t1", Message::text("m1").with_header("type", "textMessage"), headers)
        .await;
    assert_eq!(status, Ok(PublishStatus::Delivered));

    let sent = broker.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "t1");
    assert_eq!(sent[0].1.headers["type"], "textMessage");
    assert_eq!(sent[0].1.headers["amq-msg-type"], "text");
}

#[tokio::test(start_paused = true)]
async fn test_publish_send_failure_is_surfaced() {
    let broker = MemoryBroker::new();
    let client = client_for(&broker);
    client.connect().await.unwrap();
    broker.set_fail_sends(true);

    let result = client.publish("t1", Message::text("m1"), Headers::new()).await;
    assert!(matches!(result, Err(ClientError::Send { topic, .. }) if topic == "t1"));
    assert_eq!(client.queued_len().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_queue_full_scenario() {
    let broker = MemoryBroker::new();
    let (client, failures) = recording_client(
        &broker,
        QueuePolicy {
            max_entries: 2,
            max_age: Duration::from_secs(300),
        },
    );
    client.connect().await.unwrap();
    knock_out(&broker, &client).await;

    let m1 = Message::text("m1");
    let m2 = Message::text("m2");
    assert_eq!(
        client.publish("t1", m1.clone(), Headers::new()).await,
        Ok(PublishStatus::Queued)
    );
    assert_eq!(
        client.publish("t1", m2.clone(), Headers::new()).await,
        Ok(PublishStatus::Queued)
    );
    assert_eq!(
        client.publish("t1", Message::text("m3"), Headers::new()).await,
        Err(ClientError::QueueFull { capacity: 2 })
    );

    bring_back(&broker, &client).await;
    assert_eq!(
        broker.sent(),
        vec![("t1".to_string(), m1), ("t1".to_string(), m2)]
    );
    assert!(failures.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_replay_precedes_flush() {
    let broker = MemoryBroker::new();
    let client = client_for(&broker);

    let (listener, mut rx) = channel_listener();
    let token = client.subscribe("t1", listener).await.unwrap();
    assert_eq!(
        client.publish("t1", Message::text("early"), Headers::new()).await,
        Ok(PublishStatus::Queued)
    );

    client.connect().await.unwrap();

    let calls = broker.calls();
    let subscribed = calls
        .iter()
        .position(|c| *c == RawCall::Subscribe { topic: "t1".to_string(), token })
        .expect("subscription replayed");
    let sent = calls
        .iter()
        .position(|c| matches!(c, RawCall::Send { .. }))
        .expect("queued publish flushed");
    assert!(subscribed < sent);

    // subscribed first, so the flushed message comes back to us
    let received = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(received, Message::text("early"));
}

#[tokio::test(start_paused = true)]
async fn test_expired_entries_are_reported_once() {
    let broker = MemoryBroker::new();
    let (client, failures) = recording_client(
        &broker,
        QueuePolicy {
            max_entries: 10,
            max_age: Duration::from_secs(1),
        },
    );

    client.publish("t1", Message::text("stale"), Headers::new()).await.unwrap();
    tokio::time::advance(Duration::from_secs(2)).await;
    client.publish("t1", Message::text("fresh"), Headers::new()).await.unwrap();

    client.connect().await.unwrap();
    assert_eq!(
        broker.sent(),
        vec![("t1".to_string(), Message::text("fresh"))]
    );

    let failures = failures.lock().unwrap();
    assert_eq!(failures.len(), 1);
    assert!(matches!(
        &failures[0],
        PublishFailure::Expired { topic, message, .. }
            if topic == "t1" && *message == Message::text("stale")
    ));
}

#[tokio::test(start_paused = true)]
async fn test_flush_failure_requeues_and_retries() {
    let broker = MemoryBroker::new();
    let (client, failures) = recording_client(&broker, QueuePolicy::default());

    let m1 = Message::text("m1");
    let m2 = Message::text("m2");
    client.publish("t1", m1.clone(), Headers::new()).await.unwrap();
    client.publish("t1", m2.clone(), Headers::new()).await.unwrap();

    broker.set_fail_sends(true);
    assert_eq!(client.connect().await, Ok(ConnectStatus::Retrying));

    timeout(WAIT, async {
        while failures.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(matches!(
        &failures.lock().unwrap()[0],
        PublishFailure::FlushInterrupted { topic, remaining: 2, .. } if topic == "t1"
    ));
    assert_eq!(client.queued_len().await, 2);

    broker.set_fail_sends(false);
    timeout(WAIT, client.wait_connected()).await.unwrap().unwrap();
    assert_eq!(
        broker.sent(),
        vec![("t1".to_string(), m1), ("t1".to_string(), m2)]
    );
    assert_eq!(client.queued_len().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_list_destinations() {
    let broker = MemoryBroker::new();
    let client = client_for(&broker);
    assert_eq!(
        client.list_destinations().await,
        Err(ClientError::NotConnected)
    );

    client.connect().await.unwrap();
    client.publish("b", Message::text("x"), Headers::new()).await.unwrap();
    client.subscribe("a", noop_listener()).await.unwrap();
    assert_eq!(
        client.list_destinations().await,
        Ok(vec!["a".to_string(), "b".to_string()])
    );

    // reads are not queued
    knock_out(&broker, &client).await;
    assert_eq!(
        client.list_destinations().await,
        Err(ClientError::NotConnected)
    );
}

#[tokio::test(start_paused = true)]
async fn test_close_unblocks_pending_connect() {
    let broker = MemoryBroker::new();
    broker.set_hang_connects(true);
    let client = Arc::new(client_for(&broker));

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.connect().await })
    };
    while broker.connect_attempts() == 0 {
        tokio::task::yield_now().await;
    }

    client.close().await;
    let result = timeout(Duration::from_secs(1), pending)
        .await
        .expect("connect still blocked after close")
        .unwrap();
    assert_eq!(result, Err(ClientError::Closed));
}

#[tokio::test(start_paused = true)]
async fn test_close_is_idempotent_and_terminal() {
    let broker = MemoryBroker::new();
    let client = client_for(&broker);
    client.connect().await.unwrap();

    client.close().await;
    client.close().await;
    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(broker.open_connections(), 0);

    assert_eq!(client.connect().await, Err(ClientError::Closed));
    assert_eq!(
        client.subscribe("t1", noop_listener()).await,
        Err(ClientError::Closed)
    );
    assert_eq!(
        client.publish("t1", Message::text("x"), Headers::new()).await,
        Err(ClientError::Closed)
    );
    assert_eq!(client.wait_connected().await, Err(ClientError::Closed));

    // no reconnection after close
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(broker.connect_attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_close_reports_queued_publishes() {
    let broker = MemoryBroker::new();
    let (client, failures) = recording_client(&broker, QueuePolicy::default());

    client.publish("t1", Message::text("m1"), Headers::new()).await.unwrap();
    client.publish("t2", Message::text("m2"), Headers::new()).await.unwrap();
    client.close().await;

    let failures = failures.lock().unwrap();
    let topics: Vec<&str> = failures
        .iter()
        .map(|f| match f {
            PublishFailure::Discarded { topic, .. } => topic.as_str(),
            other => panic!("unexpected failure {other:?}"),
        })
        .collect();
    assert_eq!(topics, vec!["t1", "t2"]);
}

/// Drops the live connection and measures how long the client stays away.
async fn time_to_reconnect(broker: &MemoryBroker, client: &BrokerClient) -> Duration {
    let dropped_at = tokio::time::Instant::now();
    broker.drop_connections("broker restarted");
    wait_for_state(client, ConnectionState::Reconnecting).await;
    timeout(WAIT, client.wait_connected()).await.unwrap().unwrap();
    dropped_at.elapsed()
}

/// Connected after two refused attempts, so the retry counter sits at 2.
async fn client_after_two_retries(broker: &MemoryBroker) -> BrokerClient {
    let client = BrokerClient::builder(endpoint(), broker.clone())
        .retry_policy(RetryPolicy {
            init_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            factor: 2.0,
            jitter: 0.0,
            max_retries: None,
            reset_threshold: Duration::from_secs(1),
        })
        .build();
    broker.fail_next_connects(2);
    assert_eq!(client.connect().await, Ok(ConnectStatus::Retrying));
    timeout(WAIT, client.wait_connected()).await.unwrap().unwrap();
    client
}

#[tokio::test(start_paused = true)]
async fn test_short_lived_connection_keeps_backoff_growing() {
    let broker = MemoryBroker::new();
    let client = client_after_two_retries(&broker).await;

    let first = time_to_reconnect(&broker, &client).await;
    assert!(first >= Duration::from_millis(400) && first < Duration::from_millis(800));

    let second = time_to_reconnect(&broker, &client).await;
    assert!(second >= Duration::from_millis(800) && second < Duration::from_millis(1600));
}

#[tokio::test(start_paused = true)]
async fn test_long_lived_connection_resets_backoff() {
    let broker = MemoryBroker::new();
    let client = client_after_two_retries(&broker).await;

    tokio::time::sleep(Duration::from_secs(2)).await;

    let delay = time_to_reconnect(&broker, &client).await;
    assert!(delay >= Duration::from_millis(100) && delay < Duration::from_millis(200));
}

#[tokio::test(start_paused = true)]
async fn test_close_during_flush_reports_in_flight_publish() {
    let broker = MemoryBroker::new();
    let (client, failures) = recording_client(&broker, QueuePolicy::default());
    let m1 = Message::text("m1");
    let m2 = Message::text("m2");
    client.publish("t1", m1.clone(), Headers::new()).await.unwrap();
    client.publish("t1", m2.clone(), Headers::new()).await.unwrap();

    broker.set_send_delay(Some(Duration::from_secs(10)));
    let client = Arc::new(client);
    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.connect().await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    client.close().await;

    assert_eq!(pending.await.unwrap(), Err(ClientError::Closed));
    assert!(broker.sent().is_empty());
    let discarded: Vec<Message> = failures
        .lock()
        .unwrap()
        .iter()
        .map(|f| match f {
            PublishFailure::Discarded { message, .. } => message.clone(),
            other => panic!("unexpected failure {other:?}"),
        })
        .collect();
    assert_eq!(discarded, vec![m1, m2]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_does_not_wait_out_a_slow_listener() {
    let broker = MemoryBroker::new();
    let client = BrokerClient::builder(endpoint(), broker.clone())
        .retry_policy(fast_retry())
        .stop_wait_timeout(Some(Duration::from_millis(200)))
        .build();
    client.connect().await.unwrap();

    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    client
        .subscribe(
            "slow",
            Listener::new(move |_| {
                let _ = started_tx.send(());
                std::thread::sleep(Duration::from_secs(3));
            }),
        )
        .await
        .unwrap();
    broker.inject("slow", Message::text("x"));
    timeout(WAIT, started_rx.recv()).await.unwrap().unwrap();

    let closing = std::time::Instant::now();
    client.close().await;
    assert!(closing.elapsed() < Duration::from_secs(2));
    assert_eq!(client.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_gateway_refuses_publish_after_discard() {
    let gateway = PublishGateway::new(QueuePolicy::default(), log_failures());
    gateway.discard_all().await;

    assert_eq!(
        gateway.publish("t1", Message::text("late"), Headers::new()).await,
        Err(ClientError::Closed)
    );
    assert_eq!(gateway.queued_len().await, 0);
}

#[tokio::test]
async fn test_registry_refuses_subscribe_after_clear() {
    let registry = SubscriptionRegistry::new();
    let token = registry.subscribe("t1", noop_listener()).await.unwrap();
    registry.clear().await;

    assert_eq!(
        registry.subscribe("t1", noop_listener()).await,
        Err(ClientError::Closed)
    );
    assert_eq!(registry.unsubscribe(token).await, Err(ClientError::Closed));
    assert!(registry.is_empty().await);
}
