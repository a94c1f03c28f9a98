//! Integration tests for the consumer driving an in-memory broker
//!
//! Run with: cargo test -p threadworker --test consumer_test

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use threadworker::{
    BrokerError, Consumer, Handler, InMemoryBroker, MemoryMessage, Message, SubscriptionConfig,
    WorkerConfig, WorkerError,
};

use common::{noop, recording_exception_handler, worker_config};

/// When a handler run started, relative to the test start
#[derive(Debug, Clone)]
struct Run {
    body: String,
    started: Duration,
}

#[tokio::test]
async fn test_two_fast_messages_then_timeout() {
    let broker = Arc::new(InMemoryBroker::new());
    let m1 = broker.publish("orders", "M1");
    let m2 = broker.publish("orders", "M2");
    let m3 = broker.publish("orders", "M3");
    broker.close();

    let origin = Instant::now();
    let runs = Arc::new(Mutex::new(Vec::new()));
    let handler: Handler<MemoryMessage> = {
        let runs = Arc::clone(&runs);
        Arc::new(move |message| {
            let body = String::from_utf8_lossy(message.body()).to_string();
            runs.lock().push(Run {
                body: body.clone(),
                started: origin.elapsed(),
            });
            let work = if body == "M3" {
                Duration::from_secs(2)
            } else {
                Duration::from_millis(100)
            };
            std::thread::sleep(work);
            Ok(())
        })
    };

    let (on_error, reports) = recording_exception_handler();
    let config = worker_config(2).with_timeout(Duration::from_secs(1));
    let consumer =
        Consumer::new(Arc::clone(&broker), config, handler).with_exception_handler(on_error);

    consumer.start().await.unwrap();
    let finished = origin.elapsed();

    let runs = runs.lock().clone();
    assert_eq!(runs.len(), 3);
    let started = |body: &str| {
        runs.iter()
            .find(|r| r.body == body)
            .map(|r| r.started)
            .unwrap()
    };
    assert!(started("M1") < Duration::from_millis(80));
    assert!(started("M2") < Duration::from_millis(80));
    assert!(started("M3") >= Duration::from_millis(90));

    let reports = reports.lock();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].message_id, m3.id());
    assert!(reports[0].timed_out);
    let reported_at = reports[0].at.duration_since(origin);
    assert!(
        reported_at >= Duration::from_millis(1050),
        "reported at {:?}",
        reported_at
    );
    assert!(
        reported_at < Duration::from_millis(1600),
        "reported at {:?}",
        reported_at
    );

    assert!(
        finished < Duration::from_millis(1800),
        "finished at {:?}",
        finished
    );
    for message in [&m1, &m2, &m3] {
        assert_eq!(message.finish_count(), 1);
    }
    assert_eq!(broker.peak_in_flight(), 2);
}

#[tokio::test]
async fn test_concurrency_bound_through_broker() {
    let broker = Arc::new(InMemoryBroker::new());
    let messages: Vec<_> = (0..30)
        .map(|i| broker.publish("orders", format!("order-{}", i)))
        .collect();
    broker.close();

    let running = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let handler: Handler<MemoryMessage> = {
        let running = Arc::clone(&running);
        let max_seen = Arc::clone(&max_seen);
        Arc::new(move |_| {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            max_seen.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(10));
            running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        })
    };
    let consumer = Consumer::new(Arc::clone(&broker), worker_config(3), handler);

    consumer.start().await.unwrap();

    assert!(max_seen.load(Ordering::SeqCst) <= 3);
    assert!(broker.peak_in_flight() <= 3);
    assert!(consumer.coordinator().pool().peak_active() <= 3);
    assert_eq!(broker.delivered().len(), 30);
    assert!(messages.iter().all(|m| m.finish_count() == 1));
    assert_eq!(broker.in_flight(), 0);
}

#[tokio::test]
async fn test_unreachable_broker_is_fatal() {
    let broker = Arc::new(InMemoryBroker::new());
    broker.set_reachable(false);
    let consumer = Consumer::new(broker, worker_config(2), noop());

    let result = consumer.start().await;

    match result {
        Err(WorkerError::Subscription(BrokerError::Connection(reason))) => {
            assert!(reason.contains("unreachable"));
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test]
async fn test_invalid_topic_rejected() {
    let broker = Arc::new(InMemoryBroker::new());
    let config = WorkerConfig::new(SubscriptionConfig::new("orders/eu", "billing"));
    let consumer = Consumer::new(Arc::clone(&broker), config, noop());

    let err = consumer.start().await.unwrap_err();

    assert!(matches!(err, WorkerError::Config(_)));
    assert!(err.to_string().contains("invalid topic name"));
    assert!(broker.subscriptions().is_empty());
}

#[tokio::test]
async fn test_config_from_environment_lookup() {
    let vars = [
        ("NSQ_TOPIC", "orders"),
        ("NSQ_CHANNEL", "billing#ephemeral"),
        ("NSQ_LOOKUPD_HTTP_ADDRESSES", "http://lookupd-1:4161,http://lookupd-2:4161"),
        ("WORKER_CONCURRENCY", "2"),
        ("WORKER_HEARTBEAT_INTERVAL_MS", "1000"),
    ];
    let config = WorkerConfig::from_lookup(|key| {
        vars.iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.to_string())
    })
    .unwrap();

    let broker = Arc::new(InMemoryBroker::new());
    let message = broker.publish("orders", "order-1");
    broker.close();

    let consumer = Consumer::new(Arc::clone(&broker), config, noop());
    consumer.start().await.unwrap();

    let subscriptions = broker.subscriptions();
    let subscription = &subscriptions[0];
    assert_eq!(subscription.channel, "billing#ephemeral");
    assert_eq!(subscription.lookupd_http_addresses.len(), 2);
    assert_eq!(subscription.max_in_flight, 2);
    assert_eq!(
        consumer.coordinator().heartbeat_interval(),
        Duration::from_secs(1)
    );
    assert_eq!(message.finish_count(), 1);
}
