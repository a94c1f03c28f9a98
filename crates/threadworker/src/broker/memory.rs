//! In-memory implementation of Broker for testing

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Broker, BrokerError, DeliveryCallback, Message, SubscriptionConfig};

/// A message held by the in-memory broker
///
/// Records every `touch()` and `finish()` call so tests can assert on them.
/// `finish()` is not guarded: a second call is counted, not ignored.
#[derive(Debug)]
pub struct MemoryMessage {
    id: String,
    topic: String,
    body: Vec<u8>,
    attempts: u16,
    timestamp: DateTime<Utc>,
    async_enabled: AtomicBool,
    touches: AtomicUsize,
    finishes: AtomicUsize,
    responded: watch::Sender<bool>,
}

impl MemoryMessage {
    /// Create a message for a topic
    pub fn new(topic: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        let (responded, _) = watch::channel(false);
        Self {
            id: Uuid::now_v7().simple().to_string(),
            topic: topic.into(),
            body: body.into(),
            attempts: 1,
            timestamp: Utc::now(),
            async_enabled: AtomicBool::new(false),
            touches: AtomicUsize::new(0),
            finishes: AtomicUsize::new(0),
            responded,
        }
    }

    /// Topic the message was published to
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Message payload
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Delivery attempt number (1-based)
    pub fn attempts(&self) -> u16 {
        self.attempts
    }

    /// When the message was published
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Whether `enable_async()` was called
    pub fn is_async(&self) -> bool {
        self.async_enabled.load(Ordering::SeqCst)
    }

    /// Number of `touch()` calls
    pub fn touch_count(&self) -> usize {
        self.touches.load(Ordering::SeqCst)
    }

    /// Number of `finish()` calls
    pub fn finish_count(&self) -> usize {
        self.finishes.load(Ordering::SeqCst)
    }

    /// Wait until the message has been finished
    pub async fn responded(&self) {
        let mut rx = self.responded.subscribe();
        let _ = rx.wait_for(|responded| *responded).await;
    }
}

impl Message for MemoryMessage {
    fn id(&self) -> &str {
        &self.id
    }

    fn enable_async(&self) {
        self.async_enabled.store(true, Ordering::SeqCst);
    }

    fn touch(&self) {
        self.touches.fetch_add(1, Ordering::SeqCst);
    }

    fn finish(&self) {
        self.finishes.fetch_add(1, Ordering::SeqCst);
        self.responded.send_replace(true);
    }

    fn has_responded(&self) -> bool {
        *self.responded.borrow()
    }
}

/// In-flight accounting shared with delivery tasks
#[derive(Debug, Default)]
struct InFlightStats {
    current: AtomicUsize,
    peak: AtomicUsize,
}

/// Decrements the in-flight count when a delivery ends, panics included
struct InFlightGuard {
    stats: Arc<InFlightStats>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.stats.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory implementation of Broker
///
/// Each topic is a single FIFO queue; every subscription on a topic draws
/// from it, so channels behave as one shared channel. Like a real broker it
/// enforces max-in-flight and finishes a message itself when the delivery
/// callback returns without having called `enable_async()`.
///
/// # Example
///
/// ```
/// use threadworker::InMemoryBroker;
///
/// let broker = InMemoryBroker::new();
/// broker.publish("orders", b"order-1".to_vec());
/// assert_eq!(broker.pending_count("orders"), 1);
/// ```
pub struct InMemoryBroker {
    topics: Mutex<HashMap<String, VecDeque<Arc<MemoryMessage>>>>,
    available: Notify,
    closed: AtomicBool,
    reachable: AtomicBool,
    delivered: RwLock<Vec<Arc<MemoryMessage>>>,
    subscriptions: RwLock<Vec<SubscriptionConfig>>,
    in_flight: Arc<InFlightStats>,
}

impl InMemoryBroker {
    /// Create a new in-memory broker
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            available: Notify::new(),
            closed: AtomicBool::new(false),
            reachable: AtomicBool::new(true),
            delivered: RwLock::new(Vec::new()),
            subscriptions: RwLock::new(Vec::new()),
            in_flight: Arc::new(InFlightStats::default()),
        }
    }

    /// Publish a message to a topic
    pub fn publish(&self, topic: &str, body: impl Into<Vec<u8>>) -> Arc<MemoryMessage> {
        let message = Arc::new(MemoryMessage::new(topic, body));
        self.topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push_back(Arc::clone(&message));
        self.available.notify_waiters();
        message
    }

    /// Stop accepting deliveries once the queues are drained
    ///
    /// Subscriptions return after their in-flight messages have responded.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.available.notify_waiters();
    }

    /// Simulate a broker that refuses connections
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Number of messages waiting on a topic
    pub fn pending_count(&self, topic: &str) -> usize {
        self.topics.lock().get(topic).map_or(0, VecDeque::len)
    }

    /// Messages delivered so far, in delivery order
    pub fn delivered(&self) -> Vec<Arc<MemoryMessage>> {
        self.delivered.read().clone()
    }

    /// Subscriptions received so far
    pub fn subscriptions(&self) -> Vec<SubscriptionConfig> {
        self.subscriptions.read().clone()
    }

    /// Messages delivered but not yet responded
    pub fn in_flight(&self) -> usize {
        self.in_flight.current.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously in-flight messages
    pub fn peak_in_flight(&self) -> usize {
        self.in_flight.peak.load(Ordering::SeqCst)
    }

    /// Next message for a topic, or None once closed and drained
    async fn next_message(&self, topic: &str) -> Option<Arc<MemoryMessage>> {
        loop {
            let notified = self.available.notified();
            {
                let mut topics = self.topics.lock();
                if let Some(message) = topics.get_mut(topic).and_then(VecDeque::pop_front) {
                    return Some(message);
                }
                if self.closed.load(Ordering::SeqCst) {
                    return None;
                }
            }
            notified.await;
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    type Message = MemoryMessage;

    async fn subscribe(
        &self,
        subscription: SubscriptionConfig,
        on_message: DeliveryCallback<MemoryMessage>,
    ) -> Result<(), BrokerError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection(
                "in-memory broker is unreachable".to_string(),
            ));
        }
        subscription
            .validate()
            .map_err(|e| BrokerError::InvalidSubscription(e.to_string()))?;

        let max_in_flight = subscription.max_in_flight.max(1);
        info!(
            topic = %subscription.topic,
            channel = %subscription.channel,
            max_in_flight,
            "Subscribed"
        );
        self.subscriptions.write().push(subscription.clone());

        let slots = Arc::new(Semaphore::new(max_in_flight));
        let mut deliveries = JoinSet::new();

        loop {
            let permit = Arc::clone(&slots)
                .acquire_owned()
                .await
                .map_err(|_| BrokerError::Closed("in-flight limiter closed".to_string()))?;

            let Some(message) = self.next_message(&subscription.topic).await else {
                debug!(topic = %subscription.topic, "Broker closed, draining deliveries");
                break;
            };

            self.delivered.write().push(Arc::clone(&message));
            let load = self.in_flight.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.in_flight.peak.fetch_max(load, Ordering::SeqCst);

            let guard = InFlightGuard {
                stats: Arc::clone(&self.in_flight),
                _permit: permit,
            };
            deliveries.spawn(deliver(message, Arc::clone(&on_message), guard));

            while let Some(result) = deliveries.try_join_next() {
                log_delivery(result);
            }
        }

        while let Some(result) = deliveries.join_next().await {
            log_delivery(result);
        }

        info!(topic = %subscription.topic, "Subscription finished");
        Ok(())
    }
}

/// Run the callback for one message and hold its in-flight slot until it responds
async fn deliver(
    message: Arc<MemoryMessage>,
    on_message: DeliveryCallback<MemoryMessage>,
    _guard: InFlightGuard,
) {
    on_message(Arc::clone(&message)).await;

    if !message.is_async() && !message.has_responded() {
        message.finish();
    }

    message.responded().await;
}

fn log_delivery(result: Result<(), JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            warn!(error = %e, "Delivery callback panicked");
        } else {
            warn!(error = %e, "Delivery task aborted");
        }
    }
}
