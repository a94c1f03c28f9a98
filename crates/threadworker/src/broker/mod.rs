//! Broker boundary
//!
//! This module provides:
//! - [`Message`] - Per-message operations the worker relies on
//! - [`Broker`] - Subscription with a delivery callback
//! - [`InMemoryBroker`] - Reference implementation for tests and local runs
//!
//! Connection management, redelivery and backoff belong to the broker
//! client behind these traits.

mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

pub use crate::config::SubscriptionConfig;
pub use memory::{InMemoryBroker, MemoryMessage};

/// A message delivered by the broker
///
/// The broker owns the message; the worker only holds a shared reference to
/// it while processing.
pub trait Message: Send + Sync + 'static {
    /// Opaque message ID, used for logging and correlation
    fn id(&self) -> &str;

    /// Suppress implicit finalization when the delivery callback returns
    fn enable_async(&self);

    /// Extend the broker-side visibility timeout
    fn touch(&self);

    /// Acknowledge successful processing
    fn finish(&self);

    /// Whether the message has already been finished or failed
    fn has_responded(&self) -> bool;
}

/// Callback invoked by the broker for every delivered message
pub type DeliveryCallback<M> = Arc<dyn Fn(Arc<M>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Error type for broker operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    /// Could not reach the broker
    #[error("connection failed: {0}")]
    Connection(String),

    /// The broker rejected the subscription
    #[error("invalid subscription: {0}")]
    InvalidSubscription(String),

    /// The subscription ended unexpectedly
    #[error("subscription closed: {0}")]
    Closed(String),
}

/// A pull-based message broker
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Message type delivered by this broker
    type Message: Message;

    /// Subscribe and deliver messages to `on_message` until the broker stops
    ///
    /// At most `subscription.max_in_flight` messages are delivered without
    /// having responded. Returns an error if the subscription cannot be set
    /// up; no reconnection is attempted.
    async fn subscribe(
        &self,
        subscription: SubscriptionConfig,
        on_message: DeliveryCallback<Self::Message>,
    ) -> Result<(), BrokerError>;
}
