//! # Threadworker
//!
//! A bounded-concurrency consumer for pull-based message queues. Blocking
//! message handlers run on a fixed-size worker pool while the async scheduler
//! keeps receiving messages, touching in-flight ones and enforcing timeouts.
//!
//! ## Features
//!
//! - **Bounded concurrency**: at most N handlers run at once, and the broker never has more than N messages in flight
//! - **Heartbeats**: in-flight messages are touched every 30s so the broker does not redeliver them
//! - **Timeouts**: slow handlers are reported to an exception callback and left to finish in the background
//! - **Exactly-one acknowledgment**: every delivered message is finished once, whatever the handler does
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Broker                               │
//! │  (subscription, max-in-flight = N, redelivery, backoff)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │  DeliveryCallback
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Coordinator                             │
//! │  (heartbeat, timeout race, exception handler, finish)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkerPool                              │
//! │  (N slots on tokio's blocking threads)                      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use threadworker::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     init_telemetry(TelemetryConfig::from_env())?;
//!
//!     let broker = Arc::new(InMemoryBroker::new());
//!     let config = WorkerConfig::from_env()?;
//!
//!     let consumer = Consumer::new(broker, config, Arc::new(|message: &MemoryMessage| {
//!         let order: Order = serde_json::from_slice(message.body())?;
//!         fulfil(order)?;
//!         Ok(())
//!     }))
//!     .with_exception_handler(Arc::new(|message, failure| {
//!         tracing::warn!(message_id = %message.id(), error = %failure, "Order not fulfilled");
//!     }));
//!
//!     consumer.start().await?;
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod config;
pub mod consumer;
pub mod error;
pub mod telemetry;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::broker::{
        Broker, BrokerError, DeliveryCallback, InMemoryBroker, MemoryMessage, Message,
    };
    pub use crate::config::{SubscriptionConfig, WorkerConfig};
    pub use crate::consumer::Consumer;
    pub use crate::error::{ConfigError, HandlerFailure, WorkerError};
    pub use crate::telemetry::{init_telemetry, TelemetryConfig};
    pub use crate::worker::{Coordinator, ExceptionHandler, Handler, Outcome, WorkerPool};
}

// Re-export commonly used types at crate root
pub use broker::{Broker, BrokerError, InMemoryBroker, MemoryMessage, Message};
pub use config::{SubscriptionConfig, WorkerConfig, DEFAULT_HEARTBEAT_INTERVAL};
pub use consumer::Consumer;
pub use error::{ConfigError, HandlerFailure, WorkerError};
pub use worker::{Coordinator, ExceptionHandler, Handler, Outcome, TaskState, WorkerPool};
