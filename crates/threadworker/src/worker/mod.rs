//! Message processing
//!
//! This module provides:
//! - [`Coordinator`] - Per-message lifecycle: heartbeat, dispatch, timeout, finalization
//! - [`WorkerPool`] - Bounded pool running handlers off the async scheduler
//! - [`HeartbeatTicker`] - Periodic `touch()` for in-flight messages
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Coordinator                            │
//! │  ┌─────────────────┐        ┌────────────────────────────┐  │
//! │  │ HeartbeatTicker │        │  timeout race + exception  │  │
//! │  │  (touch, 30s)   │        │  handler + finish()        │  │
//! │  └─────────────────┘        └─────────────┬──────────────┘  │
//! │                                           │                  │
//! │                                           ▼                  │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │       WorkerPool (Semaphore-limited, blocking)      │    │
//! │  │  [Slot 1] [Slot 2] [Slot 3] ... [Slot N]            │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use threadworker::worker::Coordinator;
//!
//! let coordinator = Coordinator::new(&config, Arc::new(|message: &MemoryMessage| {
//!     let order: Order = serde_json::from_slice(message.body())?;
//!     fulfil(order)?;
//!     Ok(())
//! }));
//!
//! let outcome = coordinator.handle(message).await;
//! ```

mod coordinator;
mod heartbeat;
mod pool;

pub use coordinator::{Coordinator, ExceptionHandler, Outcome};
pub use heartbeat::HeartbeatTicker;
pub use pool::{Handler, TaskHandle, TaskState, WorkerPool};
