//! Message lifecycle coordinator
//!
//! Drives one delivered message from receipt to acknowledgment: heartbeat,
//! pool dispatch, timeout race, failure reporting and finalization.

use std::sync::Arc;
use std::time::Duration;

use tracing::instrument::WithSubscriber;
use tracing::{debug, error, Dispatch};

use super::heartbeat::HeartbeatTicker;
use super::pool::{Handler, WorkerPool};
use crate::broker::Message;
use crate::config::WorkerConfig;
use crate::error::HandlerFailure;

/// Callback invoked when a handler fails or times out
///
/// Runs on the async scheduler and should not block.
pub type ExceptionHandler<M> = Arc<dyn Fn(&M, &HandlerFailure) + Send + Sync>;

/// How handling of one message ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Handler returned Ok
    Completed,
    /// Handler returned an error or panicked
    Failed,
    /// Handler exceeded the timeout; it may still be running
    TimedOut,
}

/// Stops the heartbeat and finalizes the message when dropped
///
/// Runs on every exit from `handle`, including a panicking exception handler
/// and a dropped `handle` future.
struct Lifecycle<M: Message> {
    message: Arc<M>,
    ticker: HeartbeatTicker,
}

impl<M: Message> Lifecycle<M> {
    fn begin(message: Arc<M>, heartbeat_interval: Duration) -> Self {
        let ticker = HeartbeatTicker::start(Arc::clone(&message), heartbeat_interval);
        Self { message, ticker }
    }
}

impl<M: Message> Drop for Lifecycle<M> {
    fn drop(&mut self) {
        self.ticker.stop();
        if !self.message.has_responded() {
            self.message.finish();
        }
    }
}

/// Per-message lifecycle coordinator
///
/// Every message passed to [`Coordinator::handle`] is finished exactly once,
/// unless it had already responded, whatever the handler does.
///
/// # Example
///
/// ```ignore
/// let coordinator = Coordinator::new(&config, handler)
///     .with_exception_handler(Arc::new(|message, failure| {
///         metrics::record_failure(message.id(), failure);
///     }));
///
/// let outcome = coordinator.handle(message).await;
/// ```
pub struct Coordinator<M> {
    pool: WorkerPool<M>,
    exception_handler: Option<ExceptionHandler<M>>,
    timeout: Option<Duration>,
    heartbeat_interval: Duration,
    dispatch: Option<Dispatch>,
}

impl<M> Clone for Coordinator<M> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            exception_handler: self.exception_handler.clone(),
            timeout: self.timeout,
            heartbeat_interval: self.heartbeat_interval,
            dispatch: self.dispatch.clone(),
        }
    }
}

impl<M: Message> Coordinator<M> {
    /// Create a coordinator with its own worker pool
    pub fn new(config: &WorkerConfig, handler: Handler<M>) -> Self {
        Self {
            pool: WorkerPool::new(config.concurrency, handler),
            exception_handler: None,
            timeout: config.timeout,
            heartbeat_interval: config.heartbeat_interval,
            dispatch: None,
        }
    }

    /// Set the callback for handler failures and timeouts
    pub fn with_exception_handler(mut self, exception_handler: ExceptionHandler<M>) -> Self {
        self.exception_handler = Some(exception_handler);
        self
    }

    /// Send all log output for handled messages to `dispatch`
    ///
    /// Covers the coordinator itself, heartbeat tasks and handler bodies.
    /// Without one, the caller's default subscriber is used.
    pub fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    /// The worker pool running handler bodies
    pub fn pool(&self) -> &WorkerPool<M> {
        &self.pool
    }

    /// Per-message timeout
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Heartbeat interval
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Handle one delivered message
    ///
    /// Returns after the message has been finalized. A timed-out handler body
    /// keeps its pool slot until it returns; its result is discarded.
    pub async fn handle(&self, message: Arc<M>) -> Outcome {
        match &self.dispatch {
            Some(dispatch) => {
                self.process(message)
                    .with_subscriber(dispatch.clone())
                    .await
            }
            None => self.process(message).await,
        }
    }

    async fn process(&self, message: Arc<M>) -> Outcome {
        debug!(message_id = %message.id(), "Received message");
        message.enable_async();

        let outcome = {
            let _lifecycle = Lifecycle::begin(Arc::clone(&message), self.heartbeat_interval);
            self.execute(&message).await
        };

        debug!(message_id = %message.id(), ?outcome, "Finished handling message");
        outcome
    }

    async fn execute(&self, message: &Arc<M>) -> Outcome {
        let mut task = self.pool.submit(Arc::clone(message));

        let result = match self.timeout {
            None => task.await,
            Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                Ok(result) => result,
                Err(_) => {
                    error!(
                        message_id = %message.id(),
                        timeout_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                        "Message handler exceeded timeout"
                    );
                    task.time_out();
                    self.pool.detach(task);
                    self.report(message, &HandlerFailure::Timeout { limit });
                    return Outcome::TimedOut;
                }
            },
        };

        match result {
            Ok(()) => Outcome::Completed,
            Err(failure) => {
                debug!(
                    message_id = %message.id(),
                    error = %failure,
                    "Message handler raised an exception"
                );
                self.report(message, &failure);
                Outcome::Failed
            }
        }
    }

    fn report(&self, message: &M, failure: &HandlerFailure) {
        if let Some(exception_handler) = &self.exception_handler {
            exception_handler(message, failure);
        }
    }
}
