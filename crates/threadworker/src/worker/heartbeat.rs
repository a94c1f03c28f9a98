//! Per-message heartbeat ticker

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{debug, warn, Dispatch};

use crate::broker::Message;
use crate::config::DEFAULT_HEARTBEAT_INTERVAL;

#[derive(Debug, Default)]
struct TickerState {
    stopped: Mutex<bool>,
    beats: AtomicUsize,
}

/// Periodically touches an in-flight message so the broker does not
/// consider it abandoned
///
/// The ticker runs as a task on the async scheduler, not on the worker pool.
/// The first touch happens one full interval after `start`. Dropping the
/// ticker stops it.
///
/// # Example
///
/// ```ignore
/// let ticker = HeartbeatTicker::start(Arc::clone(&message), Duration::from_secs(30));
/// // ... process the message ...
/// ticker.stop();
/// ```
#[derive(Debug)]
pub struct HeartbeatTicker {
    state: Arc<TickerState>,
    cancel: CancellationToken,
}

impl HeartbeatTicker {
    /// Start touching `message` every `interval`
    ///
    /// Must be called from within a tokio runtime. A zero interval falls back
    /// to [`DEFAULT_HEARTBEAT_INTERVAL`].
    pub fn start<M: Message>(message: Arc<M>, interval: Duration) -> Self {
        let interval = if interval.is_zero() {
            warn!(
                message_id = %message.id(),
                "Heartbeat interval is zero, using the default"
            );
            DEFAULT_HEARTBEAT_INTERVAL
        } else {
            interval
        };
        let state = Arc::new(TickerState::default());
        let cancel = CancellationToken::new();
        let dispatch = tracing::dispatcher::get_default(Dispatch::clone);

        let task = {
            let state = Arc::clone(&state);
            let cancel = cancel.clone();
            async move {
                let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            if !beat(message.as_ref(), &state) {
                                break;
                            }
                        }
                    }
                }
            }
        };
        tokio::spawn(task.with_subscriber(dispatch));

        Self { state, cancel }
    }

    /// Stop the ticker
    ///
    /// Safe to call more than once. No `touch()` happens after this returns.
    pub fn stop(&self) {
        *self.state.stopped.lock() = true;
        self.cancel.cancel();
    }

    /// Whether `stop` has been called
    pub fn is_stopped(&self) -> bool {
        *self.state.stopped.lock()
    }

    /// Number of touches sent so far
    pub fn beats(&self) -> usize {
        self.state.beats.load(Ordering::SeqCst)
    }
}

impl Drop for HeartbeatTicker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Touch the message unless stopped; the lock is held across the touch so
/// `stop` cannot return while one is in progress
fn beat<M: Message>(message: &M, state: &TickerState) -> bool {
    let stopped = state.stopped.lock();
    if *stopped {
        return false;
    }

    debug!(message_id = %message.id(), "Sending touch event for message");
    message.touch();
    state.beats.fetch_add(1, Ordering::SeqCst);
    true
}
