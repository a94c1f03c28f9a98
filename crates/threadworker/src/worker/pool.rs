//! Worker pool for handler execution
//!
//! Runs message handlers on tokio's blocking threads, at most `concurrency`
//! at a time. Excess submissions wait in FIFO order on a semaphore.

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{debug, Dispatch};

use crate::broker::Message;
use crate::error::HandlerFailure;

/// Message handler function type
///
/// Runs on a worker thread and may block.
pub type Handler<M> = Arc<dyn Fn(&M) -> anyhow::Result<()> + Send + Sync>;

/// Lifecycle of one handler invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting for a free slot
    Pending,
    /// Handler body is running
    Running,
    /// Handler returned Ok
    Completed,
    /// Handler returned an error or panicked
    Failed,
    /// Caller stopped waiting; the body may still be running
    TimedOut,
    /// Cancelled before a slot was acquired; the handler never ran
    Cancelled,
}

impl TaskState {
    /// Whether the task has reached a final state
    pub fn is_settled(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

#[derive(Debug, Default)]
struct PoolStats {
    active: AtomicUsize,
    queued: AtomicUsize,
    orphaned: AtomicUsize,
    peak_active: AtomicUsize,
}

/// Holds a pool slot for the duration of one handler body
struct SlotGuard {
    stats: Arc<PoolStats>,
    _permit: OwnedSemaphorePermit,
}

impl SlotGuard {
    fn acquire(stats: Arc<PoolStats>, permit: OwnedSemaphorePermit) -> Self {
        let active = stats.active.fetch_add(1, Ordering::SeqCst) + 1;
        stats.peak_active.fetch_max(active, Ordering::SeqCst);
        Self {
            stats,
            _permit: permit,
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.stats.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Handle to a submitted handler invocation
///
/// Resolves to the handler's outcome. Dropping the handle does not stop the
/// task.
#[derive(Debug)]
pub struct TaskHandle {
    message_id: String,
    join: JoinHandle<Result<(), HandlerFailure>>,
    state: Arc<Mutex<TaskState>>,
    cancel: CancellationToken,
}

impl TaskHandle {
    /// ID of the message this task handles
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Current state of the task
    pub fn state(&self) -> TaskState {
        *self.state.lock()
    }

    /// Request cancellation
    ///
    /// Advisory only: a task still waiting for a slot is skipped, a running
    /// handler body is not interrupted.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Mark the task as timed out and request cancellation
    pub fn time_out(&self) {
        settle(&self.state, TaskState::TimedOut);
        self.cancel();
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Future for TaskHandle {
    type Output = Result<(), HandlerFailure>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.join).poll(cx).map(flatten_join)
    }
}

fn flatten_join(
    joined: Result<Result<(), HandlerFailure>, JoinError>,
) -> Result<(), HandlerFailure> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(HandlerFailure::Panicked(e.to_string())),
    }
}

/// Fixed-size pool executing a message handler off the async scheduler
///
/// # Example
///
/// ```ignore
/// let pool = WorkerPool::new(4, Arc::new(|message: &MemoryMessage| {
///     process(message.body())?;
///     Ok(())
/// }));
///
/// let result = pool.submit(message).await;
/// ```
pub struct WorkerPool<M> {
    handler: Handler<M>,
    concurrency: usize,
    slots: Arc<Semaphore>,
    stats: Arc<PoolStats>,
}

impl<M> Clone for WorkerPool<M> {
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
            concurrency: self.concurrency,
            slots: Arc::clone(&self.slots),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<M: Message> WorkerPool<M> {
    /// Create a pool running `handler` with at most `concurrency` bodies at once
    pub fn new(concurrency: usize, handler: Handler<M>) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            handler,
            concurrency,
            slots: Arc::new(Semaphore::new(concurrency)),
            stats: Arc::new(PoolStats::default()),
        }
    }

    /// Submit one handler invocation for `message`
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(&self, message: Arc<M>) -> TaskHandle {
        let message_id = message.id().to_string();
        let state = Arc::new(Mutex::new(TaskState::Pending));
        let cancel = CancellationToken::new();
        let dispatch = tracing::dispatcher::get_default(Dispatch::clone);

        self.stats.queued.fetch_add(1, Ordering::SeqCst);

        let task = run_task(
            Arc::clone(&self.handler),
            message,
            Arc::clone(&self.slots),
            Arc::clone(&self.stats),
            Arc::clone(&state),
            cancel.clone(),
            dispatch.clone(),
        );
        let join = tokio::spawn(task.with_subscriber(dispatch));

        TaskHandle {
            message_id,
            join,
            state,
            cancel,
        }
    }

    /// Stop waiting on a task and let it settle in the background
    ///
    /// The task counts as orphaned until its body returns; its result is
    /// discarded and its slot released normally.
    pub fn detach(&self, task: TaskHandle) {
        self.stats.orphaned.fetch_add(1, Ordering::SeqCst);
        let stats = Arc::clone(&self.stats);
        let dispatch = tracing::dispatcher::get_default(Dispatch::clone);

        let reaper = async move {
            let message_id = task.message_id().to_string();
            match task.await {
                Ok(()) => debug!(%message_id, "Orphaned handler completed, result discarded"),
                Err(e) => {
                    debug!(%message_id, error = %e, "Orphaned handler failed, error discarded")
                }
            }
            stats.orphaned.fetch_sub(1, Ordering::SeqCst);
        };
        tokio::spawn(reaper.with_subscriber(dispatch));
    }

    /// Maximum concurrent handler bodies
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Handler bodies currently running
    pub fn active(&self) -> usize {
        self.stats.active.load(Ordering::SeqCst)
    }

    /// Submissions waiting for a slot
    pub fn queued(&self) -> usize {
        self.stats.queued.load(Ordering::SeqCst)
    }

    /// Detached tasks that have not settled yet
    pub fn orphaned(&self) -> usize {
        self.stats.orphaned.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously running bodies
    pub fn peak_active(&self) -> usize {
        self.stats.peak_active.load(Ordering::SeqCst)
    }

    /// Slots free right now
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }
}

/// Move the task to `next` unless it already settled
fn start_running(state: &Mutex<TaskState>) {
    let mut state = state.lock();
    if *state == TaskState::Pending {
        *state = TaskState::Running;
    }
}

fn settle(state: &Mutex<TaskState>, next: TaskState) {
    let mut state = state.lock();
    if !state.is_settled() {
        *state = next;
    }
}

async fn run_task<M: Message>(
    handler: Handler<M>,
    message: Arc<M>,
    slots: Arc<Semaphore>,
    stats: Arc<PoolStats>,
    state: Arc<Mutex<TaskState>>,
    cancel: CancellationToken,
    dispatch: Dispatch,
) -> Result<(), HandlerFailure> {
    let acquired = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        permit = slots.acquire_owned() => permit.ok(),
    };
    stats.queued.fetch_sub(1, Ordering::SeqCst);

    let Some(permit) = acquired else {
        debug!(message_id = %message.id(), "Handler cancelled before start");
        settle(&state, TaskState::Cancelled);
        return Err(HandlerFailure::Cancelled);
    };

    start_running(&state);
    let slot = SlotGuard::acquire(stats, permit);

    let result = tokio::task::spawn_blocking(move || {
        let _slot = slot;
        tracing::dispatcher::with_default(&dispatch, || handler(&*message))
    })
    .await;

    let result = match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(HandlerFailure::Handler(e)),
        Err(e) if e.is_panic() => Err(HandlerFailure::Panicked(panic_message(e.into_panic()))),
        Err(e) => Err(HandlerFailure::Panicked(e.to_string())),
    };

    let next = if result.is_ok() {
        TaskState::Completed
    } else {
        TaskState::Failed
    };
    settle(&state, next);

    result
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
