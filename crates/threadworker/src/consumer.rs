//! Subscription driver
//!
//! Binds a [`Coordinator`] to a broker subscription. The broker's
//! max-in-flight is set to the worker concurrency so no more messages are
//! delivered than there are worker slots.

use std::sync::Arc;

use tracing::instrument::WithSubscriber;
use tracing::{info, Dispatch};

use crate::broker::{Broker, DeliveryCallback};
use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::worker::{Coordinator, ExceptionHandler, Handler};

/// Consumer running a handler over a broker subscription
///
/// # Example
///
/// ```ignore
/// let broker = Arc::new(InMemoryBroker::new());
/// let config = WorkerConfig::from_env()?;
///
/// let consumer = Consumer::new(broker, config, Arc::new(|message: &MemoryMessage| {
///     process(message.body())
/// }));
///
/// consumer.start().await?;
/// ```
pub struct Consumer<B: Broker> {
    broker: Arc<B>,
    config: WorkerConfig,
    coordinator: Coordinator<B::Message>,
    dispatch: Option<Dispatch>,
}

impl<B: Broker> Consumer<B> {
    /// Create a consumer for `broker`
    pub fn new(broker: Arc<B>, config: WorkerConfig, handler: Handler<B::Message>) -> Self {
        let coordinator = Coordinator::new(&config, handler);
        Self {
            broker,
            config,
            coordinator,
            dispatch: None,
        }
    }

    /// Set the callback for handler failures and timeouts
    pub fn with_exception_handler(
        mut self,
        exception_handler: ExceptionHandler<B::Message>,
    ) -> Self {
        self.coordinator = self.coordinator.with_exception_handler(exception_handler);
        self
    }

    /// Send all log output to `dispatch` instead of the default subscriber
    pub fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.coordinator = self.coordinator.with_dispatch(dispatch.clone());
        self.dispatch = Some(dispatch);
        self
    }

    /// Worker configuration
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Coordinator handling delivered messages
    pub fn coordinator(&self) -> &Coordinator<B::Message> {
        &self.coordinator
    }

    /// Subscribe and process messages until the broker stops delivering
    ///
    /// Fails without retrying if the configuration is invalid or the
    /// subscription cannot be set up.
    pub async fn start(&self) -> Result<(), WorkerError> {
        match &self.dispatch {
            Some(dispatch) => self.run().with_subscriber(dispatch.clone()).await,
            None => self.run().await,
        }
    }

    async fn run(&self) -> Result<(), WorkerError> {
        self.config.validate()?;

        let concurrency = self.config.concurrency;
        let subscription = self
            .config
            .subscription
            .clone()
            .with_max_in_flight(concurrency);

        info!(
            topic = %subscription.topic,
            channel = %subscription.channel,
            "Added a handler for broker messages"
        );
        info!(
            threads = concurrency,
            "Handling messages with {} threads",
            concurrency
        );

        let coordinator = self.coordinator.clone();
        let on_message: DeliveryCallback<B::Message> = Arc::new(move |message| {
            let coordinator = coordinator.clone();
            Box::pin(async move {
                coordinator.handle(message).await;
            })
        });

        let topic = subscription.topic.clone();
        self.broker.subscribe(subscription, on_message).await?;

        info!(%topic, "Consumer stopped");
        Ok(())
    }
}
