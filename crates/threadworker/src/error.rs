//! Error types for message handling, configuration and subscription setup

use std::time::Duration;

use crate::broker::BrokerError;

/// Why a handler invocation did not complete successfully
///
/// This is what the exception handler receives. Every variant is recovered
/// locally: the message is still finalized.
#[derive(Debug, thiserror::Error)]
pub enum HandlerFailure {
    /// The handler returned an error
    #[error("message handler failed: {0:#}")]
    Handler(anyhow::Error),

    /// The handler panicked on its worker thread
    #[error("message handler panicked: {0}")]
    Panicked(String),

    /// The handler did not finish within the configured timeout
    #[error("message handler exceeded timeout of {limit:?}")]
    Timeout { limit: Duration },

    /// The task was cancelled before a worker picked it up
    #[error("message handler was cancelled before it started")]
    Cancelled,
}

impl HandlerFailure {
    /// Whether this failure is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// The error returned by the handler, if that is what failed
    pub fn handler_error(&self) -> Option<&anyhow::Error> {
        match self {
            Self::Handler(err) => Some(err),
            _ => None,
        }
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Concurrency must be at least one
    #[error("concurrency must be a positive integer")]
    ZeroConcurrency,

    /// Heartbeat interval must be non-zero
    #[error("heartbeat interval must be greater than zero")]
    ZeroHeartbeatInterval,

    /// Topic or channel name is not a valid queue name
    #[error("invalid {kind} name: {name:?}")]
    InvalidName { kind: &'static str, name: String },

    /// An environment variable could not be parsed
    #[error("invalid value for {key}: {value:?}")]
    InvalidEnv { key: String, value: String },
}

/// Top-level errors returned by the consumer
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Configuration rejected before subscribing
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Broker subscription failed; not retried
    #[error("subscription error: {0}")]
    Subscription(#[from] BrokerError),
}
