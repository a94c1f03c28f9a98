// Logging setup
//
// Installs a tracing-subscriber fmt layer filtered by EnvFilter. Embedders
// that already own a subscriber skip this and pass a Dispatch to the
// Coordinator or Consumer instead.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Target of every log line emitted by this crate
pub const LOG_TARGET: &str = "threadworker";

const DEFAULT_FILTER: &str = "info";

/// Errors from telemetry initialization
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// The filter directive could not be parsed
    #[error("invalid log filter {directive:?}: {reason}")]
    InvalidFilter { directive: String, reason: String },

    /// A global subscriber was already installed
    #[error("failed to install subscriber: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

/// Configuration for logging
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name, recorded once at startup
    pub service_name: String,
    /// Full filter directive (e.g. "info,threadworker=debug")
    pub log_filter: Option<String>,
    /// Level applied to this crate's target only
    pub log_level: Option<String>,
    /// Whether to write log lines to stdout
    pub enable_console: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: LOG_TARGET.to_string(),
            log_filter: None,
            log_level: None,
            enable_console: true,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `SERVICE_NAME`: Service name (default: "threadworker")
    /// - `RUST_LOG`: Full filter directive
    /// - `LOG_LEVEL`: Level for the `threadworker` target when `RUST_LOG` is unset
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            service_name: non_empty("SERVICE_NAME").unwrap_or_else(|| LOG_TARGET.to_string()),
            log_filter: non_empty("RUST_LOG"),
            log_level: non_empty("LOG_LEVEL"),
            enable_console: true,
        }
    }

    /// Filter directive to install
    pub fn filter_directive(&self) -> String {
        match (&self.log_filter, &self.log_level) {
            (Some(filter), _) => filter.trim().to_string(),
            (None, Some(level)) => format!(
                "{},{}={}",
                DEFAULT_FILTER,
                LOG_TARGET,
                level.trim().to_lowercase()
            ),
            (None, None) => DEFAULT_FILTER.to_string(),
        }
    }

    fn env_filter(&self) -> Result<EnvFilter, TelemetryError> {
        let directive = self.filter_directive();
        EnvFilter::try_new(&directive).map_err(|e| TelemetryError::InvalidFilter {
            directive,
            reason: e.to_string(),
        })
    }
}

/// Install the global subscriber
///
/// # Example
///
/// ```ignore
/// use threadworker::telemetry::{init_telemetry, TelemetryConfig};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     init_telemetry(TelemetryConfig::from_env())?;
///     // ... start the consumer
///     Ok(())
/// }
/// ```
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    let filter = config.env_filter()?;

    let console_layer = if config.enable_console {
        Some(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_filter(filter),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .try_init()?;

    tracing::debug!(service = %config.service_name, "Logging initialized");
    Ok(())
}
