//! Worker and subscription configuration

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Interval between `touch()` calls for an in-flight message
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Longest topic or channel name the broker accepts
const MAX_NAME_LEN: usize = 64;

const EPHEMERAL_SUFFIX: &str = "#ephemeral";

/// Subscription options handed to the broker
///
/// `max_in_flight` is overwritten by the consumer with the worker
/// concurrency. Anything in `options` is passed through verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscriptionConfig {
    /// Topic to consume from
    pub topic: String,

    /// Channel within the topic
    pub channel: String,

    /// Broker daemon TCP addresses
    #[serde(default)]
    pub nsqd_tcp_addresses: Vec<String>,

    /// Lookup daemon HTTP addresses
    #[serde(default)]
    pub lookupd_http_addresses: Vec<String>,

    /// Maximum delivered but unacknowledged messages
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Broker-specific options, passed through untouched
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

fn default_max_in_flight() -> usize {
    1
}

impl SubscriptionConfig {
    /// Create a subscription for a topic and channel
    pub fn new(topic: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            channel: channel.into(),
            nsqd_tcp_addresses: vec![],
            lookupd_http_addresses: vec![],
            max_in_flight: default_max_in_flight(),
            options: BTreeMap::new(),
        }
    }

    /// Add a broker daemon TCP address
    pub fn with_nsqd_address(mut self, address: impl Into<String>) -> Self {
        self.nsqd_tcp_addresses.push(address.into());
        self
    }

    /// Add a lookup daemon HTTP address
    pub fn with_lookupd_address(mut self, address: impl Into<String>) -> Self {
        self.lookupd_http_addresses.push(address.into());
        self
    }

    /// Set the max-in-flight count
    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max.max(1);
        self
    }

    /// Set a pass-through broker option
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Validate topic and channel names
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_name("topic", &self.topic)?;
        validate_name("channel", &self.channel)?;
        Ok(())
    }
}

/// Check a topic or channel name: 1-64 chars of `[.a-zA-Z0-9_-]`,
/// optionally followed by `#ephemeral`
pub fn validate_name(kind: &'static str, name: &str) -> Result<(), ConfigError> {
    let base = name.strip_suffix(EPHEMERAL_SUFFIX).unwrap_or(name);
    let valid = !base.is_empty()
        && name.len() <= MAX_NAME_LEN
        && base
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));

    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidName {
            kind,
            name: name.to_string(),
        })
    }
}

/// Worker configuration
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use threadworker::{SubscriptionConfig, WorkerConfig};
///
/// let config = WorkerConfig::new(SubscriptionConfig::new("orders", "billing"))
///     .with_concurrency(4)
///     .with_timeout(Duration::from_secs(60));
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Worker pool size, also used as the broker's max-in-flight
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Per-message processing bound (None = wait indefinitely)
    #[serde(default, with = "option_duration_millis")]
    pub timeout: Option<Duration>,

    /// Heartbeat interval
    #[serde(default = "default_heartbeat_interval", with = "duration_millis")]
    pub heartbeat_interval: Duration,

    /// Broker subscription
    pub subscription: SubscriptionConfig,
}

fn default_concurrency() -> usize {
    1
}

fn default_heartbeat_interval() -> Duration {
    DEFAULT_HEARTBEAT_INTERVAL
}

impl WorkerConfig {
    /// Create a configuration with defaults for everything but the subscription
    pub fn new(subscription: SubscriptionConfig) -> Self {
        Self {
            concurrency: default_concurrency(),
            timeout: None,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            subscription,
        }
    }

    /// Set the pool size
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the per-message timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Remove the per-message timeout
    pub fn without_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }

    /// Set the heartbeat interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::ZeroHeartbeatInterval);
        }
        self.subscription.validate()
    }

    /// Create configuration from environment variables
    ///
    /// - `NSQ_TOPIC`, `NSQ_CHANNEL`: subscription
    /// - `NSQD_TCP_ADDRESSES`, `NSQ_LOOKUPD_HTTP_ADDRESSES`: comma separated
    /// - `WORKER_CONCURRENCY`: pool size (default 1)
    /// - `WORKER_TIMEOUT_MS`: per-message timeout (unset = none)
    /// - `WORKER_HEARTBEAT_INTERVAL_MS`: heartbeat interval (default 30000)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut subscription = SubscriptionConfig::new(
            lookup("NSQ_TOPIC").unwrap_or_default(),
            lookup("NSQ_CHANNEL").unwrap_or_default(),
        );
        subscription.nsqd_tcp_addresses = split_list(lookup("NSQD_TCP_ADDRESSES"));
        subscription.lookupd_http_addresses = split_list(lookup("NSQ_LOOKUPD_HTTP_ADDRESSES"));

        let mut config = Self::new(subscription);

        if let Some(concurrency) = parse_var::<usize, _>(&lookup, "WORKER_CONCURRENCY")? {
            config.concurrency = concurrency;
        }
        if let Some(millis) = parse_var::<u64, _>(&lookup, "WORKER_TIMEOUT_MS")? {
            config.timeout = Some(Duration::from_millis(millis));
        }
        if let Some(millis) = parse_var::<u64, _>(&lookup, "WORKER_HEARTBEAT_INTERVAL_MS")? {
            config.heartbeat_interval = Duration::from_millis(millis);
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv {
                key: key.to_string(),
                value,
            }),
        _ => Ok(None),
    }
}

fn split_list(value: Option<String>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Serde support for Option<Duration> as milliseconds
mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => d.as_millis().serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = WorkerConfig::new(SubscriptionConfig::new("events", "archive"));
        assert_eq!(config.concurrency, 1);
        assert!(config.timeout.is_none());
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.subscription.max_in_flight, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = WorkerConfig::new(
            SubscriptionConfig::new("events", "archive")
                .with_nsqd_address("127.0.0.1:4150")
                .with_option("user_agent", "threadworker"),
        )
        .with_concurrency(8)
        .with_timeout(Duration::from_secs(5))
        .with_heartbeat_interval(Duration::from_secs(10));

        assert_eq!(config.concurrency, 8);
        assert_eq!(config.timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        let subscription = &config.subscription;
        assert_eq!(subscription.nsqd_tcp_addresses, vec!["127.0.0.1:4150"]);
        assert_eq!(
            subscription.options.get("user_agent").map(String::as_str),
            Some("threadworker")
        );

        let config = config.without_timeout();
        assert!(config.timeout.is_none());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let config =
            WorkerConfig::new(SubscriptionConfig::new("events", "archive")).with_concurrency(0);
        assert_eq!(config.validate(), Err(ConfigError::ZeroConcurrency));
    }

    #[test]
    fn test_zero_heartbeat_rejected() {
        let config = WorkerConfig::new(SubscriptionConfig::new("events", "archive"))
            .with_heartbeat_interval(Duration::ZERO);
        assert_eq!(config.validate(), Err(ConfigError::ZeroHeartbeatInterval));
    }

    #[test]
    fn test_name_validation() {
        assert!(validate_name("topic", "orders").is_ok());
        assert!(validate_name("topic", "orders.v2_eu-west").is_ok());
        assert!(validate_name("channel", "tail#ephemeral").is_ok());

        assert!(validate_name("topic", "").is_err());
        assert!(validate_name("topic", "#ephemeral").is_err());
        assert!(validate_name("topic", "has space").is_err());
        assert!(validate_name("topic", "slash/name").is_err());
        assert!(validate_name("topic", &"a".repeat(65)).is_err());
        assert!(validate_name("topic", &"a".repeat(64)).is_ok());
    }

    #[test]
    fn test_invalid_channel_reported_by_kind() {
        let config = SubscriptionConfig::new("orders", "bad channel");
        match config.validate() {
            Err(ConfigError::InvalidName { kind, name }) => {
                assert_eq!(kind, "channel");
                assert_eq!(name, "bad channel");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_from_lookup() {
        let config = WorkerConfig::from_lookup(lookup_from(&[
            ("NSQ_TOPIC", "orders"),
            ("NSQ_CHANNEL", "billing"),
            ("NSQD_TCP_ADDRESSES", "10.0.0.1:4150, 10.0.0.2:4150,"),
            ("WORKER_CONCURRENCY", "4"),
            ("WORKER_TIMEOUT_MS", "2500"),
        ]))
        .unwrap();

        assert_eq!(config.subscription.topic, "orders");
        assert_eq!(config.subscription.channel, "billing");
        assert_eq!(
            config.subscription.nsqd_tcp_addresses,
            vec!["10.0.0.1:4150", "10.0.0.2:4150"]
        );
        assert!(config.subscription.lookupd_http_addresses.is_empty());
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.timeout, Some(Duration::from_millis(2500)));
        assert_eq!(config.heartbeat_interval, DEFAULT_HEARTBEAT_INTERVAL);
    }

    #[test]
    fn test_from_lookup_invalid_number() {
        let result = WorkerConfig::from_lookup(lookup_from(&[
            ("NSQ_TOPIC", "orders"),
            ("NSQ_CHANNEL", "billing"),
            ("WORKER_CONCURRENCY", "lots"),
        ]));

        assert_eq!(
            result,
            Err(ConfigError::InvalidEnv {
                key: "WORKER_CONCURRENCY".to_string(),
                value: "lots".to_string(),
            })
        );
    }

    #[test]
    fn test_from_lookup_missing_topic() {
        let result = WorkerConfig::from_lookup(lookup_from(&[("NSQ_CHANNEL", "billing")]));
        assert!(matches!(
            result,
            Err(ConfigError::InvalidName { kind: "topic", .. })
        ));
    }

    #[test]
    fn test_config_serialization() {
        let config = WorkerConfig::new(SubscriptionConfig::new("orders", "billing"))
            .with_concurrency(3)
            .with_timeout(Duration::from_millis(1500));

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["timeout"], 1500);
        assert_eq!(json["heartbeat_interval"], 30000);

        let parsed: WorkerConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_config_deserialization_defaults() {
        let json = r#"{"subscription":{"topic":"orders","channel":"billing"}}"#;
        let config: WorkerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.concurrency, 1);
        assert!(config.timeout.is_none());
        assert_eq!(config.heartbeat_interval, DEFAULT_HEARTBEAT_INTERVAL);
        assert_eq!(config.subscription.max_in_flight, 1);
    }
}
