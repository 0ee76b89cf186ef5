//! Configuration types for the broker connection manager.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::Result;
use crate::{
    DEFAULT_BASE_RETRY_DELAY_MS, DEFAULT_MAX_RETRY_DELAY_MS, DEFAULT_NOTIFY_TIMEOUT_MS,
};

/// Connection parameters for an AMQP broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AmqpEndpoint {
    pub username: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub vhost: String,
}

impl Default for AmqpEndpoint {
    fn default() -> Self {
        Self {
            username: "guest".to_string(),
            password: "guest".to_string(),
            host: "localhost".to_string(),
            port: 5672,
            vhost: "/".to_string(),
        }
    }
}

impl AmqpEndpoint {
    /// Load endpoint parameters from `BROKER_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            username: std::env::var("BROKER_USERNAME").unwrap_or(defaults.username),
            password: std::env::var("BROKER_PASSWORD").unwrap_or(defaults.password),
            host: std::env::var("BROKER_HOST").unwrap_or(defaults.host),
            port: std::env::var("BROKER_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            vhost: std::env::var("BROKER_VHOST").unwrap_or(defaults.vhost),
        }
    }

    /// Render the endpoint as an `amqp://` URI.
    ///
    /// The default vhost `/` is percent-encoded so it survives URI parsing.
    pub fn to_uri(&self) -> String {
        let vhost = match self.vhost.as_str() {
            "" | "/" => "%2f".to_string(),
            other => other.trim_start_matches('/').replace('/', "%2f"),
        };
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.username, self.password, self.host, self.port, vhost
        )
    }
}

/// What to do when a publisher confirmation does not arrive in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConfirmTimeoutPolicy {
    /// Log the timeout and report the publish as successful.
    #[default]
    Log,
    /// Return [`BrokerError::ConfirmTimeout`](crate::types::BrokerError::ConfirmTimeout).
    Fail,
}

/// Acknowledgment mode for [`handle_messages`](crate::messaging::BrokerConnectionManager::handle_messages).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AckMode {
    /// The consumer relies on broker auto-ack. Failures are rejected without requeue.
    Auto,
    /// Every success is acked, every failure is rejected with requeue.
    Manual,
    /// `Manual` in the production environment, `Auto` elsewhere.
    #[default]
    ProductionOnly,
}

impl AckMode {
    /// Resolve the mode into a concrete policy for the given environment.
    pub fn resolve(self, is_production: bool) -> AckPolicy {
        match self {
            Self::Auto => AckPolicy::Passive,
            Self::Manual => AckPolicy::Explicit,
            Self::ProductionOnly if is_production => AckPolicy::Explicit,
            Self::ProductionOnly => AckPolicy::Passive,
        }
    }
}

/// Concrete acknowledgment behavior applied per delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckPolicy {
    /// Ack on success, reject with requeue on failure.
    Explicit,
    /// No call on success, reject without requeue on failure.
    Passive,
}

impl AckPolicy {
    pub fn acks_on_success(self) -> bool {
        self == Self::Explicit
    }

    pub fn requeue_on_failure(self) -> bool {
        self == Self::Explicit
    }
}

/// Reconnect backoff settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Seed of the Fibonacci delay sequence, in milliseconds; the first wait is twice this
    pub base_delay_ms: u64,

    /// Upper bound on any single delay, in milliseconds
    pub max_delay_ms: u64,

    /// Give up after this many failed redials; unbounded when absent
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_RETRY_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_RETRY_DELAY_MS,
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Broker connection manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// AMQP connection URI
    pub uri: String,

    /// Prefix prepended to topic names to form queue names
    pub queue_prefix: String,

    /// Time to wait for a publisher confirmation, in milliseconds
    pub notify_timeout_ms: u64,

    /// Behavior when the confirmation wait elapses
    pub confirm_timeout: ConfirmTimeoutPolicy,

    /// Reconnect backoff
    pub reconnect: ReconnectConfig,

    /// Acknowledgment mode for single-worker consumers
    pub ack_mode: AckMode,

    /// Deployment environment name
    pub environment: String,

    /// Prefetch for parallel consumers; defaults to the worker count
    pub prefetch: Option<u16>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            uri: AmqpEndpoint::default().to_uri(),
            queue_prefix: String::new(),
            notify_timeout_ms: DEFAULT_NOTIFY_TIMEOUT_MS,
            confirm_timeout: ConfirmTimeoutPolicy::default(),
            reconnect: ReconnectConfig::default(),
            ack_mode: AckMode::default(),
            environment: "development".to_string(),
            prefetch: None,
        }
    }
}

impl BrokerConfig {
    /// Create a config for the given URI with all other settings defaulted.
    pub fn with_uri(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            ..Default::default()
        }
    }

    /// Set the queue prefix.
    pub fn with_queue_prefix(mut self, prefix: &str) -> Self {
        self.queue_prefix = prefix.to_string();
        self
    }

    /// Set the acknowledgment mode.
    pub fn with_ack_mode(mut self, mode: AckMode) -> Self {
        self.ack_mode = mode;
        self
    }

    /// Set the environment name.
    pub fn with_environment(mut self, environment: &str) -> Self {
        self.environment = environment.to_string();
        self
    }

    /// Set the confirmation timeout.
    pub fn with_notify_timeout(mut self, timeout: Duration) -> Self {
        self.notify_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the confirmation timeout policy.
    pub fn with_confirm_timeout(mut self, policy: ConfirmTimeoutPolicy) -> Self {
        self.confirm_timeout = policy;
        self
    }

    /// Set the reconnect backoff.
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            uri: std::env::var("BROKER_URI").unwrap_or_else(|_| AmqpEndpoint::from_env().to_uri()),
            queue_prefix: std::env::var("BROKER_QUEUE_PREFIX").unwrap_or_default(),
            notify_timeout_ms: std::env::var("BROKER_NOTIFY_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_NOTIFY_TIMEOUT_MS),
            confirm_timeout: match std::env::var("BROKER_CONFIRM_TIMEOUT").as_deref() {
                Ok("fail") => ConfirmTimeoutPolicy::Fail,
                _ => ConfirmTimeoutPolicy::Log,
            },
            reconnect: ReconnectConfig {
                base_delay_ms: std::env::var("BROKER_RECONNECT_BASE_DELAY_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_BASE_RETRY_DELAY_MS),
                max_delay_ms: std::env::var("BROKER_RECONNECT_MAX_DELAY_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_MAX_RETRY_DELAY_MS),
                max_attempts: std::env::var("BROKER_RECONNECT_MAX_ATTEMPTS")
                    .ok()
                    .and_then(|s| s.parse().ok()),
            },
            ack_mode: match std::env::var("BROKER_ACK_MODE").as_deref() {
                Ok("auto") => AckMode::Auto,
                Ok("manual") => AckMode::Manual,
                _ => AckMode::ProductionOnly,
            },
            environment: std::env::var("APP_ENV").unwrap_or(defaults.environment),
            prefetch: std::env::var("BROKER_PREFETCH")
                .ok()
                .and_then(|s| s.parse().ok()),
        }
    }

    /// Load configuration from an optional TOML file layered under
    /// `BROKER__*` environment variables (e.g. `BROKER__RECONNECT__MAX_DELAY_MS`).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).required(false))
            .add_source(
                config::Environment::with_prefix("BROKER")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_millis(self.notify_timeout_ms)
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Acknowledgment policy for the configured mode and environment.
    pub fn ack_policy(&self) -> AckPolicy {
        self.ack_mode.resolve(self.is_production())
    }

    /// Queue name backing a topic.
    pub fn topic_queue(&self, topic: &str) -> String {
        format!("{}{}", self.queue_prefix, topic)
    }
}
