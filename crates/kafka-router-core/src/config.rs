//! Configuration types for producers, consumer groups and trace propagation.
//!
//! Configuration is loaded from YAML files and validated before use. Every
//! knob is an explicit field with a default; there are no option callbacks.

use std::collections::HashSet;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::consumer::policy::{ErrorPolicy, RetryPolicy};
use crate::error::{ConfigError, ConfigResult};

/// Smallest number of workers a consumer group runs.
pub const MIN_WORKERS: usize = 3;

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RouterConfig {
    /// Trace propagation settings shared by every client.
    #[serde(default)]
    pub tracing: TraceSettings,

    /// Producers, keyed by their `name`.
    #[serde(default)]
    pub producers: Vec<ProducerConfig>,

    /// Consumer groups, keyed by their `name`.
    #[serde(default)]
    pub consumer_groups: Vec<ConsumerGroupConfig>,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Prometheus metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Deployment environment a process runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Dev,
    Test,
    Prod,
    /// Canary deployment; gray backends are preferred when registered.
    Gray,
}

impl Environment {
    /// Canonical lowercase name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dev => "dev",
            Self::Test => "test",
            Self::Prod => "prod",
            Self::Gray => "gray",
        }
    }
}

/// Settings used when building and propagating trace contexts.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TraceSettings {
    /// Name of this service, stamped as the origin of outbound messages.
    #[serde(default)]
    pub service_name: String,

    /// Routing group used when an inbound request carries none.
    #[serde(default)]
    pub default_group: String,

    /// Trace-id prefix marking benchmark (shadow) traffic.
    #[serde(default = "default_benchmark_prefix")]
    pub benchmark_prefix: String,

    /// Environment of this process.
    #[serde(default)]
    pub environment: Environment,

    /// Payloads longer than this are truncated in production logs.
    #[serde(default = "default_max_logged_payload_chars")]
    pub max_logged_payload_chars: usize,
}

impl Default for TraceSettings {
    fn default() -> Self {
        Self {
            service_name: String::new(),
            default_group: String::new(),
            benchmark_prefix: default_benchmark_prefix(),
            environment: Environment::default(),
            max_logged_payload_chars: default_max_logged_payload_chars(),
        }
    }
}

/// Acknowledgement level a producer waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequiredAcks {
    /// Fire and forget.
    None,
    /// Wait for the partition leader only.
    #[default]
    Leader,
    /// Wait for all in-sync replicas.
    All,
}

impl RequiredAcks {
    /// Value of the Kafka `acks` client property.
    #[must_use]
    pub fn as_kafka_value(&self) -> &'static str {
        match self {
            Self::None => "0",
            Self::Leader => "1",
            Self::All => "all",
        }
    }
}

/// Overrides for a shadow or gray producer derived from a primary one.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BackendOverride {
    /// Brokers of the alternate cluster; defaults to the primary's.
    #[serde(default)]
    pub brokers: Option<Vec<String>>,

    /// Topic on the alternate cluster; defaults to the primary's.
    #[serde(default)]
    pub topic: Option<String>,
}

/// Producer configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProducerConfig {
    /// Unique producer name.
    pub name: String,

    /// Bootstrap brokers. Supports `${VAR}` expansion.
    pub brokers: Vec<String>,

    /// Topic every message is sent to.
    pub topic: String,

    /// Block on broker acknowledgement (`true`) or enqueue and return.
    #[serde(default)]
    pub sync: bool,

    /// Acknowledgement policy.
    #[serde(default)]
    pub required_acks: RequiredAcks,

    /// Enable the idempotent producer.
    #[serde(default)]
    pub idempotent: bool,

    /// Maximum in-flight requests per connection.
    #[serde(default = "default_max_open_requests")]
    pub max_open_requests: u32,

    /// Delivery timeout in milliseconds.
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,

    /// Alternate producer for benchmark traffic.
    #[serde(default)]
    pub shadow: Option<BackendOverride>,

    /// Alternate producer for gray (canary) traffic.
    #[serde(default)]
    pub gray: Option<BackendOverride>,
}

impl ProducerConfig {
    /// Minimal producer configuration with defaults for everything else.
    #[must_use]
    pub fn new(name: impl Into<String>, brokers: Vec<String>, topic: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            brokers,
            topic: topic.into(),
            sync: false,
            required_acks: RequiredAcks::default(),
            idempotent: false,
            max_open_requests: default_max_open_requests(),
            message_timeout_ms: default_message_timeout_ms(),
            shadow: None,
            gray: None,
        }
    }

    /// Broker addresses with environment variables expanded.
    ///
    /// A single entry may expand to a comma-separated list.
    #[must_use]
    pub fn brokers(&self) -> Vec<String> {
        expand_brokers(&self.brokers)
    }

    /// Delivery timeout.
    #[must_use]
    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.message_timeout_ms)
    }

    /// Configuration of the producer that serves `over`, named `<name>-<suffix>`.
    #[must_use]
    pub fn derive(&self, over: &BackendOverride, suffix: &str) -> Self {
        Self {
            name: format!("{}-{suffix}", self.name),
            brokers: over.brokers.clone().unwrap_or_else(|| self.brokers.clone()),
            topic: over.topic.clone().unwrap_or_else(|| self.topic.clone()),
            shadow: None,
            gray: None,
            ..self.clone()
        }
    }

    /// Validate the producer configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the name, topic or broker list is empty, or if
    /// idempotence is requested without `acks: all` and a single in-flight
    /// request.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.name.is_empty() {
            return Err(ConfigError::EmptyField {
                name: self.topic.clone(),
                field: "name",
            });
        }
        if self.topic.is_empty() {
            return Err(ConfigError::EmptyField {
                name: self.name.clone(),
                field: "topic",
            });
        }
        if self.brokers().is_empty() {
            return Err(ConfigError::NoBrokers {
                name: self.name.clone(),
            });
        }
        if self.idempotent {
            if self.required_acks != RequiredAcks::All {
                return Err(ConfigError::InvalidAcks {
                    name: self.name.clone(),
                    reason: "idempotent producer requires required_acks: all".to_string(),
                });
            }
            if self.max_open_requests != 1 {
                return Err(ConfigError::InvalidAcks {
                    name: self.name.clone(),
                    reason: format!(
                        "idempotent producer requires max_open_requests: 1, got {}",
                        self.max_open_requests
                    ),
                });
            }
        }
        if self.max_open_requests == 0 {
            return Err(ConfigError::InvalidAcks {
                name: self.name.clone(),
                reason: "max_open_requests must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Where a group with no committed offset starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    Earliest,
    #[default]
    Latest,
}

impl OffsetReset {
    /// Value of the Kafka `auto.offset.reset` client property.
    #[must_use]
    pub fn as_kafka_value(&self) -> &'static str {
        match self {
            Self::Earliest => "earliest",
            Self::Latest => "latest",
        }
    }
}

/// Consumer group configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConsumerGroupConfig {
    /// Unique engine name, used in logs and metrics.
    pub name: String,

    /// Bootstrap brokers. Supports `${VAR}` expansion.
    pub brokers: Vec<String>,

    /// Kafka consumer group id.
    pub group_id: String,

    /// Subscribed topics, in order.
    pub topics: Vec<String>,

    /// Number of concurrent workers; values below [`MIN_WORKERS`] are raised.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Rely on the broker's periodic auto-commit instead of committing
    /// after every successful callback.
    #[serde(default = "default_auto_commit")]
    pub auto_commit: bool,

    /// Callbacks slower than this emit a warning.
    #[serde(default = "default_slow_threshold_ms")]
    pub slow_threshold_ms: u64,

    /// Start position when the group has no committed offset.
    #[serde(default)]
    pub auto_offset_reset: OffsetReset,

    /// Group session timeout in milliseconds.
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    /// Policy for callback panics.
    #[serde(default)]
    pub fault_policy: RetryPolicy,

    /// Policy for callback errors.
    #[serde(default)]
    pub error_policy: ErrorPolicy,
}

impl ConsumerGroupConfig {
    /// Minimal consumer group configuration with defaults for everything else.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        brokers: Vec<String>,
        group_id: impl Into<String>,
        topics: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            brokers,
            group_id: group_id.into(),
            topics,
            worker_count: default_worker_count(),
            auto_commit: default_auto_commit(),
            slow_threshold_ms: default_slow_threshold_ms(),
            auto_offset_reset: OffsetReset::default(),
            session_timeout_ms: default_session_timeout_ms(),
            fault_policy: RetryPolicy::default(),
            error_policy: ErrorPolicy::default(),
        }
    }

    /// Broker addresses with environment variables expanded.
    #[must_use]
    pub fn brokers(&self) -> Vec<String> {
        expand_brokers(&self.brokers)
    }

    /// Slow-callback threshold.
    #[must_use]
    pub fn slow_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_threshold_ms)
    }

    /// Validate the consumer group configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any field is empty or out of range.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.name.is_empty() {
            return Err(ConfigError::EmptyField {
                name: self.group_id.clone(),
                field: "name",
            });
        }
        if self.group_id.is_empty() {
            return Err(ConfigError::EmptyField {
                name: self.name.clone(),
                field: "group_id",
            });
        }
        if self.brokers().is_empty() {
            return Err(ConfigError::NoBrokers {
                name: self.name.clone(),
            });
        }
        if self.topics.is_empty() || self.topics.iter().any(String::is_empty) {
            return Err(ConfigError::NoTopics {
                name: self.name.clone(),
            });
        }
        if self.slow_threshold_ms == 0 {
            return Err(ConfigError::ZeroSlowThreshold {
                name: self.name.clone(),
            });
        }
        Ok(())
    }
}

/// Prometheus metrics configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Whether to enable the metrics endpoint.
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Address for the metrics HTTP server.
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output logs in JSON format (for production).
    #[serde(default)]
    pub json: bool,
}

/// Expand `${VAR_NAME}` from the environment; unset variables become empty.
fn expand_env_vars(s: &str) -> String {
    static ENV_VAR: OnceLock<Regex> = OnceLock::new();
    let re = ENV_VAR.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex")
    });
    re.replace_all(s, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .to_string()
}

fn expand_brokers(raw: &[String]) -> Vec<String> {
    raw.iter()
        .flat_map(|entry| {
            expand_env_vars(entry)
                .split(',')
                .map(|s| s.trim().to_string())
                .collect::<Vec<_>>()
        })
        .filter(|s| !s.is_empty())
        .collect()
}

// Default value functions

fn default_benchmark_prefix() -> String {
    "pts_".to_string()
}

fn default_max_logged_payload_chars() -> usize {
    1000
}

fn default_max_open_requests() -> u32 {
    5
}

fn default_message_timeout_ms() -> u64 {
    30_000
}

/// Half the available parallelism, never below [`MIN_WORKERS`].
#[must_use]
pub fn default_worker_count() -> usize {
    let cpus = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
    (cpus / 2).max(MIN_WORKERS)
}

fn default_auto_commit() -> bool {
    true
}

fn default_slow_threshold_ms() -> u64 {
    3_000
}

fn default_session_timeout_ms() -> u64 {
    10_000
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            address: default_metrics_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Configuration loading and validation

impl RouterConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if
    /// validation fails.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            path: path.display().to_string(),
            source: e,
        })?;

        Self::from_str(&content)
    }

    /// Load configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if parsing or validation fails.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> ConfigResult<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every producer and consumer group, and reject duplicate names.
    ///
    /// # Errors
    ///
    /// Returns the first validation failure.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut seen = HashSet::new();
        for producer in &self.producers {
            producer.validate()?;
            if !seen.insert(producer.name.as_str()) {
                return Err(ConfigError::DuplicateName(producer.name.clone()));
            }
        }

        let mut seen = HashSet::new();
        for group in &self.consumer_groups {
            group.validate()?;
            if !seen.insert(group.name.as_str()) {
                return Err(ConfigError::DuplicateName(group.name.clone()));
            }
        }
        Ok(())
    }
}
