//! Configuration for the gateway and the edit consumer.
//!
//! Both binaries read a TOML file (optional) and then apply a handful of
//! environment overrides. Every field has a serde default, so an empty file
//! is a valid configuration for local development.
//!
//! # Configuration Structure
//!
//! ```text
//! GatewayConfig                      (fanout-gateway)
//! ├── bind_addr: String              # "0.0.0.0:8083"
//! ├── shutdown_grace: String         # "10s"
//! ├── hub: HubConfig                 # queue capacities
//! ├── auth: AuthConfig               # auth collaborator endpoint
//! ├── bridge: BridgeConfig           # Redis pub/sub relay
//! └── log: LogConfig                 # durable log producer
//!
//! ConsumerConfig                     (edit-consumer)
//! ├── redis_url / topic / group / partitions
//! ├── poll_timeout, batch_size, max_in_flight, message_deadline
//! ├── subscribe_max_attempts, retry_interval
//! ├── lease_ttl, shutdown_grace
//! └── sqlite_path: Option<String>    # None = in-memory store
//! ```
//!
//! # TOML Example
//!
//! ```toml
//! bind_addr = "0.0.0.0:8083"
//!
//! [auth]
//! url = "http://auth-service:8081/auth/authenticate"
//!
//! [bridge]
//! redis_url = "redis://canvas-live-redis:6379"
//! channel_prefix = "doc:"
//!
//! [log]
//! redis_url = "redis://canvas-live-redis:6379"
//! partitions = 3
//! ```
//!
//! # Environment Overrides
//!
//! | Variable | Applies to |
//! |----------|------------|
//! | `REDIS_URL` | bridge + log (gateway), consumer |
//! | `BIND_ADDR` | gateway |
//! | `AUTH_URL` | gateway |
//! | `SQLITE_PATH` | consumer |

use crate::error::{FanoutError, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Topic name shared by producer and consumer.
pub const DEFAULT_TOPIC: &str = "document-updates";

/// Consumer group identity shared by all consumer replicas.
pub const DEFAULT_GROUP: &str = "document-updates-consumer-group";

fn parse_duration_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

/// Read a TOML config file, or defaults when `path` is `None`.
pub fn load_toml<T: DeserializeOwned + Default>(path: Option<&Path>) -> Result<T> {
    let Some(path) = path else {
        return Ok(T::default());
    };
    let raw = std::fs::read_to_string(path).map_err(|e| {
        FanoutError::Config(format!("Cannot read {}: {}", path.display(), e))
    })?;
    toml::from_str(&raw)
        .map_err(|e| FanoutError::Config(format!("Invalid config {}: {}", path.display(), e)))
}

fn env_override(name: &str, target: &mut String) {
    if let Ok(value) = std::env::var(name) {
        if !value.trim().is_empty() {
            *target = value;
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_true() -> bool {
    true
}

fn default_topic() -> String {
    DEFAULT_TOPIC.to_string()
}

fn default_partitions() -> u32 {
    3
}

fn default_retry_interval() -> String {
    "5s".to_string()
}

fn default_shutdown_grace() -> String {
    "10s".to_string()
}

// ═══════════════════════════════════════════════════════════════════════════════
// GatewayConfig: fanout-gateway
// ═══════════════════════════════════════════════════════════════════════════════

/// Top-level config for the gateway process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Listen address for the HTTP / WebSocket server.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Bounded grace period for draining on shutdown (e.g. "10s").
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: String,

    #[serde(default)]
    pub hub: HubConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub bridge: BridgeConfig,

    #[serde(default)]
    pub log: LogConfig,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8083".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            shutdown_grace: default_shutdown_grace(),
            hub: HubConfig::default(),
            auth: AuthConfig::default(),
            bridge: BridgeConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Load from an optional TOML file and apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config: Self = load_toml(path)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply `REDIS_URL`, `BIND_ADDR` and `AUTH_URL`.
    pub fn apply_env(&mut self) {
        env_override("BIND_ADDR", &mut self.bind_addr);
        env_override("AUTH_URL", &mut self.auth.url);
        env_override("REDIS_URL", &mut self.bridge.redis_url);
        env_override("REDIS_URL", &mut self.log.redis_url);
    }

    /// Reject values that would make the gateway misbehave at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.hub.outbound_queue_capacity == 0 {
            return Err(FanoutError::Config(
                "hub.outbound_queue_capacity must be > 0".to_string(),
            ));
        }
        if self.hub.command_capacity == 0 || self.hub.remote_queue_capacity == 0 {
            return Err(FanoutError::Config(
                "hub queue capacities must be > 0".to_string(),
            ));
        }
        if self.log.partitions == 0 {
            return Err(FanoutError::Config("log.partitions must be > 0".to_string()));
        }
        if self.log.queue_capacity == 0 || self.bridge.publish_queue_capacity == 0 {
            return Err(FanoutError::Config(
                "producer and bridge queue capacities must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn shutdown_grace_duration(&self) -> Duration {
        parse_duration_or(&self.shutdown_grace, Duration::from_secs(10))
    }

    /// Create a config for tests: in-process bridge off, tiny queues.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            shutdown_grace: "1s".to_string(),
            hub: HubConfig::for_testing(),
            auth: AuthConfig::default(),
            bridge: BridgeConfig {
                enabled: false,
                ..Default::default()
            },
            log: LogConfig::default(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HubConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Queue sizing for the hub and its connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Capacity of the hub's command queue (register/unregister/broadcast).
    #[serde(default = "default_command_capacity")]
    pub command_capacity: usize,

    /// Capacity of each connection's outbound queue.
    /// A connection whose queue fills up is dropped.
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,

    /// Capacity of the queue carrying envelopes relayed in by the bridge.
    #[serde(default = "default_remote_queue_capacity")]
    pub remote_queue_capacity: usize,
}

fn default_command_capacity() -> usize {
    1024
}

fn default_outbound_queue_capacity() -> usize {
    256
}

fn default_remote_queue_capacity() -> usize {
    1024
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            command_capacity: default_command_capacity(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
            remote_queue_capacity: default_remote_queue_capacity(),
        }
    }
}

impl HubConfig {
    pub fn for_testing() -> Self {
        Self {
            command_capacity: 64,
            outbound_queue_capacity: 8,
            remote_queue_capacity: 64,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// AuthConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Auth collaborator endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// URL queried with `Authorization: Bearer <token>`.
    #[serde(default = "default_auth_url")]
    pub url: String,

    /// Request timeout (e.g. "5s").
    #[serde(default = "default_auth_timeout")]
    pub timeout: String,
}

fn default_auth_url() -> String {
    "http://auth-service:8081/auth/authenticate".to_string()
}

fn default_auth_timeout() -> String {
    "5s".to_string()
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            url: default_auth_url(),
            timeout: default_auth_timeout(),
        }
    }
}

impl AuthConfig {
    pub fn timeout_duration(&self) -> Duration {
        parse_duration_or(&self.timeout, Duration::from_secs(5))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BridgeConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Cross-instance pub/sub relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Disable to run a single gateway instance without Redis pub/sub.
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Channel name = prefix + document id.
    #[serde(default = "default_channel_prefix")]
    pub channel_prefix: String,

    /// Envelopes waiting to be published. Overflow is dropped (best-effort).
    #[serde(default = "default_publish_queue_capacity")]
    pub publish_queue_capacity: usize,

    /// Fixed interval between reconnect attempts (e.g. "5s").
    #[serde(default = "default_retry_interval")]
    pub reconnect_interval: String,
}

fn default_channel_prefix() -> String {
    "doc:".to_string()
}

fn default_publish_queue_capacity() -> usize {
    1024
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            redis_url: default_redis_url(),
            channel_prefix: default_channel_prefix(),
            publish_queue_capacity: default_publish_queue_capacity(),
            reconnect_interval: default_retry_interval(),
        }
    }
}

impl BridgeConfig {
    pub fn reconnect_interval_duration(&self) -> Duration {
        parse_duration_or(&self.reconnect_interval, Duration::from_secs(5))
    }

    /// Channel carrying envelopes for one document.
    pub fn channel_for(&self, document_id: &str) -> String {
        format!("{}{}", self.channel_prefix, document_id)
    }

    /// Inverse of [`channel_for`](Self::channel_for).
    pub fn document_for<'a>(&self, channel: &'a str) -> Option<&'a str> {
        channel.strip_prefix(self.channel_prefix.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LogConfig: durable log producer
// ═══════════════════════════════════════════════════════════════════════════════

/// Producer side of the durable log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    #[serde(default = "default_topic")]
    pub topic: String,

    /// Number of partition streams. Must match the consumer.
    #[serde(default = "default_partitions")]
    pub partitions: u32,

    /// Edit events waiting to be appended. Overflow is dropped and counted.
    #[serde(default = "default_log_queue_capacity")]
    pub queue_capacity: usize,

    /// Fixed interval between initial connect attempts (e.g. "5s").
    #[serde(default = "default_retry_interval")]
    pub connect_interval: String,
}

fn default_log_queue_capacity() -> usize {
    10_000
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            topic: default_topic(),
            partitions: default_partitions(),
            queue_capacity: default_log_queue_capacity(),
            connect_interval: default_retry_interval(),
        }
    }
}

impl LogConfig {
    pub fn connect_interval_duration(&self) -> Duration {
        parse_duration_or(&self.connect_interval, Duration::from_secs(5))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ConsumerConfig: edit-consumer
// ═══════════════════════════════════════════════════════════════════════════════

/// Top-level config for the consumer worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    #[serde(default = "default_topic")]
    pub topic: String,

    /// Fixed group identity shared by all replicas.
    #[serde(default = "default_group")]
    pub group: String,

    #[serde(default = "default_partitions")]
    pub partitions: u32,

    /// XREADGROUP block timeout. Short so shutdown is noticed quickly.
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout: String,

    /// Maximum entries per XREADGROUP call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Upper bound on concurrently applied document groups.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Deadline for applying one message.
    #[serde(default = "default_message_deadline")]
    pub message_deadline: String,

    /// Attempt ceiling for joining the group.
    #[serde(default = "default_subscribe_max_attempts")]
    pub subscribe_max_attempts: usize,

    /// Fixed interval between connect / subscribe attempts.
    #[serde(default = "default_retry_interval")]
    pub retry_interval: String,

    /// Partition lease time-to-live; renewed every third of it.
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl: String,

    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: String,

    /// SQLite document store path. `None` keeps documents in memory.
    #[serde(default)]
    pub sqlite_path: Option<String>,
}

fn default_group() -> String {
    DEFAULT_GROUP.to_string()
}

fn default_poll_timeout() -> String {
    "100ms".to_string()
}

fn default_batch_size() -> usize {
    32
}

fn default_max_in_flight() -> usize {
    64
}

fn default_message_deadline() -> String {
    "5s".to_string()
}

fn default_subscribe_max_attempts() -> usize {
    20
}

fn default_lease_ttl() -> String {
    "15s".to_string()
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            topic: default_topic(),
            group: default_group(),
            partitions: default_partitions(),
            poll_timeout: default_poll_timeout(),
            batch_size: default_batch_size(),
            max_in_flight: default_max_in_flight(),
            message_deadline: default_message_deadline(),
            subscribe_max_attempts: default_subscribe_max_attempts(),
            retry_interval: default_retry_interval(),
            lease_ttl: default_lease_ttl(),
            shutdown_grace: default_shutdown_grace(),
            sqlite_path: None,
        }
    }
}

impl ConsumerConfig {
    /// Load from an optional TOML file and apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config: Self = load_toml(path)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply `REDIS_URL` and `SQLITE_PATH`.
    pub fn apply_env(&mut self) {
        env_override("REDIS_URL", &mut self.redis_url);
        if let Ok(path) = std::env::var("SQLITE_PATH") {
            if !path.trim().is_empty() {
                self.sqlite_path = Some(path);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.partitions == 0 {
            return Err(FanoutError::Config("partitions must be > 0".to_string()));
        }
        if self.max_in_flight == 0 || self.batch_size == 0 {
            return Err(FanoutError::Config(
                "max_in_flight and batch_size must be > 0".to_string(),
            ));
        }
        if self.subscribe_max_attempts == 0 {
            return Err(FanoutError::Config(
                "subscribe_max_attempts must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.poll_timeout, Duration::from_millis(100))
    }

    pub fn message_deadline_duration(&self) -> Duration {
        parse_duration_or(&self.message_deadline, Duration::from_secs(5))
    }

    pub fn retry_interval_duration(&self) -> Duration {
        parse_duration_or(&self.retry_interval, Duration::from_secs(5))
    }

    pub fn lease_ttl_duration(&self) -> Duration {
        parse_duration_or(&self.lease_ttl, Duration::from_secs(15))
    }

    pub fn shutdown_grace_duration(&self) -> Duration {
        parse_duration_or(&self.shutdown_grace, Duration::from_secs(10))
    }

    /// Retry schedule for joining the group.
    pub fn subscribe_retry(&self) -> crate::resilience::RetryConfig {
        crate::resilience::RetryConfig::fixed(
            self.subscribe_max_attempts,
            self.retry_interval_duration(),
            Duration::from_secs(10),
        )
    }

    /// Create a config for tests: fast polling, short leases.
    pub fn for_testing(redis_url: &str) -> Self {
        Self {
            redis_url: redis_url.to_string(),
            poll_timeout: "20ms".to_string(),
            message_deadline: "1s".to_string(),
            retry_interval: "20ms".to_string(),
            lease_ttl: "900ms".to_string(),
            shutdown_grace: "2s".to_string(),
            ..Default::default()
        }
    }
}
