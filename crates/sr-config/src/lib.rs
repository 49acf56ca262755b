//! Signal Relay Configuration System
//!
//! TOML-based configuration with environment variable overrides and an
//! atomically swappable snapshot for hot reload.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

mod handle;
mod loader;

pub use handle::ConfigHandle;
pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub delivery: DeliveryConfig,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub dlq: DlqConfig,
    pub heartbeat: HeartbeatConfig,
    pub store: StoreConfig,
    pub http: HttpConfig,
    pub channels: Vec<ChannelConfig>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            delivery: DeliveryConfig::default(),
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            dlq: DlqConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            store: StoreConfig::default(),
            http: HttpConfig::default(),
            channels: Vec::new(),
        }
    }
}

/// Dispatcher worker pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Number of dispatcher workers polling the outbox
    pub workers: usize,
    /// Entries claimed per poll
    pub batch_size: u32,
    /// Idle sleep between empty polls
    pub poll_interval_ms: u64,
    /// Deadline for a single channel send
    pub send_timeout_ms: u64,
    /// Claim age after which a `sending` entry is presumed orphaned
    pub stuck_claim_timeout_secs: u64,
    /// How often stale claims are swept
    pub recovery_interval_secs: u64,
    /// How long shutdown waits for in-flight sends
    pub shutdown_grace_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            batch_size: 20,
            poll_interval_ms: 500,
            send_timeout_ms: 10_000,
            stuck_claim_timeout_secs: 300,
            recovery_interval_secs: 60,
            shutdown_grace_secs: 30,
        }
    }
}

impl DeliveryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn stuck_claim_timeout(&self) -> Duration {
        Duration::from_secs(self.stuck_claim_timeout_secs)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Rolling-window send caps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Per-channel cap per window (overridable per channel)
    pub max_per_window: u32,
    /// Window length
    pub window_ms: u64,
    /// Account-wide cap per window across all channels
    pub global_max_per_window: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_per_window: 20,
            window_ms: 60_000,
            global_max_per_window: 30,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Retry and backoff policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Transient failures tolerated before the entry is dead-lettered
    pub max_retries: u32,
    /// Multiplicative jitter in [0, 1); 0 keeps delays monotonic
    pub jitter_ratio: f64,
    /// Delay used when a provider throttles without a Retry-After hint
    pub rate_limit_fallback_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_backoff_ms: 1_000,
            max_backoff_ms: 600_000,
            max_retries: 5,
            jitter_ratio: 0.0,
            rate_limit_fallback_ms: 30_000,
        }
    }
}

impl RetryConfig {
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn rate_limit_fallback(&self) -> Duration {
        Duration::from_millis(self.rate_limit_fallback_ms)
    }
}

/// Dead-letter recovery sweeper
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DlqConfig {
    pub sweep_interval_secs: u64,
    /// Minimum time an entry stays dead-lettered before auto requeue
    pub quarantine_secs: u64,
    /// Lifetime channel attempts after which auto requeue stops
    pub max_lifetime_attempts: u32,
    /// DLQ entries inspected per sweep
    pub batch_size: u32,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 300,
            quarantine_secs: 900,
            max_lifetime_attempts: 24,
            batch_size: 100,
        }
    }
}

impl DlqConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn quarantine(&self) -> Duration {
        Duration::from_secs(self.quarantine_secs)
    }
}

/// Scheduler liveness heartbeat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub source_id: String,
    /// Write interval; must be shorter than the TTL
    pub interval_secs: u64,
    pub ttl_secs: u64,
    pub check_interval_secs: u64,
    /// Command spawned when a stall is detected (program followed by args)
    pub restart_command: Vec<String>,
    pub restart_cooldown_secs: u64,
    /// Redis URL for a shared heartbeat record; empty keeps it in-process
    pub redis_url: String,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            source_id: "sr-relay".to_string(),
            interval_secs: 10,
            ttl_secs: 30,
            check_interval_secs: 10,
            restart_command: Vec::new(),
            restart_cooldown_secs: 300,
            redis_url: String::new(),
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn restart_cooldown(&self) -> Duration {
        Duration::from_secs(self.restart_cooldown_secs)
    }
}

/// Outbox persistence backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// memory, sqlite or postgres
    pub kind: String,
    pub url: String,
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: "sqlite".to_string(),
            url: "sqlite://./data/outbox.db?mode=rwc".to_string(),
            max_connections: 5,
        }
    }
}

/// Metrics and operator HTTP surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9090,
        }
    }
}

/// A downstream channel that cards can be delivered to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub id: String,
    /// Endpoint used by the HTTP channel client
    #[serde(default)]
    pub url: String,
    /// Overrides `rate_limit.max_per_window` for this channel
    #[serde(default)]
    pub max_per_window: Option<u32>,
}

impl ChannelConfig {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            max_per_window: None,
        }
    }

    pub fn with_max_per_window(mut self, max: u32) -> Self {
        self.max_per_window = Some(max);
        self
    }
}

impl RelayConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: RelayConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Load using the default search paths and environment overrides
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }

    pub fn channel(&self, id: &str) -> Option<&ChannelConfig> {
        self.channels.iter().find(|c| c.id == id)
    }

    pub fn is_known_channel(&self, id: &str) -> bool {
        self.channel(id).is_some()
    }

    /// Effective per-channel cap, honouring overrides
    pub fn channel_max_per_window(&self, id: &str) -> u32 {
        self.channel(id)
            .and_then(|c| c.max_per_window)
            .unwrap_or(self.rate_limit.max_per_window)
    }

    /// Reject configurations the delivery core cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::ValidationError(msg.to_string()));

        if self.delivery.workers == 0 {
            return invalid("delivery.workers must be at least 1");
        }
        if self.delivery.batch_size == 0 {
            return invalid("delivery.batch_size must be at least 1");
        }
        if self.delivery.send_timeout_ms == 0 {
            return invalid("delivery.send_timeout_ms must be positive");
        }
        // A whole batch is sent under one claim; it must not go stale mid-batch
        let batch_budget = self
            .delivery
            .send_timeout()
            .saturating_mul(self.delivery.batch_size);
        if self.delivery.stuck_claim_timeout() <= batch_budget {
            return invalid(
                "delivery.stuck_claim_timeout_secs must exceed batch_size * send_timeout_ms",
            );
        }
        if self.rate_limit.window_ms == 0 {
            return invalid("rate_limit.window_ms must be positive");
        }
        if self.rate_limit.max_per_window == 0 || self.rate_limit.global_max_per_window == 0 {
            return invalid("rate limit caps must be at least 1");
        }
        if self.retry.base_backoff_ms == 0 {
            return invalid("retry.base_backoff_ms must be positive");
        }
        if self.retry.max_backoff_ms < self.retry.base_backoff_ms {
            return invalid("retry.max_backoff_ms must be >= retry.base_backoff_ms");
        }
        if !(0.0..1.0).contains(&self.retry.jitter_ratio) {
            return invalid("retry.jitter_ratio must be in [0, 1)");
        }
        if self.dlq.max_lifetime_attempts <= self.retry.max_retries {
            return invalid("dlq.max_lifetime_attempts must exceed retry.max_retries");
        }
        if self.heartbeat.interval_secs == 0 || self.heartbeat.interval_secs >= self.heartbeat.ttl_secs {
            return invalid("heartbeat.interval_secs must be positive and shorter than heartbeat.ttl_secs");
        }
        if self.heartbeat.check_interval_secs == 0 {
            return invalid("heartbeat.check_interval_secs must be positive");
        }
        if !matches!(self.store.kind.as_str(), "memory" | "sqlite" | "postgres") {
            return Err(ConfigError::ValidationError(format!(
                "store.kind must be memory, sqlite or postgres (got {})",
                self.store.kind
            )));
        }

        let mut seen = std::collections::HashSet::new();
        for channel in &self.channels {
            if channel.id.trim().is_empty() {
                return invalid("channel ids must not be empty");
            }
            if !seen.insert(channel.id.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate channel id: {}",
                    channel.id
                )));
            }
            if channel.max_per_window == Some(0) {
                return Err(ConfigError::ValidationError(format!(
                    "channel {} max_per_window must be at least 1",
                    channel.id
                )));
            }
        }

        Ok(())
    }

    /// Generate an example configuration file
    pub fn example_toml() -> String {
        r#"# Signal Relay Configuration

[delivery]
workers = 4
batch_size = 20
poll_interval_ms = 500
send_timeout_ms = 10000
stuck_claim_timeout_secs = 300
recovery_interval_secs = 60
shutdown_grace_secs = 30

[rate_limit]
max_per_window = 20
window_ms = 60000
global_max_per_window = 30

[retry]
base_backoff_ms = 1000
max_backoff_ms = 600000
max_retries = 5
jitter_ratio = 0.0
rate_limit_fallback_ms = 30000

[dlq]
sweep_interval_secs = 300
quarantine_secs = 900
max_lifetime_attempts = 24
batch_size = 100

[heartbeat]
source_id = "sr-relay"
interval_secs = 10
ttl_secs = 30
check_interval_secs = 10
restart_command = []
restart_cooldown_secs = 300
redis_url = ""

[store]
kind = "sqlite"  # memory, sqlite or postgres
url = "sqlite://./data/outbox.db?mode=rwc"
max_connections = 5

[http]
host = "0.0.0.0"
port = 9090

[[channels]]
id = "alerts-main"
url = "http://localhost:8081/hooks/alerts-main"

[[channels]]
id = "alerts-vip"
url = "http://localhost:8081/hooks/alerts-vip"
max_per_window = 5
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RelayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.delivery.stuck_claim_timeout(), Duration::from_secs(300));
        assert_eq!(config.retry.max_backoff(), Duration::from_secs(600));
    }

    #[test]
    fn test_example_toml_parses_and_validates() {
        let config = RelayConfig::from_toml(&RelayConfig::example_toml()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.channels.len(), 2);
        assert_eq!(config.channel_max_per_window("alerts-vip"), 5);
        assert_eq!(config.channel_max_per_window("alerts-main"), 20);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = RelayConfig::from_toml(
            r#"
            [retry]
            max_retries = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.base_backoff_ms, 1_000);
        assert_eq!(config.delivery.workers, 4);
    }

    #[test]
    fn test_heartbeat_interval_must_be_shorter_than_ttl() {
        let mut config = RelayConfig::default();
        config.heartbeat.interval_secs = 30;
        config.heartbeat.ttl_secs = 30;
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_rejects_duplicate_channels() {
        let mut config = RelayConfig::default();
        config.channels = vec![ChannelConfig::new("1", ""), ChannelConfig::new("1", "")];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_window_caps() {
        let mut config = RelayConfig::default();
        config.rate_limit.max_per_window = 0;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.channels = vec![ChannelConfig::new("1", "").with_max_per_window(0)];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stuck_claim_timeout_must_cover_a_whole_batch() {
        let mut config = RelayConfig::default();
        config.delivery.batch_size = 3;
        config.delivery.send_timeout_ms = 900;
        config.delivery.stuck_claim_timeout_secs = 1;
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));

        config.delivery.send_timeout_ms = 300;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_huge_timeouts_do_not_overflow_validation() {
        let mut config = RelayConfig::default();
        config.delivery.stuck_claim_timeout_secs = u64::MAX;
        assert!(config.validate().is_ok());

        config.delivery.send_timeout_ms = u64::MAX;
        config.delivery.batch_size = u32::MAX;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unknown_store_kind() {
        let mut config = RelayConfig::default();
        config.store.kind = "mongo".to_string();
        assert!(config.validate().is_err());
    }
}
