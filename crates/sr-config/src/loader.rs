//! Finds the relay config file and layers environment overrides on top

use crate::{ConfigError, RelayConfig};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{info, warn};

/// Searched in order when no explicit path is given
const CONFIG_PATHS: &[&str] = &[
    "relay.toml",
    "./config/relay.toml",
    "/etc/signal-relay/relay.toml",
];

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "SIGNAL_RELAY_CONFIG";

/// Configuration loader
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found), apply environment overrides
    /// and validate the result
    pub fn load(&self) -> Result<RelayConfig, ConfigError> {
        let mut config = RelayConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = RelayConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config);
        config.validate()?;

        Ok(config)
    }

    /// The file `load` would read, if any
    pub fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!(?path, "Configured path does not exist, searching defaults");
        }

        if let Ok(path) = env::var(CONFIG_PATH_ENV) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }

    fn apply_env_overrides(&self, config: &mut RelayConfig) {
        // Delivery
        override_parsed("SIGNAL_RELAY_WORKERS", &mut config.delivery.workers);
        override_parsed("SIGNAL_RELAY_BATCH_SIZE", &mut config.delivery.batch_size);
        override_parsed("SIGNAL_RELAY_POLL_INTERVAL_MS", &mut config.delivery.poll_interval_ms);
        override_parsed("SIGNAL_RELAY_SEND_TIMEOUT_MS", &mut config.delivery.send_timeout_ms);
        override_parsed(
            "SIGNAL_RELAY_STUCK_CLAIM_TIMEOUT_SECS",
            &mut config.delivery.stuck_claim_timeout_secs,
        );

        // Rate limiting
        override_parsed("SIGNAL_RELAY_MAX_PER_WINDOW", &mut config.rate_limit.max_per_window);
        override_parsed("SIGNAL_RELAY_WINDOW_MS", &mut config.rate_limit.window_ms);
        override_parsed(
            "SIGNAL_RELAY_GLOBAL_MAX_PER_WINDOW",
            &mut config.rate_limit.global_max_per_window,
        );

        // Retry
        override_parsed("SIGNAL_RELAY_BASE_BACKOFF_MS", &mut config.retry.base_backoff_ms);
        override_parsed("SIGNAL_RELAY_MAX_BACKOFF_MS", &mut config.retry.max_backoff_ms);
        override_parsed("SIGNAL_RELAY_MAX_RETRIES", &mut config.retry.max_retries);

        // Heartbeat
        override_parsed("SIGNAL_RELAY_HEARTBEAT_TTL_SECS", &mut config.heartbeat.ttl_secs);
        if let Ok(val) = env::var("SIGNAL_RELAY_HEARTBEAT_SOURCE_ID") {
            config.heartbeat.source_id = val;
        }
        if let Ok(val) = env::var("SIGNAL_RELAY_REDIS_URL") {
            config.heartbeat.redis_url = val;
        }

        // Store
        if let Ok(val) = env::var("SIGNAL_RELAY_STORE_KIND") {
            config.store.kind = val;
        }
        if let Ok(val) = env::var("SIGNAL_RELAY_STORE_URL") {
            config.store.url = val;
        }

        // HTTP
        if let Ok(val) = env::var("SIGNAL_RELAY_HTTP_HOST") {
            config.http.host = val;
        }
        override_parsed("SIGNAL_RELAY_HTTP_PORT", &mut config.http.port);
    }
}

fn override_parsed<T: FromStr>(key: &str, target: &mut T) {
    if let Ok(val) = env::var(key) {
        match val.parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(key = %key, value = %val, "Ignoring unparsable environment override"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_loads_explicit_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [delivery]
            workers = 2

            [[channels]]
            id = "1"
            url = "http://localhost/1"
            "#
        )
        .unwrap();

        let config = ConfigLoader::with_path(file.path()).load().unwrap();
        assert_eq!(config.delivery.workers, 2);
        assert!(config.is_known_channel("1"));
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[retry]\nmax_backoff_ms = 1\nbase_backoff_ms = 10").unwrap();

        let result = ConfigLoader::with_path(file.path()).load();
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_malformed_toml_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[delivery\nworkers = ").unwrap();

        let result = ConfigLoader::with_path(file.path()).load();
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }
}
