//! Shared, atomically swappable configuration snapshot.
//!
//! Components hold a [`ConfigHandle`] and read `snapshot()` whenever they
//! need settings. A reload validates the new configuration and replaces the
//! whole snapshot; an `Arc<RelayConfig>` that was already handed out never
//! changes underneath its reader.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use crate::{ConfigError, ConfigLoader, RelayConfig};

#[derive(Debug, Clone)]
pub struct ConfigHandle {
    tx: Arc<watch::Sender<Arc<RelayConfig>>>,
}

impl ConfigHandle {
    /// Wrap an initial configuration. It is validated like any reload.
    pub fn new(config: RelayConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let (tx, _rx) = watch::channel(Arc::new(config));
        Ok(Self { tx: Arc::new(tx) })
    }

    /// Current immutable snapshot.
    pub fn snapshot(&self) -> Arc<RelayConfig> {
        self.tx.borrow().clone()
    }

    /// Swap in a new snapshot. An invalid configuration leaves the current
    /// one in place.
    pub fn reload(&self, config: RelayConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.tx.send_replace(Arc::new(config));
        info!("Configuration snapshot replaced");
        Ok(())
    }

    /// Re-read configuration through `loader` and swap it in.
    pub fn reload_from(&self, loader: &ConfigLoader) -> Result<(), ConfigError> {
        let config = loader.load()?;
        self.reload(config)
    }

    /// Receiver notified on every successful reload.
    pub fn subscribe(&self) -> watch::Receiver<Arc<RelayConfig>> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reload_swaps_snapshot_without_touching_old_one() {
        let handle = ConfigHandle::new(RelayConfig::default()).unwrap();
        let before = handle.snapshot();

        let mut next = RelayConfig::default();
        next.rate_limit.max_per_window = 1;
        handle.reload(next).unwrap();

        assert_eq!(before.rate_limit.max_per_window, 20);
        assert_eq!(handle.snapshot().rate_limit.max_per_window, 1);
    }

    #[test]
    fn test_invalid_reload_keeps_current_snapshot() {
        let handle = ConfigHandle::new(RelayConfig::default()).unwrap();

        let mut bad = RelayConfig::default();
        bad.delivery.workers = 0;
        assert!(handle.reload(bad).is_err());
        assert_eq!(handle.snapshot().delivery.workers, 4);
    }

    #[tokio::test]
    async fn test_subscribers_see_reloads() {
        let handle = ConfigHandle::new(RelayConfig::default()).unwrap();
        let mut rx = handle.subscribe();

        let mut next = RelayConfig::default();
        next.retry.max_retries = 2;
        handle.reload(next).unwrap();

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().retry.max_retries, 2);
    }
}
