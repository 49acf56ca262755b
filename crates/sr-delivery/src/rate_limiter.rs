//! Two-tier rolling-window rate limiter.
//!
//! One global window plus one window per channel, each an exact sliding log
//! of admitted send instants. A send is admitted only when both windows are
//! below their caps; admission is recorded in both. Caps and window length are
//! read from the current configuration snapshot on every call, so a reload
//! takes effect without dropping window history.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sr_common::{add_std, elapsed_between};
use sr_config::ConfigHandle;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// Smallest `retry_after` handed out on denial.
const MIN_RETRY_AFTER: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    /// Zero when allowed.
    pub retry_after: Duration,
}

impl Decision {
    fn allow() -> Self {
        Self {
            allowed: true,
            retry_after: Duration::ZERO,
        }
    }

    fn deny(retry_after: Duration) -> Self {
        Self {
            allowed: false,
            retry_after: retry_after.max(MIN_RETRY_AFTER),
        }
    }
}

#[derive(Debug, Default)]
struct RateWindow {
    admitted: VecDeque<DateTime<Utc>>,
}

impl RateWindow {
    /// Drop instants that have left the window ending at `now`.
    fn prune(&mut self, now: DateTime<Utc>, window: Duration) {
        while let Some(&oldest) = self.admitted.front() {
            if elapsed_between(oldest, now) >= window {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
    }

    /// Time until the window drops below `cap`, or `None` if it already is.
    fn wait_for_slot(&self, cap: u32, now: DateTime<Utc>, window: Duration) -> Option<Duration> {
        let cap = cap as usize;
        if self.admitted.len() < cap {
            return None;
        }
        // The entry whose exit brings the count to cap - 1
        let idx = self.admitted.len() - cap;
        let exits_at = add_std(self.admitted[idx], window);
        Some(elapsed_between(now, exits_at))
    }

    fn record(&mut self, now: DateTime<Utc>) {
        self.admitted.push_back(now);
    }

    fn len(&self) -> usize {
        self.admitted.len()
    }
}

#[derive(Debug, Default)]
struct LimiterState {
    global: RateWindow,
    channels: HashMap<String, RateWindow>,
}

pub struct RateLimiter {
    config: ConfigHandle,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(config: ConfigHandle) -> Self {
        Self {
            config,
            state: Mutex::new(LimiterState::default()),
        }
    }

    /// Gate a send on `channel_id` at `now`, recording it when admitted.
    pub fn allow(&self, channel_id: &str, now: DateTime<Utc>) -> Decision {
        let config = self.config.snapshot();
        let window = config.rate_limit.window();
        let global_cap = config.rate_limit.global_max_per_window;
        let channel_cap = config.channel_max_per_window(channel_id);

        let mut state = self.state.lock();
        let LimiterState { global, channels } = &mut *state;
        let channel = channels.entry(channel_id.to_string()).or_default();

        global.prune(now, window);
        channel.prune(now, window);

        let wait = [
            global.wait_for_slot(global_cap, now, window),
            channel.wait_for_slot(channel_cap, now, window),
        ]
        .into_iter()
        .flatten()
        .max();

        match wait {
            Some(retry_after) => Decision::deny(retry_after),
            None => {
                global.record(now);
                channel.record(now);
                Decision::allow()
            }
        }
    }

    /// Sends counted in the current window for `channel_id`.
    pub fn channel_count(&self, channel_id: &str, now: DateTime<Utc>) -> usize {
        let window = self.config.snapshot().rate_limit.window();
        let mut state = self.state.lock();
        match state.channels.get_mut(channel_id) {
            Some(channel) => {
                channel.prune(now, window);
                channel.len()
            }
            None => 0,
        }
    }

    /// Sends counted in the current global window.
    pub fn global_count(&self, now: DateTime<Utc>) -> usize {
        let window = self.config.snapshot().rate_limit.window();
        let mut state = self.state.lock();
        state.global.prune(now, window);
        state.global.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sr_config::{ChannelConfig, RelayConfig};

    fn limiter(per_channel: u32, global: u32, window_ms: u64) -> RateLimiter {
        let mut config = RelayConfig::default();
        config.rate_limit.max_per_window = per_channel;
        config.rate_limit.global_max_per_window = global;
        config.rate_limit.window_ms = window_ms;
        config.channels = vec![
            ChannelConfig::new("1", "http://localhost/1"),
            ChannelConfig::new("2", "http://localhost/2"),
        ];
        RateLimiter::new(ConfigHandle::new(config).unwrap())
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_per_channel_cap_and_retry_after() {
        let limiter = limiter(2, 100, 1_000);
        let t0 = Utc::now();

        assert!(limiter.allow("1", t0).allowed);
        assert!(limiter.allow("1", add_std(t0, ms(100))).allowed);

        let denied = limiter.allow("1", add_std(t0, ms(300)));
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, ms(700));

        // The oldest instant leaves exactly at t0 + window
        assert!(limiter.allow("1", add_std(t0, ms(1_000))).allowed);
    }

    #[test]
    fn test_channels_are_independent() {
        let limiter = limiter(1, 100, 1_000);
        let t0 = Utc::now();

        assert!(limiter.allow("1", t0).allowed);
        assert!(!limiter.allow("1", t0).allowed);
        assert!(limiter.allow("2", t0).allowed);
    }

    #[test]
    fn test_global_cap_applies_across_channels() {
        let limiter = limiter(10, 2, 1_000);
        let t0 = Utc::now();

        assert!(limiter.allow("1", t0).allowed);
        assert!(limiter.allow("2", add_std(t0, ms(200))).allowed);

        let denied = limiter.allow("1", add_std(t0, ms(500)));
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, ms(500));
        assert_eq!(limiter.global_count(add_std(t0, ms(500))), 2);
    }

    #[test]
    fn test_denial_is_not_recorded() {
        let limiter = limiter(1, 100, 1_000);
        let t0 = Utc::now();

        assert!(limiter.allow("1", t0).allowed);
        for i in 1..10 {
            assert!(!limiter.allow("1", add_std(t0, ms(i * 10))).allowed);
        }
        assert_eq!(limiter.channel_count("1", add_std(t0, ms(100))), 1);
        assert_eq!(limiter.global_count(add_std(t0, ms(100))), 1);
    }

    #[test]
    fn test_never_exceeds_cap_in_any_window() {
        let limiter = limiter(3, 100, 1_000);
        let t0 = Utc::now();
        let mut admitted = Vec::new();

        for step in 0..200u64 {
            let now = add_std(t0, ms(step * 37));
            if limiter.allow("1", now).allowed {
                admitted.push(now);
            }
        }

        for (i, start) in admitted.iter().enumerate() {
            let in_window = admitted[i..]
                .iter()
                .take_while(|t| elapsed_between(*start, **t) < ms(1_000))
                .count();
            assert!(in_window <= 3);
        }
    }

    #[test]
    fn test_per_channel_override() {
        let mut config = RelayConfig::default();
        config.rate_limit.max_per_window = 1;
        config.channels = vec![ChannelConfig::new("vip", "http://localhost/vip").with_max_per_window(3)];
        let limiter = RateLimiter::new(ConfigHandle::new(config).unwrap());
        let t0 = Utc::now();

        assert!((0..3).all(|_| limiter.allow("vip", t0).allowed));
        assert!(!limiter.allow("vip", t0).allowed);
    }
}
