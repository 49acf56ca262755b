//! Delivery core of Signal Relay.
//!
//! The [`Dispatcher`] drains the outbox through the [`RateLimiter`] gate and
//! a [`ChannelClient`], applying the [`RetryPolicy`] to every outcome. The
//! [`DlqSweeper`] gives exhausted entries further chances on its own schedule.

pub mod channel;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod rate_limiter;
pub mod retry;
pub mod sweeper;

pub use channel::{ChannelClient, HttpChannelClient};
pub use dispatcher::{DispatchStats, DispatchStatsSnapshot, Dispatcher};
pub use error::{DeliveryError, Result};
pub use metrics::GaugeReporter;
pub use rate_limiter::{Decision, RateLimiter};
pub use retry::{Action, RetryPolicy};
pub use sweeper::{DlqSweeper, SweepReport};
