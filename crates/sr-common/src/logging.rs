//! Structured logging setup.
//!
//! - `LOG_FORMAT=json` selects JSON lines for log aggregation
//! - anything else selects human-readable text
//! - `RUST_LOG` filters levels (default: `info`), e.g.
//!   `RUST_LOG=sr_delivery=debug,sqlx=warn`
//!
//! Delivery code logs with structured fields (`entry_id`, `channel_id`,
//! `event_key`, `retry_count`) so a single entry can be followed end to end.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is unset. Driver chatter stays at warn.
const DEFAULT_FILTER: &str = "info,sqlx=warn,hyper=warn,reqwest=warn";

/// Install the global subscriber. Safe to call once per process.
pub fn init_logging(service_name: &str) {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    let json = log_format.eq_ignore_ascii_case("json");

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(true)
                    .with_target(true),
            )
            .init();
    } else {
        registry.with(fmt::layer().compact().with_target(true)).init();
    }

    tracing::info!(service = %service_name, json, "Logging initialized");
}

/// Best-effort subscriber for tests; ignores an already-installed one.
pub fn init_test_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(fmt::layer().with_test_writer())
        .try_init();
}
