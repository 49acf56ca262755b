//! Signal Relay
//!
//! Durable outbox delivery service. Producers enqueue rendered cards, a
//! worker pool delivers them to channel endpoints under per-channel and
//! global rate limits, failures are retried with capped backoff and
//! eventually parked in a dead-letter queue that a background sweeper
//! drains again once it is safe to.
//!
//! ## Configuration
//!
//! Settings come from a TOML file (first CLI argument, `SIGNAL_RELAY_CONFIG`,
//! or `relay.toml` in the working directory) with environment overrides.
//! Sending `SIGHUP` re-reads the file and swaps the configuration snapshot.
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `SIGNAL_RELAY_CONFIG` | - | Path to the TOML configuration file |
//! | `SIGNAL_RELAY_STORE_KIND` | `sqlite` | Outbox store: `memory`, `sqlite`, `postgres` |
//! | `SIGNAL_RELAY_STORE_URL` | `sqlite://./data/outbox.db?mode=rwc` | Store connection URL |
//! | `SIGNAL_RELAY_WORKERS` | `4` | Dispatcher workers |
//! | `SIGNAL_RELAY_MAX_PER_WINDOW` | `20` | Per-channel sends per window |
//! | `SIGNAL_RELAY_MAX_RETRIES` | `5` | Retry budget before the DLQ |
//! | `SIGNAL_RELAY_REDIS_URL` | - | Heartbeat store (in-process when unset) |
//! | `SIGNAL_RELAY_HTTP_PORT` | `9090` | Operator API / metrics port |
//! | `RUST_LOG` | `info` | Log level |
//! | `LOG_FORMAT` | `text` | `json` for structured logs |

mod api;

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use sr_common::{Clock, SystemClock};
use sr_config::{ConfigHandle, ConfigLoader, RelayConfig};
use sr_delivery::{Dispatcher, DlqSweeper, GaugeReporter, HttpChannelClient, RateLimiter};
use sr_heartbeat::{
    CommandStallHandler, HeartbeatMonitor, HeartbeatStore, HeartbeatWriter, LogStallHandler,
    MemoryHeartbeatStore, RedisHeartbeatStore, StallHandler,
};
use sr_outbox::{MemoryOutboxStore, Outbox, OutboxStore, PostgresOutboxStore, SqliteOutboxStore};

const GAUGE_REFRESH_INTERVAL: Duration = Duration::from_secs(15);
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    sr_common::logging::init_logging("sr-relay");

    info!("Starting Signal Relay");

    let loader = match std::env::args().nth(1) {
        Some(path) => ConfigLoader::with_path(path),
        None => ConfigLoader::new(),
    };
    let config = ConfigHandle::new(loader.load()?)?;
    let snapshot = config.snapshot();
    info!(
        channels = snapshot.channels.len(),
        workers = snapshot.delivery.workers,
        store = %snapshot.store.kind,
        "Configuration loaded"
    );

    let metrics = PrometheusBuilder::new().install_recorder()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Outbox
    let store = create_outbox_store(&snapshot).await?;
    let outbox = Outbox::new(Arc::clone(&store), config.clone(), Arc::clone(&clock));

    // Delivery
    let client = Arc::new(HttpChannelClient::new(config.clone())?);
    let limiter = Arc::new(RateLimiter::new(config.clone()));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        client,
        limiter,
        config.clone(),
        Arc::clone(&clock),
    ));
    dispatcher.start()?;

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    let sweeper = DlqSweeper::new(Arc::clone(&store), config.clone(), Arc::clone(&clock));
    let shutdown_rx = shutdown_tx.subscribe();
    tasks.push(tokio::spawn(async move { sweeper.run(shutdown_rx).await }));

    let gauges = GaugeReporter::new(Arc::clone(&store), GAUGE_REFRESH_INTERVAL);
    let shutdown_rx = shutdown_tx.subscribe();
    tasks.push(tokio::spawn(async move { gauges.run(shutdown_rx).await }));

    // Heartbeat
    let heartbeat_store = create_heartbeat_store(&snapshot).await?;
    let writer = HeartbeatWriter::new(Arc::clone(&heartbeat_store), config.clone(), Arc::clone(&clock))
        .with_liveness(dispatcher.clone());
    let shutdown_rx = shutdown_tx.subscribe();
    tasks.push(tokio::spawn(async move { writer.run(shutdown_rx).await }));

    let handler: Arc<dyn StallHandler> = if snapshot.heartbeat.restart_command.is_empty() {
        Arc::new(LogStallHandler)
    } else {
        Arc::new(CommandStallHandler::new(snapshot.heartbeat.restart_command.clone()))
    };
    let monitor = Arc::new(HeartbeatMonitor::new(
        heartbeat_store,
        config.clone(),
        Arc::clone(&clock),
        handler,
    ));
    {
        let monitor = Arc::clone(&monitor);
        let shutdown_rx = shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move { monitor.run(shutdown_rx).await }));
    }

    // Configuration reload
    tasks.push(spawn_reload_listener(config.clone(), loader, shutdown_tx.subscribe()));

    // Operator API
    let addr: SocketAddr = format!("{}:{}", snapshot.http.host, snapshot.http.port).parse()?;
    let app = api::router(api::AppState {
        outbox,
        dispatcher: Arc::clone(&dispatcher),
        monitor,
        metrics,
    });
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Operator API listening on http://{}", addr);
    {
        let mut shutdown_rx = shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
            {
                error!(error = %e, "Operator API server failed");
            }
        }));
    }

    info!("Signal Relay started");

    shutdown_signal().await;
    info!("Shutdown signal received...");

    let _ = shutdown_tx.send(());

    if let Err(e) = dispatcher.shutdown().await {
        warn!(error = %e, "Dispatcher did not shut down cleanly");
    }

    if tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, join_tasks(tasks))
        .await
        .is_err()
    {
        warn!("Background tasks did not stop within {:?}", TASK_SHUTDOWN_TIMEOUT);
    }

    info!("Signal Relay shutdown complete");
    Ok(())
}

async fn join_tasks(tasks: Vec<JoinHandle<()>>) {
    for task in tasks {
        let _ = task.await;
    }
}

async fn create_outbox_store(config: &RelayConfig) -> Result<Arc<dyn OutboxStore>> {
    let store_config = &config.store;
    let store: Arc<dyn OutboxStore> = match store_config.kind.as_str() {
        "memory" => {
            warn!("Using in-memory outbox; entries do not survive a restart");
            Arc::new(MemoryOutboxStore::new())
        }
        "sqlite" => {
            let store =
                SqliteOutboxStore::connect(&store_config.url, store_config.max_connections).await?;
            info!("Using SQLite outbox: {}", store_config.url);
            Arc::new(store)
        }
        "postgres" => {
            let store =
                PostgresOutboxStore::connect(&store_config.url, store_config.max_connections).await?;
            info!("Using PostgreSQL outbox");
            Arc::new(store)
        }
        other => {
            return Err(anyhow::anyhow!(
                "Unknown store kind: {}. Use memory, sqlite, or postgres",
                other
            ))
        }
    };

    store.init_schema().await?;
    Ok(store)
}

async fn create_heartbeat_store(config: &RelayConfig) -> Result<Arc<dyn HeartbeatStore>> {
    let redis_url = &config.heartbeat.redis_url;
    if redis_url.is_empty() {
        info!("Using in-process heartbeat store");
        return Ok(Arc::new(MemoryHeartbeatStore::new()));
    }

    let store = RedisHeartbeatStore::connect(redis_url).await?;
    info!("Using Redis heartbeat store");
    Ok(Arc::new(store))
}

/// Re-read configuration on SIGHUP. A rejected reload keeps the running
/// snapshot.
fn spawn_reload_listener(
    config: ConfigHandle,
    loader: ConfigLoader,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut hangup = match signal::unix::signal(signal::unix::SignalKind::hangup()) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "Failed to install SIGHUP handler; reload disabled");
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = hangup.recv() => {
                        info!("SIGHUP received, reloading configuration");
                        if let Err(e) = config.reload_from(&loader) {
                            error!(error = %e, "Configuration reload rejected");
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = (config, loader);
            let _ = shutdown_rx.recv().await;
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
