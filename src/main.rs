use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Context;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use channel_bridge::channels::{ChannelRegistry, FileProxy, OutboundDispatcher, Poller, spawn_poller};
use channel_bridge::config::BridgeConfig;
use channel_bridge::delivery::{DeliveryQueue, DeliveryWorker, spawn_delivery_workers};
use channel_bridge::http::{AppState, router};
use channel_bridge::store::{Database, LibSqlBackend};
use channel_bridge::telegram::TelegramClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = BridgeConfig::from_env();
    let _log_guard = init_logging(&config);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.http_port,
        db = %config.db_path.display(),
        storage = %config.storage_dir.display(),
        "Channel bridge starting"
    );

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("opening database at {}", config.db_path.display()))?,
    );

    // ── Provider client ─────────────────────────────────────────────────
    let client = TelegramClient::new(config.telegram.clone()).context("building HTTP client")?;

    // ── Background work ─────────────────────────────────────────────────
    let poller = Arc::new(Poller::new(
        Arc::clone(&db),
        client.clone(),
        config.poller.clone(),
    ));
    let (poll_handle, poll_shutdown) = spawn_poller(poller);

    let queue = Arc::new(DeliveryQueue::new(Arc::clone(&db), config.delivery.clone()));
    let worker = Arc::new(DeliveryWorker::new(
        Arc::clone(&db),
        client.clone(),
        Arc::clone(&queue),
    ));
    let (delivery_handles, delivery_shutdown) = spawn_delivery_workers(worker);

    // ── HTTP ────────────────────────────────────────────────────────────
    let state = AppState {
        registry: Arc::new(ChannelRegistry::new(Arc::clone(&db), client.clone())),
        dispatcher: Arc::new(OutboundDispatcher::new(
            Arc::clone(&db),
            client.clone(),
            Arc::clone(&queue),
            config.max_upload_bytes as u64,
        )),
        files: Arc::new(FileProxy::new(Arc::clone(&db), client, config.temp_dir())),
        upload_dir: config.upload_dir(),
    };
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.http_port))
        .await
        .with_context(|| format!("binding port {}", config.http_port))?;
    tracing::info!(port = config.http_port, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await
        .context("HTTP server failed")?;

    // In-flight deliveries finish; nothing new is claimed.
    poll_shutdown.store(true, Ordering::Relaxed);
    delivery_shutdown.store(true, Ordering::Relaxed);
    queue.wake_all();
    let _ = poll_handle.await;
    for handle in delivery_handles {
        let _ = handle.await;
    }

    tracing::info!("Channel bridge stopped");
    Ok(())
}

/// Console logging, plus a daily-rolling file when a log directory is set.
fn init_logging(config: &BridgeConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "channel-bridge.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    guard
}
