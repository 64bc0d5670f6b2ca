use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use autoflow::auth::{DbKeyValidator, KeyValidator};
use autoflow::automation::{
    AutomationEngine, DeliveryWorker, RelayWorker, spawn_delivery_worker, spawn_relay_worker,
};
use autoflow::config::EngineConfig;
use autoflow::gateway::{HttpGateway, MessagingGateway};
use autoflow::sequences::DbSequenceService;
use autoflow::store::{Database, LibSqlBackend};
use autoflow::webhooks::{AppState, IngestDeps, WebhookIngestor, router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = EngineConfig::from_env().context("Failed to load configuration")?;

    // ── Logging ─────────────────────────────────────────────────────────
    let file_layer = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "autoflow.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            Some((
                tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer),
                guard,
            ))
        }
        None => None,
    };
    let (file_layer, _log_guard) = match file_layer {
        Some((layer, guard)) => (Some(layer), Some(guard)),
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Autoflow starting");

    // ── Database ────────────────────────────────────────────────────────
    let store: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );

    // ── Background workers ──────────────────────────────────────────────
    let gateway: Arc<dyn MessagingGateway> =
        Arc::new(HttpGateway::new(&config.gateway).context("Failed to build messaging gateway")?);
    let delivery = Arc::new(
        DeliveryWorker::new(Arc::clone(&store), gateway, config.delivery_batch_size)
            .with_lease(config.gateway.timeout * 2),
    );
    let _delivery_handle = spawn_delivery_worker(delivery, config.delivery_poll_interval);

    let relay_poll = config.relay.poll_interval;
    let relay = Arc::new(
        RelayWorker::new(Arc::clone(&store), config.relay.clone())
            .context("Failed to build relay client")?,
    );
    let _relay_handle = spawn_relay_worker(relay, relay_poll);

    // ── HTTP ────────────────────────────────────────────────────────────
    let engine = Arc::new(AutomationEngine::new(Arc::clone(&store)));
    let keys: Arc<dyn KeyValidator> = Arc::new(DbKeyValidator::new(Arc::clone(&store)));
    let ingestor = Arc::new(
        WebhookIngestor::new(IngestDeps {
            store: Arc::clone(&store),
            keys: Arc::clone(&keys),
            sequences: Arc::new(DbSequenceService::new(Arc::clone(&store))),
            engine: Arc::clone(&engine),
        })
        .with_agent_disabled_reason(config.agent_disabled_reason.clone()),
    );
    let app = router(AppState {
        store,
        engine,
        ingestor,
        keys,
    });

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, db = %config.db_path.display(), "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await
        .context("HTTP server failed")?;

    Ok(())
}
