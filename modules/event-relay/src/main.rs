use event_bus::{EventBus, InMemoryBus, NatsBus};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use event_relay_rs::{
    config::{BusType, Config},
    db,
    handlers::default_registry,
    metrics::Metrics,
    repos::{DeadLetterStore, InboxStore, OutboxStore, PgDeadLetterStore, PgInboxStore, PgOutboxStore},
    routes::{self, health::HealthState, metrics::MetricsState},
    CleanupJob, InboxProcessor, OutboxDispatcher, QueueRouter,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // Load environment variables from .env file (if present)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    tracing::info!("Starting event relay...");

    let config = Config::from_env()?;
    tracing::info!(
        host = %config.host,
        port = config.port,
        bus_type = ?config.bus_type,
        worker_id = %config.worker_id,
        "Configuration loaded"
    );

    tracing::info!("Connecting to database...");
    let pool = db::init_pool(&config.database_url).await?;

    tracing::info!("Running migrations...");
    db::run_migrations(&pool).await?;

    let (bus, nats_client): (Arc<dyn EventBus>, Option<async_nats::Client>) =
        match config.bus_type {
            BusType::InMemory => {
                tracing::info!("Using InMemory event bus");
                (
                    Arc::new(InMemoryBus::with_dead_letter_subject(
                        config.dead_letter_subject.clone(),
                    )),
                    None,
                )
            }
            BusType::Nats => {
                tracing::info!(nats_url = %config.nats_url, "Connecting to NATS");
                let client = async_nats::connect(&config.nats_url).await?;
                let bus = NatsBus::new(client.clone(), config.nats_topology());
                bus.ensure_topology().await?;
                (Arc::new(bus), Some(client))
            }
        };

    let metrics = Metrics::new()?;
    let outbox: Arc<dyn OutboxStore> = Arc::new(PgOutboxStore::new(pool.clone()));
    let inbox: Arc<dyn InboxStore> = Arc::new(PgInboxStore::new(pool.clone()));
    let dead_letters: Arc<dyn DeadLetterStore> = Arc::new(PgDeadLetterStore::new(pool.clone()));

    let registry = default_registry()?;
    registry.verify()?;
    tracing::info!(event_types = ?registry.event_types(), "Handlers registered");

    let cancel = CancellationToken::new();
    let mut tasks = tokio::task::JoinSet::new();

    let dispatcher = Arc::new(OutboxDispatcher::new(
        outbox.clone(),
        bus.clone(),
        QueueRouter::default(),
        config.dispatcher(),
        metrics.clone(),
    ));
    let token = cancel.clone();
    tasks.spawn(async move { dispatcher.run(token).await });

    let processor = Arc::new(InboxProcessor::new(
        bus.clone(),
        inbox.clone(),
        dead_letters,
        Arc::new(registry),
        config.inbox(),
        metrics.clone(),
    ));
    let token = cancel.clone();
    tasks.spawn(async move {
        if let Err(e) = processor.run(token.clone()).await {
            tracing::error!(error = %e, "Inbox processor failed to subscribe; shutting down");
            token.cancel();
        }
    });

    let cleanup = Arc::new(CleanupJob::new(
        outbox.clone(),
        inbox.clone(),
        config.cleanup(),
        metrics.clone(),
    ));
    let token = cancel.clone();
    tasks.spawn(async move { cleanup.run(token).await });

    let app = routes::router(
        Arc::new(HealthState {
            db: pool.clone(),
            nats: nats_client,
            metrics: metrics.clone(),
        }),
        Arc::new(MetricsState {
            metrics,
            outbox,
            inbox,
        }),
    );

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    tracing::info!("Event relay listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
        }
        shutdown.cancel();
    });

    let server_token = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_token.cancelled().await })
        .await?;

    // Background loops finish their current batch before exiting
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "Background task panicked");
        }
    }

    pool.close().await;
    tracing::info!("Event relay stopped");
    Ok(())
}
