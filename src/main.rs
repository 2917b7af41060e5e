use std::sync::Arc;

use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use spotmatch::config::AppConfig;
use spotmatch::db::Database;
use spotmatch::engine::MatchingEngine;
use spotmatch::events::EventBus;
use spotmatch::ledger::PgLedger;
use spotmatch::queue::{JobQueue, RedisQueue};
use spotmatch::Book;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "spotmatch=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = AppConfig::load()?;

    tracing::info!("Starting spotmatch matcher v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Environment: {}", config.environment);
    tracing::info!("Instrument: {}", config.instrument);

    // Initialize database and schema
    let db = Database::connect(&config.database_url).await?;
    db.migrate().await?;
    tracing::info!("Database connected");

    // Redis backs the durable job queue (and, in the submission-facing
    // process, the idempotency gate).
    let redis_client = redis::Client::open(config.redis_url.as_str())?;
    let queue = RedisQueue::connect(&redis_client, "spotmatch").await?;
    let restored_jobs = queue.recover_inflight().await?;
    if restored_jobs > 0 {
        tracing::info!(restored_jobs, "re-queued jobs left in flight by a previous run");
    }
    let queue: Arc<dyn JobQueue> = Arc::new(queue);
    tracing::info!("Job queue connected");

    let _ = config.effective_queue_concurrency();

    // Build the core
    let book = Arc::new(Book::new());
    let events = EventBus::default();
    let ledger = Arc::new(PgLedger::new(db.pool().clone()));

    let engine = Arc::new(MatchingEngine::new(
        book,
        ledger,
        events.clone(),
        config.engine_config()?,
    ));

    // The book is a projection; rebuild it from the ledger before serving.
    let recovered = engine.recover_book().await?;
    tracing::info!(recovered, "resting orders restored to the book");

    // Debug fan-out of the event stream
    let mut event_rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match event_rx.recv().await {
                Ok(event) => tracing::debug!(?event, "market event"),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(missed = n, "event logger lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Serialized consumer: one job at a time, strictly in enqueue order.
    let consumer = {
        let engine = engine.clone();
        let queue = queue.clone();
        tokio::spawn(async move { engine.run(queue).await })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
        _ = consumer => {
            tracing::error!("Matching consumer exited unexpectedly");
        }
    }

    Ok(())
}
