use channel_service::{
    bus::CommandBus,
    config, db, error, logging,
    protocol::{memory::MemoryConnector, ProtocolConnector},
    redis_client::RedisClient,
    services::{
        channel_lock::ChannelLock, credential_store::CredentialStore, fanout::EventFanout,
        ingestion::IngestionPipeline, rate_limiter::RateLimiter,
        session_supervisor::SessionSupervisor,
    },
    state::AppState,
};
use std::sync::Arc;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<(), error::AppError> {
    logging::init_tracing();
    let cfg = Arc::new(config::Config::from_env()?);

    let db = db::init_pool(&cfg.database_url)
        .await
        .map_err(|e| error::AppError::Startup(format!("db: {e}")))?;

    let redis_pool = redis_utils::RedisPool::connect(&cfg.redis_url)
        .await
        .map_err(|e| error::AppError::Startup(format!("redis: {e}")))?;
    let redis = RedisClient::new(redis_pool.manager());

    channel_service::migrations::run_all(&db)
        .await
        .map_err(|e| error::AppError::Startup(format!("database migrations failed: {e}")))?;

    let credential_store = CredentialStore::new(
        db.clone(),
        redis.clone(),
        cfg.credential_master_key,
        cfg.credential_cache_ttl,
    );
    let channel_lock = ChannelLock::new(redis.clone(), cfg.lock.ttl, cfg.lock.acquire_retry_delay);
    let rate_limiter = RateLimiter::new(redis.clone(), cfg.rate_limit.clone());
    let fanout = EventFanout::new(redis.clone());
    let ingestion = IngestionPipeline::new(
        db.clone(),
        redis.clone(),
        fanout.clone(),
        cfg.history_fallback_batch,
    );

    // The loopback connector stands in until a wire connector is linked in.
    let connector: Arc<dyn ProtocolConnector> = MemoryConnector::new();

    let supervisor = SessionSupervisor::new(
        db.clone(),
        credential_store.clone(),
        channel_lock.clone(),
        rate_limiter.clone(),
        ingestion.clone(),
        fanout.clone(),
        connector,
        cfg.session.clone(),
    );

    let state = AppState {
        db: db.clone(),
        redis: redis.clone(),
        config: cfg.clone(),
        credential_store,
        channel_lock: channel_lock.clone(),
        rate_limiter,
        fanout,
        ingestion: ingestion.clone(),
        supervisor: supervisor.clone(),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let history_worker = {
        let ingestion = ingestion.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { ingestion.run_history_worker(shutdown).await })
    };

    let bus = CommandBus::new(state.clone());
    let bus_task = {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = bus.run(shutdown).await {
                tracing::error!(error = %e, "command bus exited");
            }
        })
    };

    supervisor.resume_all().await;
    tracing::info!("channel-service running");

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, draining");

    let _ = shutdown_tx.send(true);
    supervisor.shutdown_all().await;
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        let _ = history_worker.await;
        let _ = bus_task.await;
    })
    .await;

    tracing::info!("channel-service stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
