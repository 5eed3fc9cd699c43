//! Command bus round-trip over live Redis pub/sub.

mod common;

use channel_service::bus::commands::{
    Command, CommandEnvelope, CommandResponse, COMMAND_TOPIC,
};
use channel_service::bus::CommandBus;
use channel_service::config::{Config, LockConfig, RateLimitConfig, SessionConfig};
use channel_service::protocol::memory::MemoryConnector;
use channel_service::services::{
    channel_lock::ChannelLock, credential_store::CredentialStore, fanout::EventFanout,
    ingestion::IngestionPipeline, rate_limiter::RateLimiter,
    session_supervisor::SessionSupervisor,
};
use channel_service::state::AppState;
use futures_util::StreamExt;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;

#[ignore = "Requires PostgreSQL and Redis"]
#[tokio::test]
async fn get_status_round_trips_over_the_bus() {
    let db = common::test_pool().await;
    let redis = common::test_redis().await;
    let (channel_id, tenant_id) = common::seed_channel(&db).await;

    let config = Arc::new(Config {
        database_url: common::database_url(),
        redis_url: common::redis_url(),
        credential_master_key: [3u8; 32],
        credential_cache_ttl: Duration::from_secs(60),
        lock: LockConfig {
            ttl: Duration::from_secs(10),
            acquire_retry_delay: Duration::from_millis(50),
        },
        rate_limit: RateLimitConfig {
            per_minute: 1000,
            per_hour: 10000,
        },
        session: SessionConfig {
            reconnect_base_delay: Duration::from_millis(10),
            max_reconnect_attempts: 2,
            max_qr_regenerations: 3,
            reconnect_settle_delay: Duration::from_millis(1),
        },
        history_fallback_batch: 50,
    });

    let store = CredentialStore::new(
        db.clone(),
        redis.clone(),
        config.credential_master_key,
        config.credential_cache_ttl,
    );
    let lock = ChannelLock::new(redis.clone(), config.lock.ttl, config.lock.acquire_retry_delay);
    let limiter = RateLimiter::new(redis.clone(), config.rate_limit.clone());
    let fanout = EventFanout::new(redis.clone());
    let ingestion = IngestionPipeline::new(
        db.clone(),
        redis.clone(),
        fanout.clone(),
        config.history_fallback_batch,
    );
    let supervisor = SessionSupervisor::new(
        db.clone(),
        store.clone(),
        lock.clone(),
        limiter.clone(),
        ingestion.clone(),
        fanout.clone(),
        MemoryConnector::new(),
        config.session.clone(),
    );

    let state = AppState {
        db: db.clone(),
        redis: redis.clone(),
        config,
        credential_store: store,
        channel_lock: lock,
        rate_limiter: limiter,
        fanout,
        ingestion,
        supervisor,
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let bus = CommandBus::new(state);
    let bus_task = tokio::spawn(async move { bus.run(shutdown_rx).await });

    // Subscribe for the response before publishing the command.
    let correlation_id = format!("test-{channel_id}");
    let client = redis::Client::open(common::redis_url()).unwrap();
    let conn = client.get_async_connection().await.unwrap();
    let mut pubsub = conn.into_pubsub();
    pubsub
        .subscribe(format!("bus:resp:{correlation_id}"))
        .await
        .unwrap();

    // Give the bus a moment to establish its subscription.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let envelope = CommandEnvelope {
        correlation_id: correlation_id.clone(),
        command: Command::GetStatus { channel_id },
    };
    let mut publisher = redis.connection().await;
    let _: () = publisher
        .publish(COMMAND_TOPIC, serde_json::to_string(&envelope).unwrap())
        .await
        .unwrap();

    let mut stream = pubsub.on_message();
    let msg = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("timed out waiting for bus response")
        .expect("response stream closed");
    let payload: String = msg.get_payload().unwrap();
    let response: CommandResponse = serde_json::from_str(&payload).unwrap();

    assert!(response.ok, "unexpected error: {:?}", response.error);
    let result = response.result.unwrap();
    assert_eq!(result["status"], "disconnected");
    assert_eq!(result["running_here"], false);
    assert_eq!(result["has_credentials"], false);

    let _ = shutdown_tx.send(true);
    let _ = bus_task.await;
    common::cleanup_channel(&db, channel_id, tenant_id).await;
}
