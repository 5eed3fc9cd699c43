use crate::{
    config::Config,
    redis_client::RedisClient,
    services::{
        channel_lock::ChannelLock, credential_store::CredentialStore, fanout::EventFanout,
        ingestion::IngestionPipeline, rate_limiter::RateLimiter,
        session_supervisor::SessionSupervisor,
    },
};
use sqlx::{Pool, Postgres};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub db: Pool<Postgres>,
    pub redis: RedisClient,
    pub config: Arc<Config>,
    pub credential_store: CredentialStore,
    pub channel_lock: ChannelLock,
    pub rate_limiter: RateLimiter,
    pub fanout: EventFanout,
    pub ingestion: IngestionPipeline,
    pub supervisor: SessionSupervisor,
}
