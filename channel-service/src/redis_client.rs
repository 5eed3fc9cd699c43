use redis::aio::ConnectionManager;
use redis::{Client, RedisResult};
use redis_utils::SharedConnectionManager;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct RedisClient {
    manager: SharedConnectionManager,
}

impl RedisClient {
    pub fn new(manager: SharedConnectionManager) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> SharedConnectionManager {
        self.manager.clone()
    }

    pub async fn from_url(url: &str) -> RedisResult<Self> {
        let client = Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self {
            manager: Arc::new(Mutex::new(manager)),
        })
    }

    /// ConnectionManager is cheap to clone; hand out a copy so callers
    /// don't hold the mutex across await points.
    pub async fn connection(&self) -> ConnectionManager {
        let guard = self.manager.lock().await;
        guard.clone()
    }
}
