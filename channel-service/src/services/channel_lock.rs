//! Cross-process mutual exclusion for live channel connections.
//!
//! The protocol allows exactly one live session per credential set; a second
//! connection gets the first kicked and corrupts session state. Workers
//! therefore elect a single connection holder per channel through a Redis
//! `SET NX EX` lock, renewed by a heartbeat at a third of the TTL so
//! transient store latency does not cost ownership.

use crate::redis_client::RedisClient;
use rand::Rng;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

fn lock_key(resource_id: &str) -> String {
    format!("channel:lock:{resource_id}")
}

/// Process-unique owner token: host, pid and a random suffix.
fn make_instance_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".into());
    let pid = std::process::id();
    let suffix: u32 = rand::thread_rng().gen();
    format!("{host}:{pid}:{suffix:08x}")
}

#[derive(Clone)]
pub struct ChannelLock {
    redis: RedisClient,
    instance_id: String,
    ttl: Duration,
    retry_delay: Duration,
    heartbeats: Arc<Mutex<HashMap<String, watch::Sender<()>>>>,
}

impl ChannelLock {
    pub fn new(redis: RedisClient, ttl: Duration, retry_delay: Duration) -> Self {
        Self {
            redis,
            instance_id: make_instance_id(),
            ttl,
            retry_delay,
            heartbeats: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Try to take the lock. Fails closed: a lock held by any other
    /// instance is never stolen.
    pub async fn acquire(&self, resource_id: &str) -> Result<bool, redis::RedisError> {
        let mut conn = self.redis.connection().await;
        let acquired: Option<String> = redis::cmd("SET")
            .arg(lock_key(resource_id))
            .arg(&self.instance_id)
            .arg("NX")
            .arg("EX")
            .arg(self.ttl.as_secs())
            .query_async(&mut conn)
            .await?;

        if acquired.is_some() {
            debug!(resource = %resource_id, owner = %self.instance_id, "lock acquired");
            self.start_heartbeat(resource_id).await;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub async fn acquire_with_retry(
        &self,
        resource_id: &str,
        max_attempts: u32,
    ) -> Result<bool, redis::RedisError> {
        for attempt in 1..=max_attempts {
            if self.acquire(resource_id).await? {
                return Ok(true);
            }
            if attempt < max_attempts {
                tokio::time::sleep(self.retry_delay).await;
            }
        }
        Ok(false)
    }

    /// Admin override: take the lock regardless of the current holder.
    pub async fn force_acquire(&self, resource_id: &str) -> Result<(), redis::RedisError> {
        let mut conn = self.redis.connection().await;
        conn.set_ex::<_, _, ()>(lock_key(resource_id), &self.instance_id, self.ttl.as_secs())
            .await?;
        warn!(resource = %resource_id, owner = %self.instance_id, "lock force-acquired");
        self.start_heartbeat(resource_id).await;
        Ok(())
    }

    /// Release only if we still own it; never release someone else's lock.
    pub async fn release(&self, resource_id: &str) -> Result<bool, redis::RedisError> {
        self.stop_heartbeat(resource_id).await;

        let mut conn = self.redis.connection().await;
        let holder: Option<String> = conn.get(lock_key(resource_id)).await?;
        if holder.as_deref() != Some(self.instance_id.as_str()) {
            return Ok(false);
        }
        conn.del::<_, ()>(lock_key(resource_id)).await?;
        debug!(resource = %resource_id, "lock released");
        Ok(true)
    }

    /// Extend the TTL if (and only if) we still own the lock.
    pub async fn renew(&self, resource_id: &str) -> Result<bool, redis::RedisError> {
        let mut conn = self.redis.connection().await;
        let holder: Option<String> = conn.get(lock_key(resource_id)).await?;
        if holder.as_deref() != Some(self.instance_id.as_str()) {
            return Ok(false);
        }
        let extended: bool = conn
            .expire(lock_key(resource_id), self.ttl.as_secs() as i64)
            .await?;
        Ok(extended)
    }

    pub async fn owns_lock(&self, resource_id: &str) -> Result<bool, redis::RedisError> {
        let mut conn = self.redis.connection().await;
        let holder: Option<String> = conn.get(lock_key(resource_id)).await?;
        Ok(holder.as_deref() == Some(self.instance_id.as_str()))
    }

    /// Release every lock this instance still tracks. Called at shutdown.
    pub async fn release_all(&self) {
        let resources: Vec<String> = {
            let heartbeats = self.heartbeats.lock().await;
            heartbeats.keys().cloned().collect()
        };
        for resource in resources {
            if let Err(e) = self.release(&resource).await {
                warn!(resource = %resource, error = %e, "failed to release lock during shutdown");
            }
        }
        info!("all channel locks released");
    }

    async fn start_heartbeat(&self, resource_id: &str) {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(());
        {
            let mut heartbeats = self.heartbeats.lock().await;
            // Replacing an existing heartbeat stops the old one.
            heartbeats.insert(resource_id.to_string(), shutdown_tx);
        }

        let lock = self.clone();
        let resource = resource_id.to_string();
        let interval = self.ttl / 3;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        debug!(resource = %resource, "lock heartbeat stopped");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        match lock.renew(&resource).await {
                            Ok(true) => {}
                            Ok(false) => {
                                // Ownership lost: a zombie heartbeat renewing a
                                // foreign lock would be worse than losing it.
                                warn!(resource = %resource, "lock ownership lost, stopping heartbeat");
                                let mut heartbeats = lock.heartbeats.lock().await;
                                heartbeats.remove(&resource);
                                break;
                            }
                            Err(e) => {
                                warn!(resource = %resource, error = %e, "lock renew failed, will retry");
                            }
                        }
                    }
                }
            }
        });
    }

    async fn stop_heartbeat(&self, resource_id: &str) {
        let mut heartbeats = self.heartbeats.lock().await;
        if let Some(tx) = heartbeats.remove(resource_id) {
            let _ = tx.send(());
        }
    }
}
