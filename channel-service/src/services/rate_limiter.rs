//! Outbound send throttling.
//!
//! Burst-sending is how accounts get banned by the upstream network, so
//! every outbound message passes two rolling Redis counters per channel:
//! one per minute, one per hour. Counters are INCR'd first and the key TTL
//! is set only on the first increment of each window.

use crate::config::RateLimitConfig;
use crate::redis_client::RedisClient;
use redis::AsyncCommands;
use tracing::warn;
use uuid::Uuid;

const MINUTE_WINDOW_SECS: i64 = 60;
const HOUR_WINDOW_SECS: i64 = 3600;

/// Which window was exhausted, for operator-facing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitWindow {
    Minute,
    Hour,
}

impl LimitWindow {
    pub fn describe(&self, limit: u32) -> String {
        match self {
            LimitWindow::Minute => format!("per-minute limit of {limit} reached"),
            LimitWindow::Hour => format!("per-hour limit of {limit} reached"),
        }
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    redis: RedisClient,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(redis: RedisClient, config: RateLimitConfig) -> Self {
        Self { redis, config }
    }

    /// Consume one send slot for the channel. `Ok(None)` means the send may
    /// proceed; `Ok(Some(window))` means the window is exhausted.
    ///
    /// Fails open on Redis errors: dropping customer messages because the
    /// counter store hiccuped is the worse failure mode.
    pub async fn check(&self, channel_id: Uuid) -> Option<LimitWindow> {
        match self.try_check(channel_id).await {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(%channel_id, error = %e, "rate limit check failed, allowing send");
                None
            }
        }
    }

    async fn try_check(&self, channel_id: Uuid) -> Result<Option<LimitWindow>, redis::RedisError> {
        let mut conn = self.redis.connection().await;

        let minute_key = format!("rate:{channel_id}:minute");
        let minute: i64 = conn.incr(&minute_key, 1).await?;
        if minute == 1 {
            conn.expire::<_, ()>(&minute_key, MINUTE_WINDOW_SECS).await?;
        }
        if minute > self.config.per_minute as i64 {
            return Ok(Some(LimitWindow::Minute));
        }

        let hour_key = format!("rate:{channel_id}:hour");
        let hour: i64 = conn.incr(&hour_key, 1).await?;
        if hour == 1 {
            conn.expire::<_, ()>(&hour_key, HOUR_WINDOW_SECS).await?;
        }
        if hour > self.config.per_hour as i64 {
            return Ok(Some(LimitWindow::Hour));
        }

        Ok(None)
    }

    pub fn per_minute(&self) -> u32 {
        self.config.per_minute
    }

    pub fn per_hour(&self) -> u32 {
        self.config.per_hour
    }
}
