use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct LockConfig {
    pub ttl: Duration,
    pub acquire_retry_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub per_minute: u32,
    pub per_hour: u32,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Base delay for exponential reconnect backoff.
    pub reconnect_base_delay: Duration,
    /// Consecutive retryable disconnects tolerated before terminal error.
    pub max_reconnect_attempts: u32,
    /// QR regenerations tolerated before the login attempt is abandoned.
    pub max_qr_regenerations: u32,
    /// Settle delay between closing a stale handle and opening a new one.
    pub reconnect_settle_delay: Duration,
}

#[derive(Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub credential_master_key: [u8; 32],
    pub credential_cache_ttl: Duration,
    pub lock: LockConfig,
    pub rate_limit: RateLimitConfig,
    pub session: SessionConfig,
    /// Max history entries processed synchronously when the queue is down.
    pub history_fallback_batch: usize,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("database_url", &"[REDACTED]")
            .field("redis_url", &self.redis_url)
            .field("credential_master_key", &"[REDACTED]")
            .field("credential_cache_ttl", &self.credential_cache_ttl)
            .field("lock", &self.lock)
            .field("rate_limit", &self.rate_limit)
            .field("session", &self.session)
            .field("history_fallback_batch", &self.history_fallback_batch)
            .finish()
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, crate::error::AppError> {
        dotenv().ok();

        let database_url = env::var("DATABASE_URL")
            .map_err(|_| crate::error::AppError::Config("DATABASE_URL missing".into()))?;
        let redis_url = env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());

        let master_key_b64 = env::var("CREDENTIAL_MASTER_KEY")
            .map_err(|_| crate::error::AppError::Config("CREDENTIAL_MASTER_KEY missing".into()))?;
        let master_key_bytes = STANDARD.decode(master_key_b64.trim()).map_err(|_| {
            crate::error::AppError::Config("CREDENTIAL_MASTER_KEY invalid base64".into())
        })?;
        if master_key_bytes.len() != 32 {
            return Err(crate::error::AppError::Config(
                "CREDENTIAL_MASTER_KEY must decode to 32 bytes".into(),
            ));
        }
        let mut credential_master_key = [0u8; 32];
        credential_master_key.copy_from_slice(&master_key_bytes);

        Ok(Self {
            database_url,
            redis_url,
            credential_master_key,
            credential_cache_ttl: Duration::from_secs(env_u64("CREDENTIAL_CACHE_TTL_SECS", 3600)),
            lock: LockConfig {
                ttl: Duration::from_secs(env_u64("CHANNEL_LOCK_TTL_SECS", 30)),
                acquire_retry_delay: Duration::from_millis(env_u64(
                    "CHANNEL_LOCK_RETRY_DELAY_MS",
                    500,
                )),
            },
            rate_limit: RateLimitConfig {
                per_minute: env_u32("SEND_RATE_PER_MINUTE", 30),
                per_hour: env_u32("SEND_RATE_PER_HOUR", 500),
            },
            session: SessionConfig {
                reconnect_base_delay: Duration::from_millis(env_u64(
                    "RECONNECT_BASE_DELAY_MS",
                    2000,
                )),
                max_reconnect_attempts: env_u32("MAX_RECONNECT_ATTEMPTS", 5),
                max_qr_regenerations: env_u32("MAX_QR_REGENERATIONS", 5),
                reconnect_settle_delay: Duration::from_millis(env_u64(
                    "RECONNECT_SETTLE_DELAY_MS",
                    300,
                )),
            },
            history_fallback_batch: env_u64("HISTORY_FALLBACK_BATCH", 50) as usize,
        })
    }

    #[cfg(test)]
    pub fn test_defaults() -> Self {
        Self {
            database_url: "postgres://localhost/test".into(),
            redis_url: "redis://127.0.0.1:6379/0".into(),
            credential_master_key: [0u8; 32],
            credential_cache_ttl: Duration::from_secs(60),
            lock: LockConfig {
                ttl: Duration::from_secs(5),
                acquire_retry_delay: Duration::from_millis(50),
            },
            rate_limit: RateLimitConfig {
                per_minute: 30,
                per_hour: 500,
            },
            session: SessionConfig {
                reconnect_base_delay: Duration::from_millis(10),
                max_reconnect_attempts: 5,
                max_qr_regenerations: 5,
                reconnect_settle_delay: Duration::from_millis(1),
            },
            history_fallback_batch: 50,
        }
    }
}
